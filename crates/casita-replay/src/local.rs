//! In-process transport: N analyzer ranks as threads of one process.
//!
//! A [`LocalRouter`] holds per-(receiver, sender, tag) mailboxes and a
//! rendezvous board for collectives; each rank thread talks to it through its
//! own [`LocalComm`] handle. Sends enqueue and never block, receives park on
//! a condvar until a matching message arrives.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::{CommError, Communicator, P2pBuffer, RecvHandle};

type MailboxKey = (u32, u32, u32); // (to, from, tag)

#[derive(Default)]
struct Mailboxes {
    queues: HashMap<MailboxKey, VecDeque<P2pBuffer>>,
}

struct CollectiveBoard {
    seq: u64,
    arrived: usize,
    contributions: Vec<Option<Vec<u64>>>,
    result: Vec<Vec<u64>>,
}

/// Shared state connecting all rank handles of one analyzer run.
pub struct LocalRouter {
    size: u32,
    mail: Mutex<Mailboxes>,
    mail_cv: Condvar,
    board: Mutex<CollectiveBoard>,
    board_cv: Condvar,
}

impl LocalRouter {
    pub fn new(size: u32) -> Arc<Self> {
        Arc::new(Self {
            size,
            mail: Mutex::new(Mailboxes::default()),
            mail_cv: Condvar::new(),
            board: Mutex::new(CollectiveBoard {
                seq: 0,
                arrived: 0,
                contributions: vec![None; size as usize],
                result: Vec::new(),
            }),
            board_cv: Condvar::new(),
        })
    }

    /// The communicator handle for one rank. Panics if `rank >= size`; rank
    /// handles are created once at startup, before any thread runs.
    pub fn comm(self: &Arc<Self>, rank: u32) -> LocalComm {
        assert!(rank < self.size, "rank {rank} out of range");
        LocalComm {
            rank,
            router: Arc::clone(self),
        }
    }
}

/// One rank's endpoint of a [`LocalRouter`].
#[derive(Clone)]
pub struct LocalComm {
    rank: u32,
    router: Arc<LocalRouter>,
}

impl LocalComm {
    fn check_rank(&self, rank: u32) -> Result<(), CommError> {
        if rank >= self.router.size {
            return Err(CommError::RankOutOfRange {
                rank,
                size: self.router.size,
            });
        }
        Ok(())
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn size(&self) -> u32 {
        self.router.size
    }

    fn send(&self, to: u32, tag: u32, buf: &P2pBuffer) -> Result<(), CommError> {
        self.check_rank(to)?;
        let mut mail = self.router.mail.lock();
        mail.queues
            .entry((to, self.rank, tag))
            .or_default()
            .push_back(*buf);
        self.router.mail_cv.notify_all();
        Ok(())
    }

    fn recv(&self, from: u32, tag: u32) -> Result<P2pBuffer, CommError> {
        self.check_rank(from)?;
        let key = (self.rank, from, tag);
        let mut mail = self.router.mail.lock();
        loop {
            if let Some(buf) = mail.queues.get_mut(&key).and_then(VecDeque::pop_front) {
                return Ok(buf);
            }
            self.router.mail_cv.wait(&mut mail);
        }
    }

    fn recv_any(&self, tag: u32) -> Result<(u32, P2pBuffer), CommError> {
        let mut mail = self.router.mail.lock();
        loop {
            // deterministic scan order: lowest sender rank first
            for from in 0..self.router.size {
                let key = (self.rank, from, tag);
                if let Some(buf) = mail.queues.get_mut(&key).and_then(VecDeque::pop_front) {
                    return Ok((from, buf));
                }
            }
            self.router.mail_cv.wait(&mut mail);
        }
    }

    fn irecv(&self, from: u32, tag: u32) -> Result<RecvHandle, CommError> {
        self.check_rank(from)?;
        Ok(RecvHandle { from, tag })
    }

    fn complete(&self, handle: RecvHandle) -> Result<P2pBuffer, CommError> {
        self.recv(handle.from, handle.tag)
    }

    fn allgather(&self, value: u64) -> Result<Vec<u64>, CommError> {
        let rows = self.allgather_vec(std::slice::from_ref(&value))?;
        Ok(rows.into_iter().map(|row| row[0]).collect())
    }

    fn allgather_vec(&self, values: &[u64]) -> Result<Vec<Vec<u64>>, CommError> {
        let mut board = self.router.board.lock();
        let entry_seq = board.seq;
        let slot = self.rank as usize;
        debug_assert!(board.contributions[slot].is_none());
        board.contributions[slot] = Some(values.to_vec());
        board.arrived += 1;

        if board.arrived == self.router.size as usize {
            board.result = board
                .contributions
                .iter_mut()
                .map(|c| c.take().unwrap_or_default())
                .collect();
            board.arrived = 0;
            board.seq += 1;
            self.router.board_cv.notify_all();
        } else {
            while board.seq == entry_seq {
                self.router.board_cv.wait(&mut board);
            }
        }
        Ok(board.result.clone())
    }
}
