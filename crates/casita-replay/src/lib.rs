//! Replay protocol for cross-rank timestamp exchange.
//!
//! Analysis rules that need remote data reproduce the communication pattern
//! of the analyzed application: every point-to-point operation in the trace
//! has a matching replay message between the analyzer ranks that own the two
//! streams. Two tags keep the directions apart: `REPLAY` follows the original
//! message direction, `REVERSE_REPLAY` is the back-channel carrying the
//! partner's timestamps (and, later, critical-path handoff tokens).

use std::fmt;

use bitflags::bitflags;

pub mod local;

pub use local::{LocalComm, LocalRouter};

// ── Protocol constants ──────────────────────────────────────────

/// Tag for messages replaying the original communication direction.
pub const REPLAY_TAG: u32 = 0xCA51;
/// Tag for the back-channel (timestamp exchange, critical-path handoff).
pub const REVERSE_REPLAY_TAG: u32 = 0xCA52;

/// Fixed length of every point-to-point replay message, in u64 slots.
pub const P2P_BUF_SIZE: usize = 5;
/// Index of the op-kind slot.
pub const P2P_BUF_LAST: usize = P2P_BUF_SIZE - 1;

/// Slot layout: `[start_time, stop_time, enter_id, leave_id, op_kind]`.
pub type P2pBuffer = [u64; P2P_BUF_SIZE];

bitflags! {
    /// Kind of the MPI operation a replay message originates from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpKind: u64 {
        const SEND  = 1 << 0;
        const RECV  = 1 << 1;
        const ISEND = 1 << 2;
        const IRECV = 1 << 3;
        const COLL  = 1 << 4;
        const WAIT  = 1 << 5;
    }
}

/// Assemble a replay buffer from an operation's endpoints.
pub fn p2p_buffer(start: u64, stop: u64, enter_id: u64, leave_id: u64, op: OpKind) -> P2pBuffer {
    [start, stop, enter_id, leave_id, op.bits()]
}

/// The op-kind slot of a received buffer. Unknown bits are dropped.
pub fn buffer_op_kind(buf: &P2pBuffer) -> OpKind {
    OpKind::from_bits_truncate(buf[P2P_BUF_LAST])
}

// ── Errors ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    RankOutOfRange { rank: u32, size: u32 },
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankOutOfRange { rank, size } => {
                write!(f, "rank {rank} out of range for communicator of size {size}")
            }
        }
    }
}

impl std::error::Error for CommError {}

// ── Communicator ────────────────────────────────────────────────

/// Completion handle of a non-blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvHandle {
    pub from: u32,
    pub tag: u32,
}

/// The communication surface the replay layer and the critical-path engine
/// need from a transport. Sends are buffered and never block; receives block
/// until a matching message arrives. The analyzer replays the application's
/// own pattern in trace order per rank, which guarantees every receive is
/// eventually matched.
pub trait Communicator: Send {
    fn rank(&self) -> u32;

    fn size(&self) -> u32;

    /// Buffered send of one replay message to `to`.
    fn send(&self, to: u32, tag: u32, buf: &P2pBuffer) -> Result<(), CommError>;

    /// Blocking receive of the next message from `from` with `tag`.
    fn recv(&self, from: u32, tag: u32) -> Result<P2pBuffer, CommError>;

    /// Blocking receive from any rank; returns the source rank.
    fn recv_any(&self, tag: u32) -> Result<(u32, P2pBuffer), CommError>;

    /// Post a non-blocking receive. The transfer is completed by
    /// [`Communicator::complete`].
    fn irecv(&self, from: u32, tag: u32) -> Result<RecvHandle, CommError>;

    /// Complete a previously posted non-blocking receive.
    fn complete(&self, handle: RecvHandle) -> Result<P2pBuffer, CommError>;

    /// Gather one value from every rank, in rank order.
    fn allgather(&self, value: u64) -> Result<Vec<u64>, CommError>;

    /// Gather one fixed-size slice from every rank, in rank order. All ranks
    /// must pass slices of the same length.
    fn allgather_vec(&self, values: &[u64]) -> Result<Vec<Vec<u64>>, CommError>;

    /// Element-wise sum across all ranks.
    fn allreduce_sum(&self, values: &[u64]) -> Result<Vec<u64>, CommError> {
        let gathered = self.allgather_vec(values)?;
        let mut sums = vec![0u64; values.len()];
        for contribution in &gathered {
            for (slot, value) in sums.iter_mut().zip(contribution) {
                *slot = slot.saturating_add(*value);
            }
        }
        Ok(sums)
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.allgather(0).map(|_| ())
    }
}
