//! Event streams: per-location ordered node lists plus the per-paradigm
//! pending-operation tables (non-blocking MPI requests, kernels awaiting
//! synchronization).

use std::collections::VecDeque;

use compact_str::CompactString;
use rustc_hash::FxHashMap;

use casita_replay::{P2P_BUF_SIZE, RecvHandle};
use casita_types::{RequestId, StreamId, StreamKind};

use crate::node::NodeRef;

// ── Pending MPI requests ────────────────────────────────────────

/// Bookkeeping for one non-blocking MPI operation between its leave and the
/// wait that completes it.
#[derive(Debug, Clone)]
pub struct MpiRequestRecord {
    pub request: RequestId,
    /// The Isend/Irecv leave node that created the record.
    pub msg_node: NodeRef,
    /// Our own timestamps as sent to the partner.
    pub send_buffer: [u64; P2P_BUF_SIZE],
    /// The partner's timestamps, valid once `pending_recv` has completed.
    pub recv_buffer: Option<[u64; P2P_BUF_SIZE]>,
    /// Outstanding non-blocking replay receive, completed by the wait rule.
    pub pending_recv: Option<RecvHandle>,
    pub partner_rank: u32,
    pub partner_stream: StreamId,
}

#[derive(Default)]
pub struct MpiStreamState {
    pending: FxHashMap<u64, MpiRequestRecord>,
    /// Requests not yet claimed by a wait, in creation order.
    open: Vec<RequestId>,
}

impl MpiStreamState {
    /// Register a pending request. A duplicate id replaces the stale record
    /// with a warning (duplicate ids are an invariant violation in the trace).
    pub fn add_pending(&mut self, record: MpiRequestRecord) {
        let id = record.request;
        if self.pending.insert(id.0, record).is_some() {
            tracing::warn!(request = id.0, "duplicate pending MPI request id");
        } else {
            self.open.push(id);
        }
    }

    pub fn pending(&self, request: RequestId) -> Option<&MpiRequestRecord> {
        self.pending.get(&request.0)
    }

    pub fn pending_mut(&mut self, request: RequestId) -> Option<&mut MpiRequestRecord> {
        self.pending.get_mut(&request.0)
    }

    /// Remove a completed request from the table.
    pub fn remove_pending(&mut self, request: RequestId) -> Option<MpiRequestRecord> {
        self.open.retain(|r| *r != request);
        self.pending.remove(&request.0)
    }

    /// Claim a specific request so later waits no longer see it as open.
    pub fn claim(&mut self, request: RequestId) -> bool {
        let had = self.open.contains(&request);
        self.open.retain(|r| *r != request);
        had
    }

    /// Claim every request not yet attached to a wait, in creation order.
    pub fn claim_open(&mut self) -> Vec<RequestId> {
        std::mem::take(&mut self.open)
    }

    /// Claim the oldest unclaimed request, if any.
    pub fn claim_oldest(&mut self) -> Option<RequestId> {
        if self.open.is_empty() {
            None
        } else {
            Some(self.open.remove(0))
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

// ── Pending kernels ─────────────────────────────────────────────

#[derive(Default)]
pub struct DeviceStreamState {
    /// Kernel leave nodes awaiting synchronization, oldest first.
    pending_kernels: VecDeque<NodeRef>,
}

impl DeviceStreamState {
    pub fn push_pending_kernel(&mut self, kernel_leave: NodeRef) {
        self.pending_kernels.push_back(kernel_leave);
    }

    pub fn first_pending_kernel(&self) -> Option<NodeRef> {
        self.pending_kernels.front().copied()
    }

    pub fn clear_pending_kernels(&mut self) {
        self.pending_kernels.clear();
    }

    pub fn pending_kernel_count(&self) -> usize {
        self.pending_kernels.len()
    }
}

// ── The stream itself ───────────────────────────────────────────

/// One physical location: host thread, MPI rank process or device stream.
pub struct EventStream {
    pub id: StreamId,
    pub name: CompactString,
    pub kind: StreamKind,
    /// Nodes in timestamp order, indexed by `Node::stream_index`.
    pub(crate) nodes: Vec<NodeRef>,
    /// Stack of unmatched enters, for leave pairing.
    pub(crate) open_enters: Vec<NodeRef>,
    pub mpi: MpiStreamState,
    pub device: DeviceStreamState,
}

impl EventStream {
    pub(crate) fn new(id: StreamId, name: CompactString, kind: StreamKind) -> Self {
        Self {
            id,
            name,
            kind,
            nodes: Vec::new(),
            open_enters: Vec::new(),
            mpi: MpiStreamState::default(),
            device: DeviceStreamState::default(),
        }
    }

    pub fn is_device(&self) -> bool {
        self.kind == StreamKind::Device
    }

    pub fn is_host(&self) -> bool {
        self.kind != StreamKind::Device
    }

    pub fn nodes(&self) -> &[NodeRef] {
        &self.nodes
    }

    pub fn first_node(&self) -> Option<NodeRef> {
        self.nodes.first().copied()
    }

    pub fn last_node(&self) -> Option<NodeRef> {
        self.nodes.last().copied()
    }
}

// ── Stream registry ─────────────────────────────────────────────

/// All streams of one analyzer rank, with host/device classification.
#[derive(Default)]
pub struct StreamGroup {
    streams: Vec<EventStream>,
    index: FxHashMap<u64, usize>,
}

impl StreamGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream. Re-registering an id keeps the existing stream.
    pub fn register(&mut self, id: StreamId, name: impl Into<CompactString>, kind: StreamKind) {
        if self.index.contains_key(&id.0) {
            return;
        }
        self.index.insert(id.0, self.streams.len());
        self.streams.push(EventStream::new(id, name.into(), kind));
    }

    pub fn get(&self, id: StreamId) -> Option<&EventStream> {
        self.index.get(&id.0).map(|i| &self.streams[*i])
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut EventStream> {
        self.index.get(&id.0).map(|i| &mut self.streams[*i])
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.index.contains_key(&id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventStream> {
        self.streams.iter()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn host_ids(&self) -> Vec<StreamId> {
        self.streams
            .iter()
            .filter(|s| s.is_host())
            .map(|s| s.id)
            .collect()
    }

    pub fn device_ids(&self) -> Vec<StreamId> {
        self.streams
            .iter()
            .filter(|s| s.is_device())
            .map(|s| s.id)
            .collect()
    }
}
