//! Graph nodes: one endpoint of a region instance on one stream.

use compact_str::CompactString;

use casita_types::{Counter, FunctionKind, Paradigm, RecordKind, RegionId, RequestId, StreamId};

/// Opaque index of a node in the graph's dense node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeRef(u32);

impl NodeRef {
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

/// Opaque attachment held by a node while a rule is pending. Consumed exactly
/// once by the rule that uses it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NodePayload {
    #[default]
    None,
    /// Partner stream of a blocking point-to-point operation.
    MpiPartner(StreamId),
    /// Pending non-blocking request, owned by the stream's request table.
    MpiRequest(RequestId),
    /// Requests a wait-all has to complete.
    WaitallRequests(Vec<RequestId>),
}

/// One enter/leave/atomic record of a region instance.
#[derive(Debug, Clone)]
pub struct Node {
    pub time: u64,
    pub stream: StreamId,
    pub region: RegionId,
    pub name: CompactString,
    pub kind: RecordKind,
    pub function: FunctionKind,
    pub(crate) partner: Option<NodeRef>,
    pub(crate) referenced_stream: Option<StreamId>,
    pub(crate) counters: Vec<(Counter, u64)>,
    pub(crate) payload: NodePayload,
    pub(crate) mpi_blocking: bool,
    /// Position of this node in its stream's ordered node list; backward
    /// walks start from here so they are O(distance).
    pub(crate) stream_index: u32,
}

impl Node {
    pub fn is_enter(&self) -> bool {
        self.kind == RecordKind::Enter
    }

    pub fn is_leave(&self) -> bool {
        self.kind == RecordKind::Leave
    }

    pub fn is_atomic(&self) -> bool {
        self.kind == RecordKind::Atomic
    }

    pub fn paradigm(&self) -> Paradigm {
        self.function.paradigm()
    }

    /// The matching leave of an enter (or vice versa), once paired.
    pub fn partner(&self) -> Option<NodeRef> {
        self.partner
    }

    pub fn referenced_stream(&self) -> Option<StreamId> {
        self.referenced_stream
    }

    /// Record the cross-stream dependency target. The id is set at most
    /// once; a second differing assignment is dropped with a warning.
    pub fn set_referenced_stream(&mut self, stream: StreamId) -> bool {
        match self.referenced_stream {
            None => {
                self.referenced_stream = Some(stream);
                true
            }
            Some(existing) if existing == stream => false,
            Some(existing) => {
                tracing::warn!(
                    node = %self.name,
                    %existing,
                    requested = %stream,
                    "referenced stream already set, keeping existing"
                );
                false
            }
        }
    }

    pub fn counter(&self, counter: Counter) -> Option<u64> {
        self.counters
            .iter()
            .find(|(c, _)| *c == counter)
            .map(|(_, v)| *v)
    }

    /// Set a counter slot. Slots only grow: a smaller value never replaces a
    /// larger one.
    pub fn set_counter(&mut self, counter: Counter, value: u64) {
        match self.counters.iter_mut().find(|(c, _)| *c == counter) {
            Some((_, slot)) => *slot = (*slot).max(value),
            None => self.counters.push((counter, value)),
        }
    }

    pub fn add_counter(&mut self, counter: Counter, value: u64) {
        match self.counters.iter_mut().find(|(c, _)| *c == counter) {
            Some((_, slot)) => *slot = slot.saturating_add(value),
            None => self.counters.push((counter, value)),
        }
    }

    pub fn counters(&self) -> &[(Counter, u64)] {
        &self.counters
    }

    pub fn payload(&self) -> &NodePayload {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: NodePayload) {
        self.payload = payload;
    }

    /// Consume the payload, leaving `None` behind.
    pub fn take_payload(&mut self) -> NodePayload {
        std::mem::take(&mut self.payload)
    }

    /// Whether blame walks treat this node as a blocking MPI boundary.
    pub fn is_mpi_blocking(&self) -> bool {
        self.mpi_blocking
    }

    pub fn mark_mpi_blocking(&mut self) {
        self.mpi_blocking = true;
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index as usize
    }
}
