//! The causal event graph of one analyzer rank.
//!
//! Ingestion appends nodes per stream in timestamp order, pairs enters with
//! leaves, and chains consecutive nodes of a stream with intra-stream edges.
//! Analysis rules later add cross-stream dependencies, blocking flags and
//! blame on top; nothing is ever removed.

use std::fmt;

use compact_str::CompactString;

use casita_types::{FunctionKind, Paradigm, RecordKind, RegionId, StreamId, StreamKind};

mod edge;
mod graph;
mod node;
mod stream;

pub use edge::{Edge, EdgeKind, EdgeRef};
pub use graph::Graph;
pub use node::{Node, NodePayload, NodeRef};
pub use stream::{DeviceStreamState, EventStream, MpiRequestRecord, MpiStreamState, StreamGroup};

// ── Errors ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    UnknownStream(StreamId),
    TimestampRegress {
        stream: StreamId,
        time: u64,
        last: u64,
    },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownStream(stream) => write!(f, "unknown stream {stream}"),
            Self::TimestampRegress { stream, time, last } => {
                write!(
                    f,
                    "timestamp regression on stream {stream}: {time} after {last}"
                )
            }
        }
    }
}

impl std::error::Error for GraphError {}

// ── Backward walks ──────────────────────────────────────────────

/// Verdict of a backward-walk callback for the node it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    /// Include the node, then stop.
    Stop,
}

// ── The event graph ─────────────────────────────────────────────

/// Graph arena plus the stream registry, kept consistent by `add_node`.
#[derive(Default)]
pub struct EventGraph {
    pub graph: Graph,
    pub streams: StreamGroup,
}

impl EventGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_stream(
        &mut self,
        id: StreamId,
        name: impl Into<CompactString>,
        kind: StreamKind,
    ) {
        self.streams.register(id, name, kind);
    }

    /// Append one record to its stream: creates the node, pairs a leave with
    /// the innermost open enter, and chains it to the stream's previous node.
    ///
    /// Fails when the stream is unknown or the timestamp regresses; a leave
    /// without an open enter is reported and left unpaired.
    pub fn add_node(
        &mut self,
        stream_id: StreamId,
        time: u64,
        kind: RecordKind,
        function: FunctionKind,
        region: RegionId,
        name: impl Into<CompactString>,
    ) -> Result<NodeRef, GraphError> {
        let stream = self
            .streams
            .get(stream_id)
            .ok_or(GraphError::UnknownStream(stream_id))?;
        if let Some(last) = stream.last_node() {
            let last_time = self.graph.node(last).time;
            if time < last_time {
                return Err(GraphError::TimestampRegress {
                    stream: stream_id,
                    time,
                    last: last_time,
                });
            }
        }

        let stream_index = stream.nodes().len() as u32;
        let previous = stream.last_node();
        let node_ref = self.graph.push_node(Node {
            time,
            stream: stream_id,
            region,
            name: name.into(),
            kind,
            function,
            partner: None,
            referenced_stream: None,
            counters: Vec::new(),
            payload: NodePayload::None,
            mpi_blocking: false,
            stream_index,
        });

        let stream = self.streams.get_mut(stream_id).expect("stream exists");
        stream.nodes.push(node_ref);
        match kind {
            RecordKind::Enter => stream.open_enters.push(node_ref),
            RecordKind::Leave => match stream.open_enters.pop() {
                Some(enter) => {
                    self.graph.node_mut(enter).partner = Some(node_ref);
                    self.graph.node_mut(node_ref).partner = Some(enter);
                }
                None => {
                    tracing::warn!(stream = %stream_id, time, "leave without matching enter");
                }
            },
            RecordKind::Atomic => {}
        }

        if let Some(previous) = previous {
            self.graph.add_edge(
                previous,
                node_ref,
                function.paradigm(),
                EdgeKind::None,
                false,
            );
        }
        Ok(node_ref)
    }

    pub fn node(&self, node: NodeRef) -> &Node {
        self.graph.node(node)
    }

    pub fn node_mut(&mut self, node: NodeRef) -> &mut Node {
        self.graph.node_mut(node)
    }

    /// Convenience for the common "add a cross-stream dependency" case.
    pub fn add_edge(
        &mut self,
        from: NodeRef,
        to: NodeRef,
        paradigm: Paradigm,
        kind: EdgeKind,
    ) -> EdgeRef {
        self.graph.add_edge(from, to, paradigm, kind, false)
    }

    /// The last node on `stream` with `time <= at`, found by binary search.
    /// Falls back to the stream's first node when every node is later, so
    /// callers can detect (and report) the inverted case themselves.
    pub fn find_last_node_before(&self, stream: StreamId, at: u64) -> Option<NodeRef> {
        let nodes = self.streams.get(stream)?.nodes();
        if nodes.is_empty() {
            return None;
        }
        let position = nodes.partition_point(|n| self.graph.node(*n).time <= at);
        if position == 0 {
            nodes.first().copied()
        } else {
            nodes.get(position - 1).copied()
        }
    }

    /// The last leave node on `stream` with `time <= at`.
    pub fn find_last_leave_before(&self, stream: StreamId, at: u64) -> Option<NodeRef> {
        let nodes = self.streams.get(stream)?.nodes();
        let position = nodes.partition_point(|n| self.graph.node(*n).time <= at);
        nodes[..position]
            .iter()
            .rev()
            .copied()
            .find(|n| self.graph.node(*n).is_leave())
    }

    /// The first node on `stream` with exactly the given timestamp. Section
    /// references serialize as `(stream, time)` pairs and resolve through
    /// this.
    pub fn node_at(&self, stream: StreamId, time: u64) -> Option<NodeRef> {
        let nodes = self.streams.get(stream)?.nodes();
        let position = nodes.partition_point(|n| self.graph.node(*n).time < time);
        nodes
            .get(position)
            .copied()
            .filter(|n| self.graph.node(*n).time == time)
    }

    pub fn last_node(&self, stream: StreamId) -> Option<NodeRef> {
        self.streams.get(stream)?.last_node()
    }

    /// Walk the stream of `start` backward, starting at `start` itself, until
    /// the callback stops the walk or the stream is exhausted. Ordering is
    /// stable: strictly decreasing stream position.
    pub fn walk_backward(&self, start: NodeRef, mut callback: impl FnMut(NodeRef) -> WalkControl) {
        let stream_id = self.graph.node(start).stream;
        let Some(stream) = self.streams.get(stream_id) else {
            return;
        };
        let start_index = self.graph.node(start).stream_index();
        for index in (0..=start_index).rev() {
            let node = stream.nodes()[index];
            if callback(node) == WalkControl::Stop {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casita_types::Counter;

    fn graph_with_stream() -> EventGraph {
        let mut g = EventGraph::new();
        g.register_stream(StreamId(1), "host0", StreamKind::Host);
        g
    }

    fn add(
        g: &mut EventGraph,
        time: u64,
        kind: RecordKind,
        function: FunctionKind,
    ) -> NodeRef {
        g.add_node(StreamId(1), time, kind, function, RegionId(0), "region")
            .expect("add_node")
    }

    #[test]
    fn enter_leave_pairing_is_nested() {
        let mut g = graph_with_stream();
        let outer_enter = add(&mut g, 10, RecordKind::Enter, FunctionKind::Cpu);
        let inner_enter = add(&mut g, 20, RecordKind::Enter, FunctionKind::MpiSend);
        let inner_leave = add(&mut g, 30, RecordKind::Leave, FunctionKind::MpiSend);
        let outer_leave = add(&mut g, 40, RecordKind::Leave, FunctionKind::Cpu);
        assert_eq!(g.node(inner_enter).partner(), Some(inner_leave));
        assert_eq!(g.node(outer_leave).partner(), Some(outer_enter));
        assert_eq!(g.node(outer_enter).partner(), Some(outer_leave));
    }

    #[test]
    fn consecutive_nodes_are_chained() {
        let mut g = graph_with_stream();
        let a = add(&mut g, 10, RecordKind::Enter, FunctionKind::Cpu);
        let b = add(&mut g, 20, RecordKind::Enter, FunctionKind::MpiSend);
        let c = add(&mut g, 30, RecordKind::Leave, FunctionKind::MpiSend);
        assert!(g.graph.get_edge(a, b).is_some());
        let bc = g.graph.get_edge(b, c).expect("edge b->c");
        assert_eq!(g.graph.edge(bc).duration(), 10);
        assert!(g.graph.edge(bc).is_intra_stream());
        // no shortcut edge across the chain
        assert!(g.graph.get_edge(a, c).is_none());
    }

    #[test]
    fn timestamp_regress_is_fatal() {
        let mut g = graph_with_stream();
        add(&mut g, 50, RecordKind::Enter, FunctionKind::Cpu);
        let err = g
            .add_node(
                StreamId(1),
                40,
                RecordKind::Leave,
                FunctionKind::Cpu,
                RegionId(0),
                "region",
            )
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::TimestampRegress {
                stream: StreamId(1),
                time: 40,
                last: 50
            }
        );
    }

    #[test]
    fn unknown_stream_is_rejected() {
        let mut g = graph_with_stream();
        let err = g
            .add_node(
                StreamId(9),
                1,
                RecordKind::Enter,
                FunctionKind::Cpu,
                RegionId(0),
                "region",
            )
            .unwrap_err();
        assert_eq!(err, GraphError::UnknownStream(StreamId(9)));
    }

    #[test]
    fn find_last_node_before_uses_binary_search_semantics() {
        let mut g = graph_with_stream();
        let a = add(&mut g, 10, RecordKind::Enter, FunctionKind::Cpu);
        let b = add(&mut g, 20, RecordKind::Leave, FunctionKind::Cpu);
        let c = add(&mut g, 30, RecordKind::Atomic, FunctionKind::Cpu);
        assert_eq!(g.find_last_node_before(StreamId(1), 25), Some(b));
        assert_eq!(g.find_last_node_before(StreamId(1), 20), Some(b));
        assert_eq!(g.find_last_node_before(StreamId(1), 100), Some(c));
        // all nodes later: fall back to the first so callers can report it
        assert_eq!(g.find_last_node_before(StreamId(1), 5), Some(a));
        assert_eq!(g.find_last_node_before(StreamId(2), 5), None);
    }

    #[test]
    fn find_last_leave_before_skips_enters() {
        let mut g = graph_with_stream();
        add(&mut g, 10, RecordKind::Enter, FunctionKind::Cpu);
        let leave = add(&mut g, 20, RecordKind::Leave, FunctionKind::Cpu);
        add(&mut g, 30, RecordKind::Enter, FunctionKind::Cpu);
        assert_eq!(g.find_last_leave_before(StreamId(1), 35), Some(leave));
        assert_eq!(g.find_last_leave_before(StreamId(1), 15), None);
    }

    #[test]
    fn node_at_resolves_exact_times() {
        let mut g = graph_with_stream();
        add(&mut g, 10, RecordKind::Enter, FunctionKind::Cpu);
        let b = add(&mut g, 20, RecordKind::Leave, FunctionKind::Cpu);
        assert_eq!(g.node_at(StreamId(1), 20), Some(b));
        assert_eq!(g.node_at(StreamId(1), 15), None);
    }

    #[test]
    fn walk_backward_visits_in_reverse_order_and_stops() {
        let mut g = graph_with_stream();
        let a = add(&mut g, 10, RecordKind::Enter, FunctionKind::Cpu);
        let b = add(&mut g, 20, RecordKind::Enter, FunctionKind::Cpu);
        let c = add(&mut g, 30, RecordKind::Leave, FunctionKind::Cpu);
        let mut visited = Vec::new();
        g.walk_backward(c, |node| {
            visited.push(node);
            if node == b {
                WalkControl::Stop
            } else {
                WalkControl::Continue
            }
        });
        assert_eq!(visited, vec![c, b]);
        let _ = a;
    }

    #[test]
    fn counters_survive_through_graph_access() {
        let mut g = graph_with_stream();
        let a = add(&mut g, 10, RecordKind::Enter, FunctionKind::Cpu);
        g.node_mut(a).set_counter(Counter::WaitingTime, 12);
        assert_eq!(g.node(a).counter(Counter::WaitingTime), Some(12));
    }
}
