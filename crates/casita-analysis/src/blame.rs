//! Backward blame distribution along a stream.
//!
//! Waiting time detected on one stream is charged to the regions that ran
//! before the causing operation: a backward walk collects region durations,
//! then every visited edge receives a share proportional to its duration.

use casita_graph::{EventGraph, NodeRef, WalkControl};
use casita_types::FunctionKind;

/// Distribute `blame` (a time quantity) backward from `start` on its stream.
///
/// The callback decides per node whether the walk continues; the node it
/// stops at is still included, so the edge into the boundary gets its share.
/// `open_region_time` is extra walked time the caller accounts for separately
/// (the trailing open region of a launch); it contributes to the total but
/// receives no share here.
///
/// Returns the total walked time (including `open_region_time`). When that
/// total is zero nothing is distributed. Up to floating-point rounding, the
/// shares written across all edges sum to `blame` minus the open-region
/// share the caller still owes.
pub fn distribute_blame(
    graph: &mut EventGraph,
    start: NodeRef,
    blame: u64,
    callback: impl FnMut(&EventGraph, NodeRef) -> WalkControl,
    open_region_time: u64,
) -> u64 {
    let mut callback = callback;
    let mut visited: Vec<NodeRef> = Vec::new();
    let mut walk_failed = false;
    {
        let graph: &EventGraph = graph;
        graph.walk_backward(start, |node| {
            visited.push(node);
            callback(graph, node)
        });
    }
    // visited is newest-first; edges run predecessor -> successor
    let mut edges = Vec::with_capacity(visited.len().saturating_sub(1));
    let mut total: u64 = open_region_time;
    for pair in visited.windows(2) {
        let (later, earlier) = (pair[0], pair[1]);
        match graph.graph.get_edge(earlier, later) {
            Some(edge) => {
                total = total.saturating_add(graph.graph.edge(edge).duration());
                edges.push(edge);
            }
            None => {
                walk_failed = true;
            }
        }
    }
    if walk_failed {
        tracing::warn!("gap in stream chain during blame walk");
    }
    if total == 0 || blame == 0 {
        return total;
    }
    for edge in edges {
        let duration = graph.graph.edge(edge).duration();
        let share = blame as f64 * duration as f64 / total as f64;
        graph.graph.add_blame(edge, share);
    }
    total
}

/// Default stream-walk boundary for MPI blame: stop at the previous blocking
/// MPI leave (or the start of the stream).
pub fn mpi_stream_walk(graph: &EventGraph, node: NodeRef) -> WalkControl {
    let node = graph.node(node);
    if node.is_leave() && node.is_mpi_blocking() {
        WalkControl::Stop
    } else {
        WalkControl::Continue
    }
}

/// Stream-walk boundary for device-idle blame: stop at offload launch and
/// synchronization leaves as well as blocking MPI leaves.
pub fn offload_stream_walk(graph: &EventGraph, node: NodeRef) -> WalkControl {
    let node = graph.node(node);
    let offload_boundary = matches!(
        node.function,
        FunctionKind::OffloadEnqueueKernel | FunctionKind::OffloadWait
    );
    if node.is_leave() && (offload_boundary || node.is_mpi_blocking()) {
        WalkControl::Stop
    } else {
        WalkControl::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casita_types::{FunctionKind, RecordKind, RegionId, StreamId, StreamKind};

    fn fixture() -> (EventGraph, Vec<NodeRef>) {
        let mut graph = EventGraph::new();
        graph.register_stream(StreamId(1), "host", StreamKind::Host);
        let times = [0u64, 40, 100, 160];
        let mut nodes = Vec::new();
        for (i, t) in times.iter().enumerate() {
            let kind = if i % 2 == 0 {
                RecordKind::Enter
            } else {
                RecordKind::Leave
            };
            nodes.push(
                graph
                    .add_node(StreamId(1), *t, kind, FunctionKind::Cpu, RegionId(0), "work")
                    .unwrap(),
            );
        }
        (graph, nodes)
    }

    fn total_blame(graph: &EventGraph) -> f64 {
        graph.graph.edges().map(|(_, e)| e.blame()).sum()
    }

    #[test]
    fn shares_are_proportional_and_sum_to_blame() {
        let (mut graph, nodes) = fixture();
        let total = distribute_blame(&mut graph, nodes[3], 80, |_, _| WalkControl::Continue, 0);
        assert_eq!(total, 160);
        // edge durations 40, 60, 60 -> shares 20, 30, 30
        let e01 = graph.graph.get_edge(nodes[0], nodes[1]).unwrap();
        let e12 = graph.graph.get_edge(nodes[1], nodes[2]).unwrap();
        let e23 = graph.graph.get_edge(nodes[2], nodes[3]).unwrap();
        assert!((graph.graph.edge(e01).blame() - 20.0).abs() < 1e-9);
        assert!((graph.graph.edge(e12).blame() - 30.0).abs() < 1e-9);
        assert!((graph.graph.edge(e23).blame() - 30.0).abs() < 1e-9);
        assert!((total_blame(&graph) - 80.0).abs() < 1e-9);
    }

    #[test]
    fn stop_node_is_included() {
        let (mut graph, nodes) = fixture();
        let boundary = nodes[1];
        let total = distribute_blame(
            &mut graph,
            nodes[3],
            60,
            |_, node| {
                if node == boundary {
                    WalkControl::Stop
                } else {
                    WalkControl::Continue
                }
            },
            0,
        );
        // walked edges: 1->2 (60) and 2->3 (60)
        assert_eq!(total, 120);
        let e01 = graph.graph.get_edge(nodes[0], nodes[1]).unwrap();
        assert_eq!(graph.graph.edge(e01).blame(), 0.0);
        assert!((total_blame(&graph) - 60.0).abs() < 1e-9);
    }

    #[test]
    fn open_region_share_is_left_to_the_caller() {
        let (mut graph, nodes) = fixture();
        let total = distribute_blame(&mut graph, nodes[3], 100, |_, _| WalkControl::Continue, 40);
        assert_eq!(total, 200);
        // only 160 of 200 walked ticks are edges: 4/5 of the blame lands here
        assert!((total_blame(&graph) - 80.0).abs() < 1e-9);
    }

    #[test]
    fn zero_total_distributes_nothing() {
        let mut graph = EventGraph::new();
        graph.register_stream(StreamId(1), "host", StreamKind::Host);
        let only = graph
            .add_node(
                StreamId(1),
                10,
                RecordKind::Enter,
                FunctionKind::Cpu,
                RegionId(0),
                "work",
            )
            .unwrap();
        let total = distribute_blame(&mut graph, only, 50, |_, _| WalkControl::Continue, 0);
        assert_eq!(total, 0);
        assert_eq!(total_blame(&graph), 0.0);
    }

    #[test]
    fn mpi_walk_stops_at_blocking_mpi_leave() {
        let (mut graph, nodes) = fixture();
        graph.node_mut(nodes[1]).mark_mpi_blocking();
        let mut seen = Vec::new();
        graph.walk_backward(nodes[3], |n| {
            seen.push(n);
            mpi_stream_walk(&graph, n)
        });
        assert_eq!(seen, vec![nodes[3], nodes[2], nodes[1]]);
    }
}
