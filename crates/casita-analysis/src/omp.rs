//! OpenMP paradigm: fork-join tracking, barrier wait analysis and target
//! offloading regions.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use casita_graph::{EdgeKind, NodeRef, WalkControl};
use casita_types::{AttributeList, Counter, FunctionKind, Paradigm, StreamId, attr, attribute_u64};

use crate::engine::AnalysisEngine;
use crate::statistics::{ActivityType, StatMetric};

// ── Paradigm state ──────────────────────────────────────────────

#[derive(Default)]
struct TargetRegionStack {
    by_id: FxHashMap<u64, NodeRef>,
    stack: Vec<u64>,
}

#[derive(Default)]
pub struct OmpState {
    /// The fork node of the currently open parallel region.
    pub pending_fork_join: Option<NodeRef>,
    /// Last compute node per stream, consumed at the matching join.
    compute_track: FxHashMap<u64, NodeRef>,
    /// Host stream → open target-offload enter.
    target_begin: FxHashMap<u64, NodeRef>,
    /// Device stream → first/last event inside the current target region.
    target_first_event: FxHashMap<u64, NodeRef>,
    target_last_event: FxHashMap<u64, NodeRef>,
    /// Barrier leaves awaiting scope closure. Host barriers share one list;
    /// device barriers are keyed by `(0, matching id)`.
    barrier_host: Vec<NodeRef>,
    barrier_device: BTreeMap<(u64, u64), Vec<NodeRef>>,
    /// Barrier matching ids, per node index.
    matching_ids: FxHashMap<u32, u64>,
    /// Per-stream stack of open target region ids.
    target_regions: FxHashMap<u64, TargetRegionStack>,
}

impl OmpState {
    pub(crate) fn set_target_begin(&mut self, stream: StreamId, node: NodeRef) {
        if self.target_begin.insert(stream.0, node).is_some() {
            tracing::warn!(%stream, "replacing nested target region");
        }
    }

    pub(crate) fn consume_target_begin(&mut self, stream: StreamId) -> Option<NodeRef> {
        self.target_begin.remove(&stream.0)
    }

    /// Only the first event of a device stream is recorded.
    pub(crate) fn set_target_first_event(&mut self, stream: StreamId, node: NodeRef) {
        self.target_first_event.entry(stream.0).or_insert(node);
    }

    pub(crate) fn consume_target_first_event(&mut self, stream: StreamId) -> Option<NodeRef> {
        self.target_first_event.remove(&stream.0)
    }

    /// Replaces the previous last event; a first event must exist.
    pub(crate) fn set_target_last_event(&mut self, stream: StreamId, node: NodeRef) {
        if self.target_first_event.contains_key(&stream.0) {
            self.target_last_event.insert(stream.0, node);
        }
    }

    pub(crate) fn consume_target_last_event(&mut self, stream: StreamId) -> Option<NodeRef> {
        self.target_last_event.remove(&stream.0)
    }

    pub(crate) fn push_target_region(&mut self, stream: StreamId, region: u64, node: NodeRef) {
        let entry = self.target_regions.entry(stream.0).or_default();
        entry.by_id.insert(region, node);
        entry.stack.push(region);
    }

    pub(crate) fn pop_target_region(&mut self, stream: StreamId) {
        if let Some(entry) = self.target_regions.get_mut(&stream.0) {
            if let Some(region) = entry.stack.pop() {
                entry.by_id.remove(&region);
            }
            if entry.stack.is_empty() {
                self.target_regions.remove(&stream.0);
            }
        }
    }

    /// Search the other streams' open target regions for the parent id.
    pub(crate) fn find_target_parent_region(
        &self,
        not_on: StreamId,
        parent: u64,
    ) -> Option<NodeRef> {
        self.target_regions
            .iter()
            .filter(|(stream, _)| **stream != not_on.0)
            .find_map(|(_, entry)| entry.by_id.get(&parent).copied())
    }

    pub(crate) fn set_matching_id(&mut self, node: NodeRef, matching: u64) {
        self.matching_ids.insert(node.index(), matching);
    }

    fn matching_id(&self, node: NodeRef) -> Option<u64> {
        self.matching_ids.get(&node.index()).copied()
    }
}

// ── Attribute handling ──────────────────────────────────────────

/// Device key-value handling: parent-region edges, region stacks and the
/// barrier matching ids, all before rule dispatch.
pub(crate) fn handle_attributes(
    engine: &mut AnalysisEngine,
    node: NodeRef,
    attributes: &AttributeList,
) {
    let (stream_id, is_enter, function, stream_index) = {
        let n = engine.graph.node(node);
        (n.stream, n.is_enter(), n.function, n.stream_index())
    };
    let on_device = engine
        .graph
        .streams
        .get(stream_id)
        .is_some_and(|s| s.is_device());

    if on_device && is_enter {
        if let Some(parent) = attribute_u64(attributes, attr::OMP_TARGET_PARENT_REGION_ID) {
            // intra-device dependency edges only for the first event per stream
            if stream_index == 0 {
                if let Some(parent_node) = engine.omp.find_target_parent_region(stream_id, parent) {
                    engine
                        .graph
                        .add_edge(parent_node, node, Paradigm::OMP, EdgeKind::None);
                }
            }
            if function == FunctionKind::OmpSync {
                engine
                    .graph
                    .node_mut(node)
                    .set_counter(Counter::OmpParentRegionId, parent);
            }
        }
        if let Some(region) = attribute_u64(attributes, attr::OMP_TARGET_REGION_ID) {
            engine.omp.push_target_region(stream_id, region, node);
            if function == FunctionKind::OmpSync {
                engine
                    .graph
                    .node_mut(node)
                    .set_counter(Counter::OmpRegionId, region);
            }
        }
    }

    if function == FunctionKind::OmpSync {
        if let Some(matching) = attribute_u64(attributes, attr::OMP_MATCHING_ID) {
            engine.omp.set_matching_id(node, matching);
        }
    }
}

// ── Fork/join ───────────────────────────────────────────────────

/// Applied at fork-join region endpoints: the enter is stashed as the open
/// parallel region; the matching leave joins the team's compute leaves back
/// into the master stream.
pub(crate) fn fork_join_rule(engine: &mut AnalysisEngine, node: NodeRef) -> bool {
    let (function, is_enter) = {
        let n = engine.graph.node(node);
        (n.function, n.is_enter())
    };
    if function != FunctionKind::OmpForkJoin {
        return false;
    }
    if is_enter {
        if engine.omp.pending_fork_join.is_some() {
            tracing::warn!("nested fork-join region");
        }
        engine.omp.pending_fork_join = Some(node);
        return true;
    }
    if let Some(fork) = engine.omp.pending_fork_join {
        if engine.graph.node(fork).partner() == Some(node) {
            let computes: Vec<NodeRef> =
                std::mem::take(&mut engine.omp.compute_track).into_values().collect();
            for compute in computes {
                if engine.graph.node(compute).is_leave() {
                    engine
                        .graph
                        .add_edge(compute, node, Paradigm::OMP, EdgeKind::None);
                }
            }
            engine.omp.pending_fork_join = None;
            engine.stats.count_activity(ActivityType::OmpForkJoin);
        }
    }
    true
}

/// Tracks compute regions per stream and ties each team member's first
/// compute to the open fork.
pub(crate) fn compute_rule(engine: &mut AnalysisEngine, node: NodeRef) -> bool {
    let (function, is_enter, stream) = {
        let n = engine.graph.node(node);
        (n.function, n.is_enter(), n.stream)
    };
    if function != FunctionKind::OmpCompute {
        return false;
    }
    if is_enter {
        if let Some(fork) = engine.omp.pending_fork_join {
            let first_on_stream = !engine.omp.compute_track.contains_key(&stream.0);
            if first_on_stream && engine.graph.node(fork).stream != stream {
                engine
                    .graph
                    .add_edge(fork, node, Paradigm::OMP, EdgeKind::None);
            }
        }
    }
    engine.omp.compute_track.insert(stream.0, node);
    true
}

// ── Barriers ────────────────────────────────────────────────────

/// Applied at barrier leaves: members collect per scope; once every stream
/// of the scope contributed, waits are computed relative to the latest
/// arriver and earlier enters get blocking edges to it.
pub(crate) fn barrier_rule(engine: &mut AnalysisEngine, leave: NodeRef) -> bool {
    let (function, is_leave, stream) = {
        let n = engine.graph.node(leave);
        (n.function, n.is_leave(), n.stream)
    };
    if function != FunctionKind::OmpSync || !is_leave {
        return false;
    }
    if engine
        .graph
        .node(leave)
        .counter(Counter::OmpIgnoreBarrier)
        .is_some()
    {
        return false;
    }
    let Some(enter) = engine.graph.node(leave).partner() else {
        return false;
    };
    let on_device = engine
        .graph
        .streams
        .get(stream)
        .is_some_and(|s| s.is_device());

    let scope_size;
    let members: &mut Vec<NodeRef>;
    if on_device {
        let matching = engine
            .omp
            .matching_id(leave)
            .or_else(|| engine.omp.matching_id(enter))
            .unwrap_or_default();
        scope_size = engine.graph.streams.device_ids().len();
        members = engine.omp.barrier_device.entry((0, matching)).or_default();
    } else {
        scope_size = engine.graph.streams.host_ids().len();
        members = &mut engine.omp.barrier_host;
    }
    members.push(leave);
    if members.len() < scope_size.max(1) {
        return true;
    }
    let leaves = std::mem::take(members);

    let pairs: Vec<(NodeRef, NodeRef)> = leaves
        .iter()
        .filter_map(|l| engine.graph.node(*l).partner().map(|e| (e, *l)))
        .collect();
    let Some(&(latest_enter, latest_leave)) = pairs
        .iter()
        .max_by_key(|(e, _)| engine.graph.node(*e).time)
    else {
        return true;
    };
    let latest_time = engine.graph.node(latest_enter).time;

    for (enter, leave) in &pairs {
        if *enter == latest_enter {
            continue;
        }
        let enter_time = engine.graph.node(*enter).time;
        if enter_time < latest_time {
            engine
                .graph
                .graph
                .add_edge(*enter, latest_enter, Paradigm::OMP, EdgeKind::None, true);
            engine.make_region_blocking(*enter, *leave);
            let wtime = engine.graph.node(*leave).time - enter_time;
            engine
                .graph
                .node_mut(*leave)
                .set_counter(Counter::WaitingTime, wtime);
            engine.stats.add_stat(StatMetric::OmpBarrier, wtime);
        }
    }
    engine
        .graph
        .node_mut(latest_leave)
        .set_counter(Counter::WaitingTime, 0);
    engine.stats.count_activity(ActivityType::OmpBarrier);
    true
}

// ── Target offloading ───────────────────────────────────────────

/// Applied on both sides of a target region: device events register as
/// first/last events, the host side stitches them to the target region and
/// turns the spanned host regions into wait states.
pub(crate) fn target_rule(engine: &mut AnalysisEngine, node: NodeRef) -> bool {
    let (function, is_enter, stream) = {
        let n = engine.graph.node(node);
        (n.function, n.is_enter(), n.stream)
    };
    let on_device = engine
        .graph
        .streams
        .get(stream)
        .is_some_and(|s| s.is_device());

    if is_enter {
        if on_device {
            engine.omp.set_target_first_event(stream, node);
            return true;
        }
        if function == FunctionKind::OmpTargetOffload {
            engine.omp.set_target_begin(stream, node);
            return true;
        }
        return false;
    }

    if on_device {
        engine.omp.set_target_last_event(stream, node);
        return true;
    }

    if function == FunctionKind::OmpTargetOffload {
        engine.omp.consume_target_begin(stream);
        let Some(target_begin) = engine.graph.node(node).partner() else {
            return false;
        };
        let reference = engine
            .graph
            .node(target_begin)
            .referenced_stream()
            .or_else(|| engine.graph.node(node).referenced_stream());
        let Some(device_stream) = reference else {
            return false;
        };
        let first = engine.omp.consume_target_first_event(device_stream);
        let last = engine.omp.consume_target_last_event(device_stream);
        let (Some(first), Some(last)) = (first, last) else {
            tracing::warn!(
                begin = %engine.graph.node(target_begin).name,
                end = %engine.graph.node(node).name,
                "no device events inside target region"
            );
            return false;
        };

        // host regions spanned by the target region become wait states
        let mut spanned: Vec<NodeRef> = Vec::new();
        {
            let graph = &engine.graph;
            graph.walk_backward(node, |walked| {
                spanned.push(walked);
                let n = graph.node(walked);
                if n.is_enter() && n.function == FunctionKind::OmpTargetOffload {
                    WalkControl::Stop
                } else {
                    WalkControl::Continue
                }
            });
        }
        spanned.reverse();
        for pair in spanned.windows(2) {
            if let Some(edge) = engine.graph.graph.get_edge(pair[0], pair[1]) {
                engine.graph.graph.make_blocking(edge);
            }
            let gap = engine.graph.node(pair[1]).time - engine.graph.node(pair[0]).time;
            engine
                .graph
                .node_mut(pair[0])
                .set_counter(Counter::WaitState, gap);
        }

        engine
            .graph
            .add_edge(target_begin, first, Paradigm::OMP, EdgeKind::None);
        engine
            .graph
            .add_edge(last, node, Paradigm::OMP, EdgeKind::CausesWaitState);
        return true;
    }

    if function == FunctionKind::OmpTargetFlush {
        let Some(target_begin) = engine.omp.consume_target_begin(stream) else {
            tracing::warn!("target flush without target begin");
            return false;
        };
        let Some(reference) = engine.graph.node(node).referenced_stream() else {
            return false;
        };
        engine
            .graph
            .node_mut(target_begin)
            .set_referenced_stream(reference);
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_region_stack_tracks_open_regions() {
        let mut state = OmpState::default();
        let a = NodeRef::from_index(1);
        let b = NodeRef::from_index(2);
        state.push_target_region(StreamId(10), 100, a);
        state.push_target_region(StreamId(10), 101, b);
        assert_eq!(state.find_target_parent_region(StreamId(11), 101), Some(b));
        // a node never matches regions on its own stream
        assert_eq!(state.find_target_parent_region(StreamId(10), 101), None);
        state.pop_target_region(StreamId(10));
        assert_eq!(state.find_target_parent_region(StreamId(11), 101), None);
        assert_eq!(state.find_target_parent_region(StreamId(11), 100), Some(a));
    }

    #[test]
    fn first_event_is_sticky_last_event_needs_first() {
        let mut state = OmpState::default();
        let first = NodeRef::from_index(1);
        let later = NodeRef::from_index(2);
        // no first event recorded yet: last events are dropped
        state.set_target_last_event(StreamId(5), later);
        assert_eq!(state.consume_target_last_event(StreamId(5)), None);

        state.set_target_first_event(StreamId(5), first);
        state.set_target_first_event(StreamId(5), later);
        assert_eq!(state.consume_target_first_event(StreamId(5)), Some(first));
    }
}
