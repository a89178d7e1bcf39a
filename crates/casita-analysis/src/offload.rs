//! Offload paradigm: kernel launch pairing, late synchronization with
//! synthetic wait states, event tables, and device idle accounting.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use casita_graph::{EdgeKind, NodeRef};
use casita_types::{
    AttributeList, Counter, FunctionKind, Paradigm, RecordKind, RegionId, StreamId, attr,
    attribute_u64,
};

use crate::blame::{distribute_blame, offload_stream_walk};
use crate::engine::AnalysisEngine;
use crate::statistics::{ActivityType, StatMetric};

/// Region id for synthetic wait-state nodes inserted on device streams.
pub const WAITSTATE_REGION: RegionId = RegionId(u32::MAX);
pub const WAITSTATE_NAME: &str = "wait_state";

// ── Paradigm state ──────────────────────────────────────────────

#[derive(Default)]
pub struct OffloadState {
    /// Kernels currently executing across all device streams.
    pub active_tasks: u64,
    /// When the device last became idle; 0 until the first offload leave.
    pub idle_start_time: u64,
    /// Event id → last event-record leave.
    event_record: FxHashMap<u64, NodeRef>,
    /// Event id → last event-query leave.
    event_query: FxHashMap<u64, NodeRef>,
    /// Event id → device stream the event was recorded on.
    event_stream: FxHashMap<u64, u64>,
    /// Device stream → stream-wait-event leaves awaiting the next kernel.
    stream_waits: FxHashMap<u64, Vec<NodeRef>>,
    /// Device stream → kernel-launch enters not yet paired with a kernel.
    pending_launches: FxHashMap<u64, VecDeque<NodeRef>>,
    /// Kernel enter → its launch enter on the host.
    kernel_launch: FxHashMap<u32, NodeRef>,
    /// Event id carried by an event-sync/query node, set by the handler.
    event_of_node: FxHashMap<u32, u64>,
}

impl OffloadState {
    pub(crate) fn push_pending_launch(&mut self, device: StreamId, launch_enter: NodeRef) {
        self.pending_launches
            .entry(device.0)
            .or_default()
            .push_back(launch_enter);
    }

    pub(crate) fn pop_pending_launch(&mut self, device: StreamId) -> Option<NodeRef> {
        self.pending_launches
            .get_mut(&device.0)
            .and_then(VecDeque::pop_front)
    }

    pub(crate) fn take_stream_waits(&mut self, device: StreamId) -> Vec<NodeRef> {
        self.stream_waits.remove(&device.0).unwrap_or_default()
    }

    pub(crate) fn launch_of_kernel(&self, kernel_enter: NodeRef) -> Option<NodeRef> {
        self.kernel_launch.get(&kernel_enter.index()).copied()
    }
}

// ── Attribute handling ──────────────────────────────────────────

pub(crate) fn handle_attributes(
    engine: &mut AnalysisEngine,
    node: NodeRef,
    attributes: &AttributeList,
) {
    let (function, is_enter, is_leave) = {
        let n = engine.graph.node(node);
        (n.function, n.is_enter(), n.is_leave())
    };
    match function {
        FunctionKind::OffloadEnqueueKernel | FunctionKind::OffloadWait if is_enter => {
            if let Some(device) = attribute_u64(attributes, attr::OFFLOAD_DEVICE_REF) {
                engine
                    .graph
                    .node_mut(node)
                    .set_referenced_stream(StreamId(device));
            }
        }
        FunctionKind::OffloadEventRecord if is_leave => {
            let Some(event) = attribute_u64(attributes, attr::OFFLOAD_EVENT_ID) else {
                tracing::warn!("event record without event id");
                return;
            };
            engine.offload.event_record.insert(event, node);
            if let Some(device) = attribute_u64(attributes, attr::OFFLOAD_DEVICE_REF) {
                engine.offload.event_stream.insert(event, device);
            }
        }
        FunctionKind::OffloadEventSync | FunctionKind::OffloadEventQuery if is_leave => {
            if let Some(event) = attribute_u64(attributes, attr::OFFLOAD_EVENT_ID) {
                engine.offload.event_of_node.insert(node.index(), event);
            }
        }
        FunctionKind::OffloadStreamWaitEvent if is_leave => {
            let event = attribute_u64(attributes, attr::OFFLOAD_EVENT_ID);
            let device = attribute_u64(attributes, attr::OFFLOAD_DEVICE_REF)
                .or_else(|| event.and_then(|e| engine.offload.event_stream.get(&e).copied()));
            let Some(device) = device else {
                tracing::warn!("stream-wait-event without device reference");
                return;
            };
            engine
                .offload
                .stream_waits
                .entry(device)
                .or_default()
                .push(node);
        }
        _ => {}
    }
}

// ── Launch / execution pairing ──────────────────────────────────

/// Applied at a kernel-launch leave on a host stream: queue the launch enter
/// for the referenced device stream.
pub(crate) fn enqueue_kernel_rule(engine: &mut AnalysisEngine, leave: NodeRef) -> bool {
    {
        let node = engine.graph.node(leave);
        if node.function != FunctionKind::OffloadEnqueueKernel || !node.is_leave() {
            return false;
        }
    }
    let Some(enter) = engine.enter_of(leave) else {
        return false;
    };
    let Some(device) = engine.graph.node(enter).referenced_stream() else {
        tracing::warn!("kernel launch without device stream reference");
        return false;
    };
    engine.offload.push_pending_launch(device, enter);
    true
}

/// Applied at a kernel enter on a device stream: consume the oldest pending
/// launch for this stream, link the two, and flush queued stream-wait-event
/// dependencies.
pub(crate) fn kernel_execution_rule(engine: &mut AnalysisEngine, kernel_enter: NodeRef) -> bool {
    let (function, is_enter, device) = {
        let n = engine.graph.node(kernel_enter);
        (n.function, n.is_enter(), n.stream)
    };
    if function != FunctionKind::OffloadKernel || !is_enter {
        return false;
    }
    let Some(launch_enter) = engine.offload.pop_pending_launch(device) else {
        tracing::warn!(stream = %device, "kernel without pending launch");
        return false;
    };
    engine
        .graph
        .add_edge(launch_enter, kernel_enter, Paradigm::CUDA, EdgeKind::None);
    engine
        .offload
        .kernel_launch
        .insert(kernel_enter.index(), launch_enter);
    for wait_leave in engine.offload.take_stream_waits(device) {
        engine
            .graph
            .add_edge(wait_leave, kernel_enter, Paradigm::CUDA, EdgeKind::None);
    }
    true
}

// ── Late synchronization ────────────────────────────────────────

/// Applied at a device-sync leave: any device stream whose pending kernels
/// all finished before the synchronization started makes the sync late.
pub(crate) fn late_sync_rule(engine: &mut AnalysisEngine, sync_leave: NodeRef) -> bool {
    {
        let node = engine.graph.node(sync_leave);
        if node.function != FunctionKind::OffloadWait || !node.is_leave() {
            return false;
        }
    }
    let Some(sync_enter) = engine.enter_of(sync_leave) else {
        return false;
    };
    let referenced = engine.graph.node(sync_enter).referenced_stream();
    let mut applied = false;
    for device in engine.graph.streams.device_ids() {
        if referenced.is_some_and(|r| r != device) {
            continue;
        }
        applied |= late_sync_on_device(engine, sync_enter, sync_leave, device);
    }
    applied
}

/// Applied at an event-sync leave: resolve the event to its recorded device
/// stream and treat the sync as a targeted late synchronization.
pub(crate) fn event_sync_rule(engine: &mut AnalysisEngine, sync_leave: NodeRef) -> bool {
    {
        let node = engine.graph.node(sync_leave);
        if node.function != FunctionKind::OffloadEventSync || !node.is_leave() {
            return false;
        }
    }
    let Some(event) = engine.offload.event_of_node.remove(&sync_leave.index()) else {
        return false;
    };
    let Some(device) = engine.offload.event_stream.get(&event).copied() else {
        tracing::warn!(event, "event sync for unrecorded event");
        return false;
    };
    let Some(sync_enter) = engine.enter_of(sync_leave) else {
        return false;
    };
    let applied = late_sync_on_device(engine, sync_enter, sync_leave, StreamId(device));
    // the synchronization consumed the event
    engine.offload.event_record.remove(&event);
    applied
}

/// Applied at an event-query leave: remember the query; once the recorded
/// event's work has drained, the event tables are released.
pub(crate) fn event_query_rule(engine: &mut AnalysisEngine, query_leave: NodeRef) -> bool {
    {
        let node = engine.graph.node(query_leave);
        if node.function != FunctionKind::OffloadEventQuery || !node.is_leave() {
            return false;
        }
    }
    let Some(event) = engine.offload.event_of_node.remove(&query_leave.index()) else {
        return false;
    };
    engine.offload.event_query.insert(event, query_leave);
    let Some(device) = engine.offload.event_stream.get(&event).copied() else {
        return true;
    };
    let query_start = engine
        .enter_of(query_leave)
        .map(|e| engine.graph.node(e).time)
        .unwrap_or_else(|| engine.graph.node(query_leave).time);
    let complete = engine
        .graph
        .streams
        .get(StreamId(device))
        .and_then(|s| s.device.first_pending_kernel())
        .is_none_or(|kernel| engine.graph.node(kernel).time <= query_start);
    if complete {
        engine.offload.event_record.remove(&event);
        engine.offload.event_query.remove(&event);
        engine.offload.event_stream.remove(&event);
    }
    true
}

fn late_sync_on_device(
    engine: &mut AnalysisEngine,
    sync_enter: NodeRef,
    sync_leave: NodeRef,
    device: StreamId,
) -> bool {
    let sync_enter_time = engine.graph.node(sync_enter).time;
    let sync_leave_time = engine.graph.node(sync_leave).time;
    let Some(kernel_leave) = engine
        .graph
        .streams
        .get(device)
        .and_then(|s| s.device.first_pending_kernel())
    else {
        return false;
    };
    if engine.graph.node(kernel_leave).time > sync_enter_time {
        // the kernel was still running; this synchronization was not late
        return false;
    }

    let last_leave = engine.graph.find_last_leave_before(device, sync_leave_time);
    let mut wait_enter = None;
    let mut wait_leave = None;
    match last_leave {
        Some(last) if engine.graph.node(last).function == FunctionKind::OffloadWaitstate => {
            if engine.graph.node(last).time == sync_leave_time {
                wait_leave = Some(last);
            } else {
                let at = engine.graph.node(last).time.max(sync_enter_time);
                wait_enter = add_waitstate(engine, device, at, RecordKind::Enter);
                if wait_enter.is_none() {
                    return false;
                }
            }
        }
        _ => {
            wait_enter = add_waitstate(engine, device, sync_enter_time, RecordKind::Enter);
            if wait_enter.is_none() {
                return false;
            }
        }
    }
    let wait_leave = match wait_leave {
        Some(leave) => leave,
        None => match add_waitstate(engine, device, sync_leave_time, RecordKind::Leave) {
            Some(leave) => leave,
            None => return false,
        },
    };

    if let Some(wait_enter) = wait_enter {
        engine.graph.add_edge(
            sync_enter,
            wait_enter,
            Paradigm::CUDA,
            EdgeKind::CausesWaitState,
        );
        engine.make_region_blocking(wait_enter, wait_leave);
    }
    engine
        .graph
        .add_edge(sync_leave, wait_leave, Paradigm::CUDA, EdgeKind::None);

    let duration = sync_leave_time - sync_enter_time;
    engine
        .graph
        .node_mut(sync_leave)
        .add_counter(Counter::Blame, duration);
    engine
        .graph
        .node_mut(wait_leave)
        .set_counter(Counter::WaitingTime, duration);
    engine
        .stats
        .add_stat(StatMetric::OfldEarlyBlockingWait, duration);
    engine.stats.count_activity(ActivityType::OfldSync);

    if let Some(stream) = engine.graph.streams.get_mut(device) {
        stream.device.clear_pending_kernels();
    }
    true
}

fn add_waitstate(
    engine: &mut AnalysisEngine,
    device: StreamId,
    time: u64,
    kind: RecordKind,
) -> Option<NodeRef> {
    match engine.graph.add_node(
        device,
        time,
        kind,
        FunctionKind::OffloadWaitstate,
        WAITSTATE_REGION,
        WAITSTATE_NAME,
    ) {
        Ok(node) => Some(node),
        Err(err) => {
            tracing::warn!(%err, "cannot insert wait state");
            None
        }
    }
}

// ── Device idle ─────────────────────────────────────────────────

/// Applied at kernel endpoints: tracks device occupancy, and when a kernel
/// ends an idle phase, charges the idle time to the host work that failed to
/// keep the device busy.
pub(crate) fn device_idle_rule(engine: &mut AnalysisEngine, kernel: NodeRef) -> bool {
    let (function, is_enter, is_leave, is_offload, time) = {
        let n = engine.graph.node(kernel);
        (
            n.function,
            n.is_enter(),
            n.is_leave(),
            n.function.is_offload(),
            n.time,
        )
    };
    if engine.offload.idle_start_time == 0 && is_offload && is_leave {
        engine.offload.idle_start_time = time;
    }
    if function != FunctionKind::OffloadKernel {
        return false;
    }

    if is_enter {
        if engine.offload.active_tasks == 0 {
            let idle_end = time;
            let blame = idle_end.saturating_sub(engine.offload.idle_start_time);
            let launch = engine.offload.launch_of_kernel(kernel);
            let launch_time = match launch {
                Some(launch) => engine.graph.node(launch).time,
                None => {
                    tracing::warn!(
                        kernel = %engine.graph.node(kernel).name,
                        "no launch for kernel"
                    );
                    idle_end
                }
            };
            if blame > 0 {
                for host in engine.graph.streams.host_ids() {
                    blame_host_stream(engine, host, launch, launch_time, blame);
                }
                engine.stats.add_stat(StatMetric::OfldIdleTime, blame);
            }
        }
        engine.offload.active_tasks += 1;
    } else if is_leave {
        engine.offload.active_tasks = engine.offload.active_tasks.saturating_sub(1);
        if engine.offload.active_tasks == 0 {
            engine.offload.idle_start_time = time;
        }
        engine.stats.count_activity(ActivityType::OfldKernel);
    }
    true
}

/// Charge one host stream for a device idle phase ending at a kernel whose
/// launch happened at `launch_time`.
fn blame_host_stream(
    engine: &mut AnalysisEngine,
    host: StreamId,
    launch: Option<NodeRef>,
    launch_time: u64,
    blame: u64,
) {
    let mut open_region = 0u64;
    let start = if let Some(launch) = launch.filter(|l| engine.graph.node(*l).stream == host) {
        launch
    } else {
        match engine.graph.find_last_node_before(host, launch_time) {
            None => {
                tracing::warn!(stream = %host, "no start node for blame distribution");
                return;
            }
            Some(node) => {
                let node_time = engine.graph.node(node).time;
                if launch_time < node_time {
                    tracing::warn!(stream = %host, "launch precedes every node on stream");
                } else {
                    open_region = launch_time - node_time;
                }
                node
            }
        }
    };

    let (start_is_enter, start_is_leave, boundary) = {
        let n = engine.graph.node(start);
        (
            n.is_enter(),
            n.is_leave(),
            matches!(
                n.function,
                FunctionKind::OffloadEnqueueKernel | FunctionKind::OffloadWait
            ),
        )
    };
    // launches and synchronizations are themselves not blameworthy
    if start_is_enter && boundary {
        open_region = 0;
    }
    let total = if start_is_leave && boundary {
        open_region
    } else {
        distribute_blame(&mut engine.graph, start, blame, offload_stream_walk, open_region)
    };

    if total > 0 && open_region > 0 {
        let open_blame = blame as f64 * open_region as f64 / total as f64;
        if open_blame > 0.0 {
            match engine.graph.graph.first_intra_stream_out_edge(start) {
                Some(edge) => engine.graph.graph.add_blame(edge, open_blame),
                None => {
                    tracing::warn!(stream = %host, "no intra-stream edge for open-region blame");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_launches_are_per_device_fifo() {
        let mut state = OffloadState::default();
        let a = NodeRef::from_index(1);
        let b = NodeRef::from_index(2);
        let other = NodeRef::from_index(3);
        state.push_pending_launch(StreamId(100), a);
        state.push_pending_launch(StreamId(100), b);
        state.push_pending_launch(StreamId(200), other);
        assert_eq!(state.pop_pending_launch(StreamId(100)), Some(a));
        assert_eq!(state.pop_pending_launch(StreamId(100)), Some(b));
        assert_eq!(state.pop_pending_launch(StreamId(100)), None);
        assert_eq!(state.pop_pending_launch(StreamId(200)), Some(other));
    }

    #[test]
    fn stream_waits_drain_on_take() {
        let mut state = OffloadState::default();
        state
            .stream_waits
            .entry(100)
            .or_default()
            .push(NodeRef::from_index(7));
        assert_eq!(state.take_stream_waits(StreamId(100)).len(), 1);
        assert!(state.take_stream_waits(StreamId(100)).is_empty());
    }
}
