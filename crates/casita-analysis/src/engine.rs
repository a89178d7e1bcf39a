//! The per-rank analysis engine: node creation from reader callbacks,
//! paradigm attribute handling, and priority-ordered rule dispatch.

use std::fmt;

use compact_str::CompactString;
use rustc_hash::FxHashMap;

use casita_graph::{EventGraph, GraphError, NodePayload, NodeRef};
use casita_replay::{CommError, Communicator, P2P_BUF_SIZE};
use casita_trace::{AnnotatedEvent, Definition, TraceEvent};
use casita_types::{AttributeList, Counter, FunctionKind, StreamId, attr, attribute_u64};

use crate::mpi::{self, MpiState};
use crate::offload::{self, OffloadState};
use crate::omp::{self, OmpState};
use crate::statistics::{ActivityType, Statistics};

// ── Errors ──────────────────────────────────────────────────────

#[derive(Debug)]
pub enum EngineError {
    Graph(GraphError),
    Comm(CommError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graph(err) => write!(f, "{err}"),
            Self::Comm(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<GraphError> for EngineError {
    fn from(value: GraphError) -> Self {
        Self::Graph(value)
    }
}

impl From<CommError> for EngineError {
    fn from(value: CommError) -> Self {
        Self::Comm(value)
    }
}

// ── Rules ───────────────────────────────────────────────────────

/// The rule families. Every rule sees every node; each early-exits unless its
/// trigger shape matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    MpiIsend,
    MpiIrecv,
    MpiSend,
    MpiRecv,
    MpiWait,
    MpiWaitall,
    MpiCollective,
    OffloadEnqueueKernel,
    OffloadKernelExecution,
    OffloadLateSync,
    OffloadEventSync,
    OffloadEventQuery,
    OffloadDeviceIdle,
    OmpForkJoin,
    OmpCompute,
    OmpBarrier,
    OmpTarget,
}

impl Rule {
    fn apply(self, engine: &mut AnalysisEngine, node: NodeRef) -> bool {
        match self {
            Rule::MpiIsend => mpi::isend_rule(engine, node),
            Rule::MpiIrecv => mpi::irecv_rule(engine, node),
            Rule::MpiSend => mpi::send_rule(engine, node),
            Rule::MpiRecv => mpi::recv_rule(engine, node),
            Rule::MpiWait => mpi::wait_rule(engine, node),
            Rule::MpiWaitall => mpi::waitall_rule(engine, node),
            Rule::MpiCollective => mpi::collective_rule(engine, node),
            Rule::OffloadEnqueueKernel => offload::enqueue_kernel_rule(engine, node),
            Rule::OffloadKernelExecution => offload::kernel_execution_rule(engine, node),
            Rule::OffloadLateSync => offload::late_sync_rule(engine, node),
            Rule::OffloadEventSync => offload::event_sync_rule(engine, node),
            Rule::OffloadEventQuery => offload::event_query_rule(engine, node),
            Rule::OffloadDeviceIdle => offload::device_idle_rule(engine, node),
            Rule::OmpForkJoin => omp::fork_join_rule(engine, node),
            Rule::OmpCompute => omp::compute_rule(engine, node),
            Rule::OmpBarrier => omp::barrier_rule(engine, node),
            Rule::OmpTarget => omp::target_rule(engine, node),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RuleEntry {
    priority: i32,
    rule: Rule,
}

/// Launch bookkeeping must run before idle accounting on the same kernel
/// node, hence the explicit priorities.
fn default_rules() -> Vec<RuleEntry> {
    let table = [
        (10, Rule::MpiIsend),
        (10, Rule::MpiIrecv),
        (10, Rule::MpiSend),
        (10, Rule::MpiRecv),
        (5, Rule::MpiWait),
        (5, Rule::MpiWaitall),
        (5, Rule::MpiCollective),
        (20, Rule::OffloadEnqueueKernel),
        (18, Rule::OffloadKernelExecution),
        (16, Rule::OffloadLateSync),
        (16, Rule::OffloadEventSync),
        (14, Rule::OffloadEventQuery),
        (10, Rule::OffloadDeviceIdle),
        (10, Rule::OmpForkJoin),
        (8, Rule::OmpCompute),
        (6, Rule::OmpBarrier),
        (6, Rule::OmpTarget),
    ];
    let mut rules: Vec<RuleEntry> = table
        .into_iter()
        .map(|(priority, rule)| RuleEntry { priority, rule })
        .collect();
    rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    rules
}

// ── Region table ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RegionInfo {
    pub name: CompactString,
    pub role: FunctionKind,
}

// ── The engine ──────────────────────────────────────────────────

pub struct AnalysisEngine {
    pub(crate) graph: EventGraph,
    pub(crate) stats: Statistics,
    pub(crate) comm: Box<dyn Communicator>,
    pub(crate) mpi: MpiState,
    pub(crate) omp: OmpState,
    pub(crate) offload: OffloadState,
    pub(crate) stream_ranks: FxHashMap<u64, u32>,
    regions: FxHashMap<u32, RegionInfo>,
    rules: Vec<RuleEntry>,
    strict: bool,
    ticks_per_second: u64,
}

impl AnalysisEngine {
    pub fn new(comm: Box<dyn Communicator>, strict: bool) -> Self {
        Self {
            graph: EventGraph::new(),
            stats: Statistics::new(),
            comm,
            mpi: MpiState::default(),
            omp: OmpState::default(),
            offload: OffloadState::default(),
            stream_ranks: FxHashMap::default(),
            regions: FxHashMap::default(),
            rules: default_rules(),
            strict,
            ticks_per_second: 1,
        }
    }

    pub fn rank(&self) -> u32 {
        self.comm.rank()
    }

    pub fn comm(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }

    pub fn graph(&self) -> &EventGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut EventGraph {
        &mut self.graph
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub fn mpi_state(&self) -> &MpiState {
        &self.mpi
    }

    pub fn ticks_per_second(&self) -> u64 {
        self.ticks_per_second
    }

    /// Analyzer rank owning a stream, per the location definitions.
    pub fn rank_of_stream(&self, stream: StreamId) -> Option<u32> {
        self.stream_ranks.get(&stream.0).copied()
    }

    // ── Reader callbacks ────────────────────────────────────────

    /// Populate the location/region tables. Locations of other ranks are
    /// remembered for rank translation but get no local stream.
    pub fn handle_definition(&mut self, definition: &Definition) {
        match definition {
            Definition::ClockProperties { ticks_per_second } => {
                self.ticks_per_second = (*ticks_per_second).max(1);
            }
            Definition::Location {
                id,
                name,
                kind,
                rank,
            } => {
                self.stream_ranks.insert(id.0, *rank);
                if *rank == self.comm.rank() {
                    self.graph.register_stream(*id, name.clone(), *kind);
                }
            }
            Definition::Region { id, name, role } => {
                self.regions.insert(
                    id.0,
                    RegionInfo {
                        name: name.clone(),
                        role: *role,
                    },
                );
            }
        }
    }

    /// Ingest one event: create the node, apply key-value attributes through
    /// the paradigm handlers, then dispatch the rule chain.
    ///
    /// Events of locations owned by other ranks are ignored. A malformed
    /// event is reported and skipped, unless strict mode upgrades it to an
    /// error.
    pub fn process_event(&mut self, event: &TraceEvent) -> Result<Option<NodeRef>, EngineError> {
        if self.rank_of_stream(event.location) != Some(self.comm.rank()) {
            return Ok(None);
        }
        let (name, function) = match self.regions.get(&event.region.0) {
            Some(info) => (info.name.clone(), info.role),
            None => {
                tracing::warn!(region = event.region.0, "event for undefined region");
                (CompactString::const_new("unknown"), FunctionKind::Cpu)
            }
        };
        let node = match self.graph.add_node(
            event.location,
            event.time,
            event.kind,
            function,
            event.region,
            name,
        ) {
            Ok(node) => node,
            Err(err) if self.strict => return Err(err.into()),
            Err(err) => {
                tracing::warn!(%err, "skipping malformed event");
                return Ok(None);
            }
        };
        self.stats.count_activity(ActivityType::TraceEvents);

        self.handle_attributes(node, &event.attributes);
        self.pre_rule_bookkeeping(node);
        self.apply_rules(node);
        Ok(Some(node))
    }

    /// Invoke every registered rule on the node, highest priority first.
    /// There is no short-circuit; the result says whether any rule applied.
    pub fn apply_rules(&mut self, node: NodeRef) -> bool {
        let mut applied = false;
        for index in 0..self.rules.len() {
            let rule = self.rules[index].rule;
            if rule.apply(self, node) {
                applied = true;
            }
        }
        applied
    }

    // ── Attribute handling (before rule dispatch) ───────────────

    fn handle_attributes(&mut self, node: NodeRef, attributes: &AttributeList) {
        let function = self.graph.node(node).function;
        if function.is_mpi() {
            mpi::handle_attributes(self, node, attributes);
        } else if function.is_offload() {
            offload::handle_attributes(self, node, attributes);
        }
        // OpenMP key-value handling applies to any node on a device stream
        // and to location refs on leaves, independent of the function kind.
        omp::handle_attributes(self, node, attributes);

        if let Some(value) = attribute_u64(attributes, attr::OMP_TARGET_LOCATION_REF) {
            if self.graph.node(node).is_leave() {
                self.graph.node_mut(node).set_referenced_stream(StreamId(value));
            }
        }
    }

    /// Paradigm bookkeeping that must be visible to the rules of the same
    /// node: pending-kernel queues, barrier classification, region stacks.
    fn pre_rule_bookkeeping(&mut self, node: NodeRef) {
        let (function, is_leave) = {
            let n = self.graph.node(node);
            (n.function, n.is_leave())
        };
        if !is_leave {
            return;
        }
        match function {
            FunctionKind::OffloadKernel => {
                let stream = self.graph.node(node).stream;
                if let Some(stream) = self.graph.streams.get_mut(stream) {
                    stream.device.push_pending_kernel(node);
                }
            }
            FunctionKind::OmpSync => {
                // A barrier that executed callees is no pure barrier; mark it
                // so the barrier rule leaves it alone.
                if let Some(enter) = self.graph.node(node).partner() {
                    if self.graph.graph.get_edge(enter, node).is_none() {
                        self.graph
                            .node_mut(node)
                            .set_counter(Counter::OmpIgnoreBarrier, 1);
                    }
                }
            }
            FunctionKind::OmpForkJoin => {
                let stream = self.graph.node(node).stream;
                if self
                    .graph
                    .streams
                    .get(stream)
                    .is_some_and(|s| s.is_device())
                {
                    self.omp.pop_target_region(stream);
                }
            }
            _ => {}
        }
    }

    // ── Finalization ────────────────────────────────────────────

    /// Fold edge blame into node counters and fill the derived activity
    /// counts. Called once after ingestion (and critical-path marking).
    pub fn finalize(&mut self) {
        let mut node_blame: Vec<(NodeRef, u64)> = Vec::new();
        for (_, edge) in self.graph.graph.edges() {
            let blame = edge.blame();
            if blame > 0.0 {
                node_blame.push((edge.to_node(), blame.round() as u64));
            }
        }
        for (node, blame) in node_blame {
            self.graph.node_mut(node).add_counter(Counter::Blame, blame);
        }

        let hosts = self.graph.streams.host_ids().len() as u64;
        let devices = self.graph.streams.device_ids().len() as u64;
        self.stats.add_activity_count(ActivityType::HostStreams, hosts);
        self.stats.add_activity_count(ActivityType::DeviceNum, devices);

        // a device left idle at the end of the trace stays idle to its end
        if devices > 0 && self.offload.active_tasks == 0 && self.offload.idle_start_time > 0 {
            let trace_end = self
                .graph
                .streams
                .iter()
                .filter_map(|s| s.last_node())
                .map(|n| self.graph.node(n).time)
                .max()
                .unwrap_or(0);
            let tail = trace_end.saturating_sub(self.offload.idle_start_time);
            if tail > 0 {
                self.stats
                    .add_stat(crate::statistics::StatMetric::OfldIdleTime, tail);
            }
        }
    }

    /// Element-wise sum of all ranks' statistics.
    pub fn reduce_statistics(&self) -> Result<Statistics, EngineError> {
        let reduced = self.comm.allreduce_sum(&self.stats.as_flat())?;
        Ok(Statistics::from_flat(&reduced))
    }

    /// All local nodes as annotated writer events, in timestamp order.
    pub fn annotated_events(&self) -> Vec<AnnotatedEvent> {
        let mut events: Vec<AnnotatedEvent> = self
            .graph
            .graph
            .nodes()
            .map(|(_, node)| AnnotatedEvent {
                location: node.stream,
                time: node.time,
                kind: node.kind,
                region: node.region,
                name: node.name.clone(),
                counters: node
                    .counters()
                    .iter()
                    .map(|(counter, value)| (CompactString::const_new(counter.as_str()), *value))
                    .collect(),
                synthetic: node.function == FunctionKind::OffloadWaitstate,
            })
            .collect();
        events.sort_by_key(|e| (e.time, e.location));
        events
    }

    // ── Shared rule helpers ─────────────────────────────────────

    /// The enter of a leave node, or `None` with a report when the pairing
    /// is missing (malformed trace).
    pub(crate) fn enter_of(&self, leave: NodeRef) -> Option<NodeRef> {
        let node = self.graph.node(leave);
        match node.partner() {
            Some(enter) => Some(enter),
            None => {
                tracing::warn!(node = %node.name, time = node.time, "leave without partner");
                None
            }
        }
    }

    /// Mark the enter→leave edge of a region blocking; reports when the
    /// direct edge is missing (the region had callees).
    pub(crate) fn make_region_blocking(&mut self, enter: NodeRef, leave: NodeRef) {
        match self.graph.graph.get_edge(enter, leave) {
            Some(edge) => self.graph.graph.make_blocking(edge),
            None => {
                let node = self.graph.node(leave);
                tracing::warn!(node = %node.name, time = node.time, "record edge not found");
            }
        }
    }

    /// Replay buffer ids: graph node indices are stable and rank-local, the
    /// partner returns them verbatim in remote references.
    pub(crate) fn node_id(&self, node: NodeRef) -> u64 {
        node.index() as u64
    }

    /// A zeroed p2p buffer, for rules that build their payload in place.
    pub(crate) fn empty_buffer() -> [u64; P2P_BUF_SIZE] {
        [0; P2P_BUF_SIZE]
    }

    /// Consume the node's payload if it matches the expected shape, putting
    /// anything else back untouched.
    pub(crate) fn take_payload_if(
        &mut self,
        node: NodeRef,
        matches: impl Fn(&NodePayload) -> bool,
    ) -> Option<NodePayload> {
        let payload = self.graph.node(node).payload();
        if matches(payload) && *payload != NodePayload::None {
            Some(self.graph.node_mut(node).take_payload())
        } else {
            None
        }
    }
}
