//! End-to-end analysis fixtures: small hand-built traces driven through the
//! full engine, with the replay transport backed by rank threads.

use std::thread;

use casita_replay::LocalRouter;
use casita_trace::{Definition, TraceEvent};
use casita_types::{
    AttributeValue, Counter, FunctionKind, RecordKind, RegionId, StreamId, StreamKind, attr,
};

use crate::engine::AnalysisEngine;
use crate::statistics::StatMetric;

// ── Region catalog ──────────────────────────────────────────────

const R_CPU: RegionId = RegionId(1);
const R_SEND: RegionId = RegionId(2);
const R_RECV: RegionId = RegionId(3);
const R_ISEND: RegionId = RegionId(4);
const R_IRECV: RegionId = RegionId(5);
const R_WAIT: RegionId = RegionId(6);
const R_WAITALL: RegionId = RegionId(7);
const R_ALLREDUCE: RegionId = RegionId(8);
const R_LAUNCH: RegionId = RegionId(10);
const R_KERNEL: RegionId = RegionId(11);
const R_BARRIER: RegionId = RegionId(13);
const R_TARGET: RegionId = RegionId(14);

fn region_definitions() -> Vec<Definition> {
    let regions = [
        (R_CPU, "compute", FunctionKind::Cpu),
        (R_SEND, "MPI_Send", FunctionKind::MpiSend),
        (R_RECV, "MPI_Recv", FunctionKind::MpiRecv),
        (R_ISEND, "MPI_Isend", FunctionKind::MpiIsend),
        (R_IRECV, "MPI_Irecv", FunctionKind::MpiIrecv),
        (R_WAIT, "MPI_Wait", FunctionKind::MpiWait),
        (R_WAITALL, "MPI_Waitall", FunctionKind::MpiWaitall),
        (R_ALLREDUCE, "MPI_Allreduce", FunctionKind::MpiCollective),
        (R_LAUNCH, "cuLaunchKernel", FunctionKind::OffloadEnqueueKernel),
        (R_KERNEL, "vecAdd_kernel", FunctionKind::OffloadKernel),
        (R_BARRIER, "omp_barrier", FunctionKind::OmpSync),
        (R_TARGET, "omp_target", FunctionKind::OmpTargetOffload),
    ];
    regions
        .into_iter()
        .map(|(id, name, role)| Definition::Region {
            id,
            name: name.into(),
            role,
        })
        .collect()
}

fn location(id: u64, name: &str, kind: StreamKind, rank: u32) -> Definition {
    Definition::Location {
        id: StreamId(id),
        name: name.into(),
        kind,
        rank,
    }
}

fn event(location: u64, time: u64, kind: RecordKind, region: RegionId) -> TraceEvent {
    TraceEvent {
        location: StreamId(location),
        time,
        kind,
        region,
        attributes: vec![],
    }
}

fn event_with(
    location: u64,
    time: u64,
    kind: RecordKind,
    region: RegionId,
    attributes: &[(&str, u64)],
) -> TraceEvent {
    TraceEvent {
        location: StreamId(location),
        time,
        kind,
        region,
        attributes: attributes
            .iter()
            .map(|(key, value)| ((*key).into(), AttributeValue::Uint(*value)))
            .collect(),
    }
}

/// Run one engine per rank, each on its own thread, over a shared router.
/// Events must already be sorted by time per rank.
fn run_ranks(definitions: Vec<Definition>, per_rank: Vec<Vec<TraceEvent>>) -> Vec<AnalysisEngine> {
    let router = LocalRouter::new(per_rank.len() as u32);
    let handles: Vec<_> = per_rank
        .into_iter()
        .enumerate()
        .map(|(rank, events)| {
            let comm = router.comm(rank as u32);
            let definitions = definitions.clone();
            thread::spawn(move || {
                let mut engine = AnalysisEngine::new(Box::new(comm), false);
                for definition in &definitions {
                    engine.handle_definition(definition);
                }
                for event in &events {
                    engine.process_event(event).expect("event ingestion");
                }
                engine.finalize();
                engine
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn total_edge_blame(engine: &AnalysisEngine) -> f64 {
    engine.graph().graph.edges().map(|(_, e)| e.blame()).sum()
}

fn blocking_edge_count(engine: &AnalysisEngine) -> usize {
    engine
        .graph()
        .graph
        .edges()
        .filter(|(_, e)| e.is_blocking())
        .count()
}

fn waiting_time_at(engine: &AnalysisEngine, stream: u64, time: u64) -> Option<u64> {
    let node = engine.graph().node_at(StreamId(stream), time)?;
    engine.graph().node(node).counter(Counter::WaitingTime)
}

// ── Late sender / late receiver ─────────────────────────────────

#[test]
fn late_sender_gives_receiver_waiting_time() {
    let mut definitions = region_definitions();
    definitions.push(location(0, "rank0", StreamKind::Mpi, 0));
    definitions.push(location(1, "rank1", StreamKind::Mpi, 1));

    let rank0 = vec![
        event_with(0, 100, RecordKind::Enter, R_SEND, &[(attr::MPI_PARTNER, 1)]),
        event(0, 110, RecordKind::Leave, R_SEND),
    ];
    let rank1 = vec![
        event_with(1, 80, RecordKind::Enter, R_RECV, &[(attr::MPI_PARTNER, 0)]),
        event(1, 115, RecordKind::Leave, R_RECV),
    ];
    let engines = run_ranks(definitions, vec![rank0, rank1]);

    // receiver waited from 80 until the send completed at 110
    assert_eq!(waiting_time_at(&engines[1], 1, 115), Some(30));
    let recv_enter = engines[1].graph().node_at(StreamId(1), 80).unwrap();
    let recv_leave = engines[1].graph().node_at(StreamId(1), 115).unwrap();
    let edge = engines[1]
        .graph()
        .graph
        .get_edge(recv_enter, recv_leave)
        .expect("recv region edge");
    assert!(engines[1].graph().graph.edge(edge).is_blocking());
    assert_eq!(engines[1].stats().stat_count(StatMetric::MpiLateSender), 1);
    assert_eq!(engines[1].stats().stat_time(StatMetric::MpiLateSender), 30);
    // the receiver leave is a blocking MPI boundary for later blame walks
    assert!(engines[1].graph().node(recv_leave).is_mpi_blocking());
}

#[test]
fn late_receiver_turns_into_blame_without_wait_state() {
    let mut definitions = region_definitions();
    definitions.push(location(0, "rank0", StreamKind::Mpi, 0));
    definitions.push(location(1, "rank1", StreamKind::Mpi, 1));

    let rank0 = vec![
        event(0, 0, RecordKind::Enter, R_CPU),
        event(0, 90, RecordKind::Leave, R_CPU),
        event_with(0, 100, RecordKind::Enter, R_SEND, &[(attr::MPI_PARTNER, 1)]),
        event(0, 140, RecordKind::Leave, R_SEND),
    ];
    let rank1 = vec![
        event(1, 0, RecordKind::Enter, R_CPU),
        event(1, 150, RecordKind::Leave, R_CPU),
        event_with(1, 160, RecordKind::Enter, R_RECV, &[(attr::MPI_PARTNER, 0)]),
        event(1, 170, RecordKind::Leave, R_RECV),
    ];
    let engines = run_ranks(definitions, vec![rank0, rank1]);

    // the send completed buffered; nobody shows a wait state
    for engine in &engines {
        for (_, node) in engine.graph().graph.nodes() {
            assert_eq!(node.counter(Counter::WaitingTime), None);
        }
        assert_eq!(blocking_edge_count(engine), 0);
    }
    // blame 60 (receive posted at 160, send entered at 100) on the sender,
    // distributed backward from the send enter
    assert!((total_edge_blame(&engines[0]) - 60.0).abs() < 1e-6);
    // the receive side charges its own late arrival as well
    assert!((total_edge_blame(&engines[1]) - 60.0).abs() < 1e-6);
    assert_eq!(engines[1].stats().stat_count(StatMetric::MpiLateReceiver), 1);
}

// ── Wait-all ────────────────────────────────────────────────────

#[test]
fn waitall_accounts_for_the_latest_partner() {
    let mut definitions = region_definitions();
    definitions.push(location(0, "rank0", StreamKind::Mpi, 0));
    definitions.push(location(1, "rank1", StreamKind::Mpi, 1));

    let rank0 = vec![
        event_with(
            0,
            100,
            RecordKind::Enter,
            R_ISEND,
            &[(attr::MPI_PARTNER, 1), (attr::MPI_REQUEST, 1)],
        ),
        event(0, 110, RecordKind::Leave, R_ISEND),
        event_with(
            0,
            120,
            RecordKind::Enter,
            R_ISEND,
            &[(attr::MPI_PARTNER, 1), (attr::MPI_REQUEST, 2)],
        ),
        event(0, 130, RecordKind::Leave, R_ISEND),
        event(0, 180, RecordKind::Enter, R_WAITALL),
        event(0, 400, RecordKind::Leave, R_WAITALL),
    ];
    let rank1 = vec![
        event_with(
            1,
            190,
            RecordKind::Enter,
            R_IRECV,
            &[(attr::MPI_PARTNER, 0), (attr::MPI_REQUEST, 11)],
        ),
        event(1, 200, RecordKind::Leave, R_IRECV),
        event_with(
            1,
            340,
            RecordKind::Enter,
            R_IRECV,
            &[(attr::MPI_PARTNER, 0), (attr::MPI_REQUEST, 12)],
        ),
        event(1, 350, RecordKind::Leave, R_IRECV),
        event_with(1, 360, RecordKind::Enter, R_WAIT, &[(attr::MPI_REQUEST, 11)]),
        event(1, 365, RecordKind::Leave, R_WAIT),
        event_with(1, 370, RecordKind::Enter, R_WAIT, &[(attr::MPI_REQUEST, 12)]),
        event(1, 375, RecordKind::Leave, R_WAIT),
    ];
    let engines = run_ranks(definitions, vec![rank0, rank1]);

    // partners finished at 200 and 350; the wait spans [180, 400]
    assert_eq!(waiting_time_at(&engines[0], 0, 400), Some(170));
    assert_eq!(
        engines[0]
            .stats()
            .stat_count(StatMetric::MpiWaitallLatePartner),
        1
    );
    // every request record was consumed by the rule
    let stream = engines[0].graph().streams.get(StreamId(0)).unwrap();
    assert_eq!(stream.mpi.pending_count(), 0);
    // the remote edge points at the latest partner's operation
    let waitall_leave = engines[0].graph().node_at(StreamId(0), 400).unwrap();
    let remote = engines[0]
        .mpi_state()
        .remote_edge(waitall_leave)
        .expect("remote edge at wait-all leave");
    assert_eq!(remote.remote_rank, 1);
}

// ── Collectives ─────────────────────────────────────────────────

#[test]
fn collective_blames_the_latest_arriver() {
    let mut definitions = region_definitions();
    definitions.push(location(0, "rank0", StreamKind::Mpi, 0));
    definitions.push(location(1, "rank1", StreamKind::Mpi, 1));

    let rank0 = vec![
        event(0, 100, RecordKind::Enter, R_ALLREDUCE),
        event(0, 200, RecordKind::Leave, R_ALLREDUCE),
    ];
    let rank1 = vec![
        event(1, 0, RecordKind::Enter, R_CPU),
        event(1, 140, RecordKind::Leave, R_CPU),
        event(1, 150, RecordKind::Enter, R_ALLREDUCE),
        event(1, 200, RecordKind::Leave, R_ALLREDUCE),
    ];
    let engines = run_ranks(definitions, vec![rank0, rank1]);

    // rank 0 entered at 100 and waited for rank 1's 150
    assert_eq!(waiting_time_at(&engines[0], 0, 200), Some(50));
    assert_eq!(engines[0].stats().stat_count(StatMetric::MpiCollective), 1);
    assert_eq!(blocking_edge_count(&engines[0]), 1);
    // rank 1, the bottleneck, inherits the 50 ticks as blame
    assert!((total_edge_blame(&engines[1]) - 50.0).abs() < 1e-6);
    assert_eq!(waiting_time_at(&engines[1], 1, 200), None);
}

// ── Device idle ─────────────────────────────────────────────────

#[test]
fn device_idle_blames_the_launching_host_stream() {
    let mut definitions = region_definitions();
    definitions.push(location(0, "host0", StreamKind::Host, 0));
    definitions.push(location(100, "gpu0", StreamKind::Device, 0));

    let events = vec![
        event_with(0, 20, RecordKind::Enter, R_LAUNCH, &[(attr::OFFLOAD_DEVICE_REF, 100)]),
        event(0, 25, RecordKind::Leave, R_LAUNCH),
        event(100, 30, RecordKind::Enter, R_KERNEL),
        event(100, 40, RecordKind::Leave, R_KERNEL),
        event_with(0, 48, RecordKind::Enter, R_LAUNCH, &[(attr::OFFLOAD_DEVICE_REF, 100)]),
        event(0, 50, RecordKind::Leave, R_LAUNCH),
        event(100, 100, RecordKind::Enter, R_KERNEL),
        event(100, 200, RecordKind::Leave, R_KERNEL),
    ];
    let engines = run_ranks(definitions, vec![events]);
    let engine = &engines[0];

    // idle [40, 100] lands on the edge into the second launch enter
    let launch1_leave = engine.graph().node_at(StreamId(0), 25).unwrap();
    let launch2_enter = engine.graph().node_at(StreamId(0), 48).unwrap();
    let edge = engine
        .graph()
        .graph
        .get_edge(launch1_leave, launch2_enter)
        .expect("host chain edge");
    assert!((engine.graph().graph.edge(edge).blame() - 60.0).abs() < 1e-6);
    assert!((total_edge_blame(engine) - 60.0).abs() < 1e-6);
    // launch pairing produced the cross-stream edges
    let kernel2_enter = engine.graph().node_at(StreamId(100), 100).unwrap();
    assert!(
        engine
            .graph()
            .graph
            .get_edge(launch2_enter, kernel2_enter)
            .is_some()
    );
    // idle before the first kernel (5 ticks) plus the measured 60
    assert_eq!(engine.stats().stat_time(StatMetric::OfldIdleTime), 65);
}

// ── OpenMP barrier ──────────────────────────────────────────────

#[test]
fn barrier_waits_are_relative_to_the_latest_arriver() {
    let mut definitions = region_definitions();
    definitions.push(location(1, "thread0", StreamKind::Host, 0));
    definitions.push(location(2, "thread1", StreamKind::Host, 0));
    definitions.push(location(3, "thread2", StreamKind::Host, 0));

    let events = vec![
        event(1, 10, RecordKind::Enter, R_BARRIER),
        event(2, 15, RecordKind::Enter, R_BARRIER),
        event(3, 20, RecordKind::Enter, R_BARRIER),
        event(1, 22, RecordKind::Leave, R_BARRIER),
        event(2, 22, RecordKind::Leave, R_BARRIER),
        event(3, 22, RecordKind::Leave, R_BARRIER),
    ];
    let engines = run_ranks(definitions, vec![events]);
    let engine = &engines[0];

    assert_eq!(waiting_time_at(engine, 1, 22), Some(12));
    assert_eq!(waiting_time_at(engine, 2, 22), Some(7));
    assert_eq!(waiting_time_at(engine, 3, 22), Some(0));

    let enter1 = engine.graph().node_at(StreamId(1), 10).unwrap();
    let enter2 = engine.graph().node_at(StreamId(2), 15).unwrap();
    let enter3 = engine.graph().node_at(StreamId(3), 20).unwrap();
    for early in [enter1, enter2] {
        let edge = engine
            .graph()
            .graph
            .get_edge(early, enter3)
            .expect("blocking edge to the latest arriver");
        assert!(engine.graph().graph.edge(edge).is_blocking());
    }
    assert_eq!(engine.stats().stat_time(StatMetric::OmpBarrier), 19);
}

#[test]
fn barrier_with_callees_is_excluded() {
    let mut definitions = region_definitions();
    definitions.push(location(1, "thread0", StreamKind::Host, 0));

    // something executed inside the barrier region
    let events = vec![
        event(1, 10, RecordKind::Enter, R_BARRIER),
        event(1, 12, RecordKind::Enter, R_CPU),
        event(1, 18, RecordKind::Leave, R_CPU),
        event(1, 20, RecordKind::Leave, R_BARRIER),
    ];
    let engines = run_ranks(definitions, vec![events]);
    let engine = &engines[0];
    let leave = engine.graph().node_at(StreamId(1), 20).unwrap();
    assert_eq!(
        engine.graph().node(leave).counter(Counter::OmpIgnoreBarrier),
        Some(1)
    );
    assert_eq!(engine.graph().node(leave).counter(Counter::WaitingTime), None);
    assert_eq!(engine.stats().stat_count(StatMetric::OmpBarrier), 0);
}

#[test]
fn unlaunched_device_stays_idle_to_trace_end() {
    let mut definitions = region_definitions();
    definitions.push(location(0, "host0", StreamKind::Host, 0));
    definitions.push(location(100, "gpu0", StreamKind::Device, 0));

    // the launch is queued but no kernel ever runs on the device
    let events = vec![
        event(100, 5, RecordKind::Enter, R_CPU),
        event(100, 10, RecordKind::Leave, R_CPU),
        event_with(0, 50, RecordKind::Enter, R_LAUNCH, &[(attr::OFFLOAD_DEVICE_REF, 100)]),
        event(0, 55, RecordKind::Leave, R_LAUNCH),
        event(0, 60, RecordKind::Enter, R_CPU),
        event(0, 300, RecordKind::Leave, R_CPU),
    ];
    let engines = run_ranks(definitions, vec![events]);
    // idle from the first offload leave (the launch, t=55) to trace end
    assert_eq!(
        engines[0].stats().stat_time(StatMetric::OfldIdleTime),
        300 - 55
    );
}

// ── Target region ───────────────────────────────────────────────

#[test]
fn target_region_stitches_host_and_device() {
    let mut definitions = region_definitions();
    definitions.push(location(1, "host0", StreamKind::Host, 0));
    definitions.push(location(100, "gpu0", StreamKind::Device, 0));

    let events = vec![
        event(1, 500, RecordKind::Enter, R_TARGET),
        event(100, 510, RecordKind::Enter, R_CPU),
        event(100, 690, RecordKind::Leave, R_CPU),
        event_with(
            1,
            700,
            RecordKind::Leave,
            R_TARGET,
            &[(attr::OMP_TARGET_LOCATION_REF, 100)],
        ),
    ];
    let engines = run_ranks(definitions, vec![events]);
    let engine = &engines[0];

    let begin = engine.graph().node_at(StreamId(1), 500).unwrap();
    let leave = engine.graph().node_at(StreamId(1), 700).unwrap();
    let first = engine.graph().node_at(StreamId(100), 510).unwrap();
    let last = engine.graph().node_at(StreamId(100), 690).unwrap();

    assert!(engine.graph().graph.get_edge(begin, first).is_some());
    let closing = engine
        .graph()
        .graph
        .get_edge(last, leave)
        .expect("device-to-host closing edge");
    assert_eq!(
        engine.graph().graph.edge(closing).kind(),
        casita_graph::EdgeKind::CausesWaitState
    );

    let host_edge = engine
        .graph()
        .graph
        .get_edge(begin, leave)
        .expect("host span edge");
    assert!(engine.graph().graph.edge(host_edge).is_blocking());
    assert_eq!(
        engine.graph().node(begin).counter(Counter::WaitState),
        Some(200)
    );
}

// ── Neutral traces & protocol errors ────────────────────────────

#[test]
fn serial_trace_stays_free_of_blocking_and_blame() {
    let mut definitions = region_definitions();
    definitions.push(location(0, "host0", StreamKind::Host, 0));

    let events = vec![
        event(0, 0, RecordKind::Enter, R_CPU),
        event(0, 10, RecordKind::Enter, R_CPU),
        event(0, 20, RecordKind::Leave, R_CPU),
        event(0, 30, RecordKind::Leave, R_CPU),
        event(0, 40, RecordKind::Atomic, R_CPU),
    ];
    let engines = run_ranks(definitions, vec![events]);
    assert_eq!(blocking_edge_count(&engines[0]), 0);
    assert_eq!(total_edge_blame(&engines[0]), 0.0);
    for (_, node) in engines[0].graph().graph.nodes() {
        assert_eq!(node.counter(Counter::WaitingTime), None);
        assert_eq!(node.counter(Counter::Blame), None);
    }
}

#[test]
fn send_to_unknown_partner_is_reported_and_skipped() {
    let mut definitions = region_definitions();
    definitions.push(location(0, "rank0", StreamKind::Mpi, 0));

    let events = vec![
        event_with(0, 100, RecordKind::Enter, R_SEND, &[(attr::MPI_PARTNER, 9)]),
        event(0, 110, RecordKind::Leave, R_SEND),
    ];
    let engines = run_ranks(definitions, vec![events]);
    // the rule backed off: no blocking, no blame, no remote edges
    assert_eq!(blocking_edge_count(&engines[0]), 0);
    assert_eq!(total_edge_blame(&engines[0]), 0.0);
    assert_eq!(engines[0].mpi_state().remote_edges().count(), 0);
}

#[test]
fn malformed_timestamps_are_skipped_in_lenient_mode() {
    let mut definitions = region_definitions();
    definitions.push(location(0, "host0", StreamKind::Host, 0));

    let events = vec![
        event(0, 50, RecordKind::Enter, R_CPU),
        event(0, 40, RecordKind::Leave, R_CPU), // regression
        event(0, 60, RecordKind::Leave, R_CPU),
    ];
    let engines = run_ranks(definitions, vec![events]);
    assert_eq!(engines[0].graph().graph.node_count(), 2);
}

#[test]
fn annotated_events_carry_counters_in_time_order() {
    let mut definitions = region_definitions();
    definitions.push(location(0, "rank0", StreamKind::Mpi, 0));
    definitions.push(location(1, "rank1", StreamKind::Mpi, 1));

    let rank0 = vec![
        event_with(0, 100, RecordKind::Enter, R_SEND, &[(attr::MPI_PARTNER, 1)]),
        event(0, 110, RecordKind::Leave, R_SEND),
    ];
    let rank1 = vec![
        event_with(1, 80, RecordKind::Enter, R_RECV, &[(attr::MPI_PARTNER, 0)]),
        event(1, 115, RecordKind::Leave, R_RECV),
    ];
    let engines = run_ranks(definitions, vec![rank0, rank1]);
    let annotated = engines[1].annotated_events();
    assert!(annotated.windows(2).all(|w| w[0].time <= w[1].time));
    let leave = annotated.iter().find(|e| e.time == 115).unwrap();
    assert!(
        leave
            .counters
            .iter()
            .any(|(name, value)| name == "waiting_time" && *value == 30)
    );
}
