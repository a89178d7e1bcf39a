//! Distributed critical-path computation.
//!
//! The program-wide critical path is the longest causal chain of
//! non-blocking edges from program start to program end. A reduction across
//! ranks locates the global end; the owning rank then walks its graph
//! backward and, whenever it crosses a remote MPI dependency, hands the walk
//! off to the partner rank with a `REVERSE_REPLAY` token. Every rank records
//! the sections it owns, marks their locally critical nodes, and a final sum
//! reduction yields the global path length.

use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use casita_analysis::{AnalysisEngine, RemoteEdgeDirection};
use casita_graph::{EdgeRef, NodeRef};
use casita_replay::{CommError, Communicator as _, P2pBuffer, REVERSE_REPLAY_TAG};
use casita_types::{Counter, StreamId};

// ── Section references ──────────────────────────────────────────

/// A graph node reference that is safe to serialize across ranks.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionRef {
    pub stream: StreamId,
    pub time: u64,
}

/// A contiguous slice of the critical path owned by one rank, bounded by
/// MPI operations (or the program's endpoints).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CriticalPathSection {
    pub rank: u32,
    pub start: SectionRef,
    pub end: SectionRef,
}

/// Result of the distributed analysis on one rank.
#[derive(Debug, Clone)]
pub struct CriticalPathResult {
    /// Sections owned by this rank, in discovery (reverse-walk) order.
    pub sections: Vec<CriticalPathSection>,
    /// Sum of this rank's section lengths.
    pub local_length: u64,
    /// Sum of all ranks' section lengths.
    pub global_length: u64,
}

// ── Errors ──────────────────────────────────────────────────────

#[derive(Debug)]
pub enum CriticalPathError {
    Comm(CommError),
    /// A handoff token referenced a node this rank does not have; the trace
    /// is corrupt.
    MissingRemotePartner { stream: StreamId, node_id: u64 },
}

impl fmt::Display for CriticalPathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Comm(err) => write!(f, "{err}"),
            Self::MissingRemotePartner { stream, node_id } => {
                write!(
                    f,
                    "remote partner node {node_id} on stream {stream} not found"
                )
            }
        }
    }
}

impl std::error::Error for CriticalPathError {}

impl From<CommError> for CriticalPathError {
    fn from(value: CommError) -> Self {
        Self::Comm(value)
    }
}

// ── Handoff tokens ──────────────────────────────────────────────

const TOKEN_CONTINUE: u64 = 1;
const TOKEN_DONE: u64 = 2;

fn continue_token(stream: StreamId, node_id: u64) -> P2pBuffer {
    [TOKEN_CONTINUE, stream.0, node_id, 0, 0]
}

fn done_token() -> P2pBuffer {
    [TOKEN_DONE, 0, 0, 0, 0]
}

// ── Entry point ─────────────────────────────────────────────────

/// Compute the critical path across all ranks. Every rank must call this
/// after its analysis finished; the call blocks until the walk completed
/// globally.
pub fn compute_critical_path(
    engine: &mut AnalysisEngine,
) -> Result<CriticalPathResult, CriticalPathError> {
    let rank = engine.comm().rank();
    let size = engine.comm().size();

    let local_end = find_local_end(engine);
    let end_times = engine
        .comm()
        .allgather(local_end.map(|(_, t)| t).unwrap_or(0))?;
    let end_rank = find_critical_path_end(&end_times);

    let mut sections = Vec::new();
    let mut walking = rank == end_rank;
    let mut current = local_end.map(|(node, _)| node);
    let mut done = size == 1;

    if walking {
        match current {
            Some(_) => {
                tracing::debug!(rank, time = end_times[rank as usize], "critical path end");
            }
            None if !done => {
                // nothing to walk anywhere; release the other ranks
                for other in (0..size).filter(|r| *r != rank) {
                    engine.comm().send(other, REVERSE_REPLAY_TAG, &done_token())?;
                }
                done = true;
            }
            None => done = true,
        }
    }

    while !done {
        if walking {
            let end = current.expect("walking rank has a position");
            let (boundary, handoff) = walk_to_boundary(engine, end);
            sections.push(section(engine, rank, boundary, end));
            match handoff {
                Some((remote_rank, remote_stream, remote_node)) => {
                    engine.comm().send(
                        remote_rank,
                        REVERSE_REPLAY_TAG,
                        &continue_token(remote_stream, remote_node),
                    )?;
                    walking = false;
                }
                None => {
                    // program start reached: release every other rank
                    for other in (0..size).filter(|r| *r != rank) {
                        engine.comm().send(other, REVERSE_REPLAY_TAG, &done_token())?;
                    }
                    done = true;
                }
            }
        } else {
            let (_, token) = engine.comm().recv_any(REVERSE_REPLAY_TAG)?;
            match token[0] {
                TOKEN_CONTINUE => {
                    let stream = StreamId(token[1]);
                    let node = resolve_remote_node(engine, stream, token[2])?;
                    current = Some(node);
                    walking = true;
                }
                _ => done = true,
            }
        }
    }

    // single-rank runs cover the whole graph with one section
    if size == 1 {
        if let Some((end, _)) = local_end {
            let (boundary, _) = walk_to_boundary(engine, end);
            sections.push(section(engine, rank, boundary, end));
        }
    }

    let mut local_length = 0u64;
    for s in &sections {
        local_length = local_length.saturating_add(process_section(engine, s));
    }
    let global_length = engine.comm().allreduce_sum(&[local_length])?[0];

    Ok(CriticalPathResult {
        sections,
        local_length,
        global_length,
    })
}

/// The rank owning the globally last node: latest end time, lowest rank on
/// ties.
fn find_critical_path_end(end_times: &[u64]) -> u32 {
    let mut best = 0usize;
    for (index, time) in end_times.iter().enumerate() {
        if *time > end_times[best] {
            best = index;
        }
    }
    best as u32
}

fn find_local_end(engine: &AnalysisEngine) -> Option<(NodeRef, u64)> {
    engine
        .graph()
        .streams
        .iter()
        .filter_map(|stream| stream.last_node())
        .map(|node| (node, engine.graph().node(node).time))
        .max_by_key(|(node, time)| (*time, node.index()))
}

fn section(
    engine: &AnalysisEngine,
    rank: u32,
    start: NodeRef,
    end: NodeRef,
) -> CriticalPathSection {
    let start_node = engine.graph().node(start);
    let end_node = engine.graph().node(end);
    CriticalPathSection {
        rank,
        start: SectionRef {
            stream: start_node.stream,
            time: start_node.time,
        },
        end: SectionRef {
            stream: end_node.stream,
            time: end_node.time,
        },
    }
}

fn resolve_remote_node(
    engine: &AnalysisEngine,
    stream: StreamId,
    node_id: u64,
) -> Result<NodeRef, CriticalPathError> {
    let node = NodeRef::from_index(node_id as u32);
    if engine.graph().graph.contains_node(node) && engine.graph().node(node).stream == stream {
        Ok(node)
    } else {
        Err(CriticalPathError::MissingRemotePartner { stream, node_id })
    }
}

// ── Backward walk ───────────────────────────────────────────────

/// Walk backward from `end` following the heaviest (longest, non-blocking
/// preferred) predecessor until reaching either a node with a remote
/// dependency (handoff) or a node without predecessors (program start).
fn walk_to_boundary(
    engine: &AnalysisEngine,
    end: NodeRef,
) -> (NodeRef, Option<(u32, StreamId, u64)>) {
    let graph = engine.graph();
    let mut current = end;
    loop {
        if let Some(edge) = engine.mpi_state().remote_edge(current) {
            if edge.direction == RemoteEdgeDirection::RemoteToLocal {
                return (
                    current,
                    Some((edge.remote_rank, edge.remote_stream, edge.remote_node_id)),
                );
            }
        }
        let predecessors = graph.graph.in_edges(current);
        let Some(best) = predecessors
            .iter()
            .copied()
            .min_by_key(|e| {
                let edge = graph.graph.edge(*e);
                (edge.weight(), graph.node(edge.from_node()).time)
            })
        else {
            return (current, None);
        };
        current = graph.graph.edge(best).from_node();
    }
}

// ── Section processing ──────────────────────────────────────────

/// Longest-duration path between the section endpoints on the complemented
/// weights, excluding blocking edges. Nodes on the path get the
/// `CRITICAL_PATH` counter; the section length is the path's duration sum.
fn process_section(engine: &mut AnalysisEngine, section: &CriticalPathSection) -> u64 {
    let Some(end) = engine
        .graph()
        .node_at(section.end.stream, section.end.time)
    else {
        tracing::warn!(?section, "section end not resolvable");
        return 0;
    };
    let start = engine
        .graph()
        .node_at(section.start.stream, section.start.time);
    let Some(start) = start else {
        tracing::warn!(?section, "section start not resolvable");
        return 0;
    };

    match longest_path(engine, start, end) {
        Some((length, path)) => {
            for node in path {
                engine
                    .graph_mut()
                    .node_mut(node)
                    .set_counter(Counter::CriticalPath, 1);
            }
            length
        }
        None => {
            // disconnected endpoints: fall back to the end's own stream
            let fallback = engine
                .graph()
                .streams
                .get(section.end.stream)
                .and_then(|s| s.first_node());
            match fallback.and_then(|f| longest_path(engine, f, end)) {
                Some((length, path)) => {
                    for node in path {
                        engine
                            .graph_mut()
                            .node_mut(node)
                            .set_counter(Counter::CriticalPath, 1);
                    }
                    length
                }
                None => {
                    tracing::warn!(?section, "no path through section");
                    engine
                        .graph_mut()
                        .node_mut(end)
                        .set_counter(Counter::CriticalPath, 1);
                    0
                }
            }
        }
    }
}

/// Maximum-duration path `start → end`, computed as a DAG relaxation in
/// `(time, arena index)` order (timestamps make the graph acyclic once
/// reverse edges are excluded). Blocking edges are infinitely heavy: a path
/// crosses one only when no alternative exists, so per node the relaxation
/// first minimizes crossed blocking edges and then maximizes duration.
fn longest_path(
    engine: &AnalysisEngine,
    start: NodeRef,
    end: NodeRef,
) -> Option<(u64, Vec<NodeRef>)> {
    let graph = engine.graph();
    let start_time = graph.node(start).time;
    let end_time = graph.node(end).time;
    if start_time > end_time {
        return None;
    }

    let mut order: Vec<NodeRef> = graph
        .graph
        .nodes()
        .filter(|(_, n)| n.time >= start_time && n.time <= end_time)
        .map(|(r, _)| r)
        .collect();
    order.sort_by_key(|r| (graph.node(*r).time, r.index()));

    struct Best {
        blocking: u32,
        duration: u64,
        via: Option<EdgeRef>,
    }
    let mut best: FxHashMap<u32, Best> = FxHashMap::default();
    best.insert(
        start.index(),
        Best {
            blocking: 0,
            duration: 0,
            via: None,
        },
    );

    for node in &order {
        let (blocking, duration) = match best.get(&node.index()) {
            Some(b) => (b.blocking, b.duration),
            None => continue,
        };
        for edge_ref in graph.graph.out_edges(*node) {
            let edge = graph.graph.edge(*edge_ref);
            if edge.is_reverse() {
                continue;
            }
            let to = edge.to_node();
            if graph.node(to).time > end_time {
                continue;
            }
            let candidate = Best {
                blocking: blocking + edge.is_blocking() as u32,
                duration: duration + edge.duration(),
                via: Some(*edge_ref),
            };
            let better = match best.get(&to.index()) {
                None => true,
                Some(existing) => {
                    candidate.blocking < existing.blocking
                        || (candidate.blocking == existing.blocking
                            && candidate.duration > existing.duration)
                }
            };
            if better {
                best.insert(to.index(), candidate);
            }
        }
    }

    let length = best.get(&end.index())?.duration;
    let mut path = vec![end];
    let mut cursor = end;
    while cursor != start {
        let via = best.get(&cursor.index()).and_then(|b| b.via)?;
        cursor = graph.graph.edge(via).from_node();
        path.push(cursor);
    }
    path.reverse();
    Some((length, path))
}
