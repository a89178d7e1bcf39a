//! MPI paradigm: pending-request handling, the point-to-point and collective
//! rules, and the remote-edge table feeding the critical-path analysis.
//!
//! Every rule replays the original communication over the analyzer's own
//! transport; since each rank dispatches its rules in trace order, the replay
//! pairs up exactly like the application's sends and receives did.

use rustc_hash::FxHashMap;

use casita_graph::{MpiRequestRecord, NodePayload, NodeRef};
use casita_replay::{OpKind, REPLAY_TAG, REVERSE_REPLAY_TAG, buffer_op_kind, p2p_buffer};
use casita_types::{AttributeList, Counter, FunctionKind, RequestId, StreamId, attr, attribute_u64};

use crate::blame::{distribute_blame, mpi_stream_walk};
use crate::engine::AnalysisEngine;
use crate::statistics::{ActivityType, StatMetric};

// ── Remote edges ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEdgeDirection {
    /// The local operation caused work on the remote side.
    LocalToRemote,
    /// The local operation depended on the remote side; the critical path
    /// hops to the partner rank here.
    RemoteToLocal,
}

/// A cross-rank dependency: local node to a `(stream, node-id)` on another
/// rank. Used only for critical-path traversal.
#[derive(Debug, Clone)]
pub struct RemoteMpiEdge {
    pub local_node: NodeRef,
    pub remote_rank: u32,
    pub remote_stream: StreamId,
    pub remote_node_id: u64,
    pub direction: RemoteEdgeDirection,
}

#[derive(Default)]
pub struct MpiState {
    remote_edges: FxHashMap<u32, RemoteMpiEdge>,
}

impl MpiState {
    pub fn add_remote_edge(
        &mut self,
        local_node: NodeRef,
        remote_rank: u32,
        remote_stream: StreamId,
        remote_node_id: u64,
        direction: RemoteEdgeDirection,
    ) {
        self.remote_edges.insert(
            local_node.index(),
            RemoteMpiEdge {
                local_node,
                remote_rank,
                remote_stream,
                remote_node_id,
                direction,
            },
        );
    }

    pub fn remote_edge(&self, node: NodeRef) -> Option<&RemoteMpiEdge> {
        self.remote_edges.get(&node.index())
    }

    pub fn remote_edges(&self) -> impl Iterator<Item = &RemoteMpiEdge> {
        self.remote_edges.values()
    }
}

// ── Attribute handling ──────────────────────────────────────────

/// Populate payloads and pending-request records from the event's key-value
/// attributes, before any rule sees the node.
pub(crate) fn handle_attributes(
    engine: &mut AnalysisEngine,
    node: NodeRef,
    attributes: &AttributeList,
) {
    let (function, is_leave, stream_id) = {
        let n = engine.graph.node(node);
        (n.function, n.is_leave(), n.stream)
    };
    if !is_leave {
        return;
    }
    match function {
        FunctionKind::MpiSend | FunctionKind::MpiRecv => {
            if let Some(partner) = attribute_u64(attributes, attr::MPI_PARTNER) {
                engine
                    .graph
                    .node_mut(node)
                    .set_payload(NodePayload::MpiPartner(StreamId(partner)));
            } else {
                tracing::warn!("blocking p2p operation without partner attribute");
            }
        }
        FunctionKind::MpiIsend | FunctionKind::MpiIrecv => {
            let partner = attribute_u64(attributes, attr::MPI_PARTNER);
            let request = attribute_u64(attributes, attr::MPI_REQUEST);
            let (Some(partner), Some(request)) = (partner, request) else {
                tracing::warn!("non-blocking p2p operation without partner/request attributes");
                return;
            };
            let record = MpiRequestRecord {
                request: RequestId(request),
                msg_node: node,
                send_buffer: AnalysisEngine::empty_buffer(),
                recv_buffer: None,
                pending_recv: None,
                partner_rank: 0,
                partner_stream: StreamId(partner),
            };
            if let Some(stream) = engine.graph.streams.get_mut(stream_id) {
                stream.mpi.add_pending(record);
            }
            engine
                .graph
                .node_mut(node)
                .set_payload(NodePayload::MpiRequest(RequestId(request)));
        }
        FunctionKind::MpiWait => {
            let stream = engine.graph.streams.get_mut(stream_id);
            let Some(stream) = stream else { return };
            let request = match attribute_u64(attributes, attr::MPI_REQUEST) {
                Some(id) => {
                    let id = RequestId(id);
                    stream.mpi.claim(id);
                    Some(id)
                }
                None => stream.mpi.claim_oldest(),
            };
            if let Some(request) = request {
                engine
                    .graph
                    .node_mut(node)
                    .set_payload(NodePayload::MpiRequest(request));
            }
        }
        FunctionKind::MpiWaitall => {
            let requests = engine
                .graph
                .streams
                .get_mut(stream_id)
                .map(|s| s.mpi.claim_open())
                .unwrap_or_default();
            if !requests.is_empty() {
                engine
                    .graph
                    .node_mut(node)
                    .set_payload(NodePayload::WaitallRequests(requests));
            }
        }
        _ => {}
    }
}

// ── Blocking point-to-point ─────────────────────────────────────

/// Applied at an MPI_Send leave: replay the send, exchange timestamps with
/// the receiving rank, and classify the pairing as a rendezvous stall, a
/// late receiver, or a late sender.
pub(crate) fn send_rule(engine: &mut AnalysisEngine, leave: NodeRef) -> bool {
    {
        let node = engine.graph.node(leave);
        if node.function != FunctionKind::MpiSend || !node.is_leave() {
            return false;
        }
    }
    let Some(NodePayload::MpiPartner(partner_stream)) =
        engine.take_payload_if(leave, |p| matches!(p, NodePayload::MpiPartner(_)))
    else {
        return false;
    };
    let Some(enter) = engine.enter_of(leave) else {
        return false;
    };
    engine
        .graph
        .node_mut(leave)
        .set_referenced_stream(partner_stream);
    let Some(partner_rank) = engine.rank_of_stream(partner_stream) else {
        tracing::warn!(stream = %partner_stream, "no analyzer rank for send partner");
        return false;
    };

    let send_start = engine.graph.node(enter).time;
    let send_stop = engine.graph.node(leave).time;
    let buffer = p2p_buffer(
        send_start,
        send_stop,
        engine.node_id(enter),
        engine.node_id(leave),
        OpKind::SEND,
    );
    if let Err(err) = engine.comm.send(partner_rank, REPLAY_TAG, &buffer) {
        tracing::warn!(%err, "send replay failed");
        return false;
    }
    let reply = match engine.comm.recv(partner_rank, REVERSE_REPLAY_TAG) {
        Ok(reply) => reply,
        Err(err) => {
            tracing::warn!(%err, "send replay back-channel failed");
            return false;
        }
    };
    engine.stats.count_activity(ActivityType::MpiP2p);

    let partner_op = buffer_op_kind(&reply);
    if partner_op.intersects(OpKind::IRECV) {
        // non-blocking partner: the wait state (if any) shows up at its wait
        engine.mpi.add_remote_edge(
            enter,
            partner_rank,
            partner_stream,
            reply[3],
            RemoteEdgeDirection::LocalToRemote,
        );
        return true;
    }
    if partner_op.intersects(OpKind::SEND | OpKind::ISEND) {
        tracing::warn!(
            partner = partner_rank,
            op = reply[4],
            "send partner replayed a send"
        );
    }

    let recv_start = reply[0];
    if send_start <= recv_start {
        if recv_start <= send_stop {
            // rendezvous stall: the send blocked until the receive was posted
            if send_start < recv_start {
                engine.make_region_blocking(enter, leave);
                engine
                    .graph
                    .node_mut(leave)
                    .set_counter(Counter::WaitingTime, recv_start - send_start);
            }
        } else {
            // the send completed buffered before the receive was even posted
            distribute_blame(
                &mut engine.graph,
                enter,
                recv_start - send_start,
                mpi_stream_walk,
                0,
            );
        }
    } else {
        distribute_blame(
            &mut engine.graph,
            enter,
            send_start - recv_start,
            mpi_stream_walk,
            0,
        );
    }

    engine.mpi.add_remote_edge(
        enter,
        partner_rank,
        partner_stream,
        reply[3],
        RemoteEdgeDirection::LocalToRemote,
    );
    true
}

/// Applied at an MPI_Recv leave: the mirror image of [`send_rule`]. The
/// receiver can only finish once the message is complete, so its waiting
/// time is bounded by the partner's send leave.
pub(crate) fn recv_rule(engine: &mut AnalysisEngine, leave: NodeRef) -> bool {
    {
        let node = engine.graph.node(leave);
        if node.function != FunctionKind::MpiRecv || !node.is_leave() {
            return false;
        }
    }
    let Some(NodePayload::MpiPartner(partner_stream)) =
        engine.take_payload_if(leave, |p| matches!(p, NodePayload::MpiPartner(_)))
    else {
        return false;
    };
    let Some(enter) = engine.enter_of(leave) else {
        return false;
    };
    engine
        .graph
        .node_mut(leave)
        .set_referenced_stream(partner_stream);
    let Some(partner_rank) = engine.rank_of_stream(partner_stream) else {
        tracing::warn!(stream = %partner_stream, "no analyzer rank for recv partner");
        return false;
    };

    let reply = match engine.comm.recv(partner_rank, REPLAY_TAG) {
        Ok(reply) => reply,
        Err(err) => {
            tracing::warn!(%err, "recv replay failed");
            return false;
        }
    };
    let recv_start = engine.graph.node(enter).time;
    let recv_stop = engine.graph.node(leave).time;
    let buffer = p2p_buffer(
        recv_start,
        recv_stop,
        engine.node_id(enter),
        engine.node_id(leave),
        OpKind::RECV,
    );
    if let Err(err) = engine.comm.send(partner_rank, REVERSE_REPLAY_TAG, &buffer) {
        tracing::warn!(%err, "recv replay back-channel failed");
        return false;
    }
    engine.stats.count_activity(ActivityType::MpiP2p);

    let partner_op = buffer_op_kind(&reply);
    if partner_op.intersects(OpKind::RECV | OpKind::IRECV) {
        tracing::warn!(
            partner = partner_rank,
            op = reply[4],
            "recv partner replayed a receive"
        );
        engine.mpi.add_remote_edge(
            leave,
            partner_rank,
            partner_stream,
            reply[3],
            RemoteEdgeDirection::RemoteToLocal,
        );
        return true;
    }

    let send_start = reply[0];
    let send_stop = reply[1];
    if recv_start < send_stop {
        // late sender: the message was not complete when the receive posted
        engine.make_region_blocking(enter, leave);
        engine.graph.node_mut(leave).mark_mpi_blocking();
        let wtime = send_stop.min(recv_stop) - recv_start;
        engine
            .graph
            .node_mut(leave)
            .set_counter(Counter::WaitingTime, wtime);
        engine.stats.add_stat(StatMetric::MpiLateSender, wtime);
    } else if recv_start > send_start {
        // late receiver: charge the work that delayed this receive
        let blame = recv_start - send_start;
        distribute_blame(&mut engine.graph, enter, blame, mpi_stream_walk, 0);
        engine.stats.add_stat(StatMetric::MpiLateReceiver, blame);
    }

    engine.mpi.add_remote_edge(
        leave,
        partner_rank,
        partner_stream,
        reply[3],
        RemoteEdgeDirection::RemoteToLocal,
    );
    true
}

// ── Non-blocking point-to-point ─────────────────────────────────

/// Applied at an MPI_Isend leave: replay the send and post the back-channel
/// receive whose completion the wait rule will pick up.
pub(crate) fn isend_rule(engine: &mut AnalysisEngine, leave: NodeRef) -> bool {
    nonblocking_rule(engine, leave, FunctionKind::MpiIsend)
}

/// Applied at an MPI_Irecv leave: post the replay receive and send our
/// timestamps on the back channel.
pub(crate) fn irecv_rule(engine: &mut AnalysisEngine, leave: NodeRef) -> bool {
    nonblocking_rule(engine, leave, FunctionKind::MpiIrecv)
}

fn nonblocking_rule(engine: &mut AnalysisEngine, leave: NodeRef, function: FunctionKind) -> bool {
    {
        let node = engine.graph.node(leave);
        if node.function != function || !node.is_leave() {
            return false;
        }
    }
    let Some(NodePayload::MpiRequest(request)) =
        engine.take_payload_if(leave, |p| matches!(p, NodePayload::MpiRequest(_)))
    else {
        return false;
    };
    let Some(enter) = engine.enter_of(leave) else {
        return false;
    };
    let stream_id = engine.graph.node(leave).stream;
    let partner_stream = match engine
        .graph
        .streams
        .get(stream_id)
        .and_then(|s| s.mpi.pending(request))
    {
        Some(record) => record.partner_stream,
        None => {
            tracing::warn!(request = request.0, "no pending record for request");
            return false;
        }
    };
    let Some(partner_rank) = engine.rank_of_stream(partner_stream) else {
        tracing::warn!(stream = %partner_stream, "no analyzer rank for request partner");
        return false;
    };

    let start = engine.graph.node(enter).time;
    let stop = engine.graph.node(leave).time;
    let op = if function == FunctionKind::MpiIsend {
        OpKind::ISEND
    } else {
        OpKind::IRECV
    };
    let buffer = p2p_buffer(
        start,
        stop,
        engine.node_id(enter),
        engine.node_id(leave),
        op,
    );

    let exchange = if function == FunctionKind::MpiIsend {
        engine
            .comm
            .send(partner_rank, REPLAY_TAG, &buffer)
            .and_then(|_| engine.comm.irecv(partner_rank, REVERSE_REPLAY_TAG))
    } else {
        engine
            .comm
            .send(partner_rank, REVERSE_REPLAY_TAG, &buffer)
            .and_then(|_| engine.comm.irecv(partner_rank, REPLAY_TAG))
    };
    let handle = match exchange {
        Ok(handle) => handle,
        Err(err) => {
            tracing::warn!(%err, "non-blocking replay failed");
            return false;
        }
    };

    if let Some(record) = engine
        .graph
        .streams
        .get_mut(stream_id)
        .and_then(|s| s.mpi.pending_mut(request))
    {
        record.send_buffer = buffer;
        record.pending_recv = Some(handle);
        record.partner_rank = partner_rank;
    }
    engine
        .graph
        .node_mut(leave)
        .set_referenced_stream(partner_stream);
    engine.stats.count_activity(ActivityType::MpiP2p);
    true
}

// ── Waits ───────────────────────────────────────────────────────

/// Complete one pending request's back-channel receive, returning the
/// partner's buffer. `None` means the exchange failed.
fn complete_record(
    engine: &mut AnalysisEngine,
    stream: StreamId,
    request: RequestId,
) -> Option<[u64; casita_replay::P2P_BUF_SIZE]> {
    let pending = engine
        .graph
        .streams
        .get_mut(stream)
        .and_then(|s| s.mpi.pending_mut(request))
        .and_then(|record| record.pending_recv.take());
    if let Some(handle) = pending {
        match engine.comm.complete(handle) {
            Ok(buffer) => {
                if let Some(record) = engine
                    .graph
                    .streams
                    .get_mut(stream)
                    .and_then(|s| s.mpi.pending_mut(request))
                {
                    record.recv_buffer = Some(buffer);
                }
            }
            Err(err) => {
                tracing::warn!(%err, "completing replay receive failed");
                return None;
            }
        }
    }
    engine
        .graph
        .streams
        .get(stream)
        .and_then(|s| s.mpi.pending(request))
        .and_then(|record| record.recv_buffer)
}

/// Applied at an MPI_Wait leave with an attached request record.
pub(crate) fn wait_rule(engine: &mut AnalysisEngine, leave: NodeRef) -> bool {
    {
        let node = engine.graph.node(leave);
        if node.function != FunctionKind::MpiWait || !node.is_leave() {
            return false;
        }
    }
    let Some(NodePayload::MpiRequest(request)) =
        engine.take_payload_if(leave, |p| matches!(p, NodePayload::MpiRequest(_)))
    else {
        tracing::debug!("wait without pending request");
        return true;
    };
    engine.stats.count_activity(ActivityType::MpiWait);
    let stream_id = engine.graph.node(leave).stream;

    let (msg_node, partner_rank, partner_stream) = match engine
        .graph
        .streams
        .get(stream_id)
        .and_then(|s| s.mpi.pending(request))
    {
        Some(record) => (record.msg_node, record.partner_rank, record.partner_stream),
        None => {
            tracing::warn!(request = request.0, "wait for unknown request");
            return false;
        }
    };
    let msg_function = engine.graph.node(msg_node).function;
    if !msg_function.is_mpi_nonblocking() {
        tracing::warn!(
            node = %engine.graph.node(msg_node).name,
            "only MPI_Isend and MPI_Irecv are supported"
        );
        return false;
    }

    let Some(recv_buffer) = complete_record(engine, stream_id, request) else {
        return false;
    };
    let partner_op = buffer_op_kind(&recv_buffer);
    // a blocking partner folds its wait into the operation itself
    let partner_time = if partner_op.intersects(OpKind::SEND | OpKind::RECV) {
        recv_buffer[0]
    } else {
        recv_buffer[1]
    };

    let Some(enter) = engine.enter_of(leave) else {
        return false;
    };
    let wait_start = engine.graph.node(enter).time;
    let wait_stop = engine.graph.node(leave).time;
    if wait_start < partner_time {
        engine.make_region_blocking(enter, leave);
        engine.mpi.add_remote_edge(
            leave,
            partner_rank,
            partner_stream,
            recv_buffer[3],
            RemoteEdgeDirection::RemoteToLocal,
        );
        // blame walks must treat this leave as a blocking MPI boundary
        engine.graph.node_mut(leave).mark_mpi_blocking();

        let wtime = partner_time.min(wait_stop) - wait_start;
        if partner_op.intersects(OpKind::RECV | OpKind::IRECV) {
            engine.stats.add_stat(StatMetric::MpiLateReceiver, wtime);
        } else if partner_op.intersects(OpKind::SEND | OpKind::ISEND) {
            engine.stats.add_stat(StatMetric::MpiLateSender, wtime);
        }
        engine
            .graph
            .node_mut(leave)
            .set_counter(Counter::WaitingTime, wtime);
    }

    if let Some(stream) = engine.graph.streams.get_mut(stream_id) {
        stream.mpi.remove_pending(request);
    }
    true
}

/// Applied at an MPI_Waitall leave: complete every attached request, keep
/// track of the latest partner, and account a single wait state against it.
pub(crate) fn waitall_rule(engine: &mut AnalysisEngine, leave: NodeRef) -> bool {
    {
        let node = engine.graph.node(leave);
        if node.function != FunctionKind::MpiWaitall || !node.is_leave() {
            return false;
        }
    }
    let Some(NodePayload::WaitallRequests(requests)) =
        engine.take_payload_if(leave, |p| matches!(p, NodePayload::WaitallRequests(_)))
    else {
        tracing::debug!("wait-all without pending requests");
        return true;
    };
    engine.stats.count_activity(ActivityType::MpiWait);
    let stream_id = engine.graph.node(leave).stream;
    let Some(enter) = engine.enter_of(leave) else {
        return false;
    };
    let wait_start = engine.graph.node(enter).time;
    let wait_stop = engine.graph.node(leave).time;

    let mut latest_stop = wait_start;
    let mut latest: Option<(RequestId, u32, StreamId, u64)> = None;
    for request in requests {
        let msg_node = match engine
            .graph
            .streams
            .get(stream_id)
            .and_then(|s| s.mpi.pending(request))
        {
            Some(record) => record.msg_node,
            None => {
                tracing::warn!(request = request.0, "wait-all for unknown request");
                continue;
            }
        };
        if !engine.graph.node(msg_node).function.is_mpi_nonblocking() {
            tracing::warn!(
                node = %engine.graph.node(msg_node).name,
                "only MPI_Isend and MPI_Irecv are supported"
            );
            return false;
        }
        let Some(recv_buffer) = complete_record(engine, stream_id, request) else {
            return false;
        };
        let (partner_rank, partner_stream) = match engine
            .graph
            .streams
            .get(stream_id)
            .and_then(|s| s.mpi.pending(request))
        {
            Some(record) => (record.partner_rank, record.partner_stream),
            None => continue,
        };
        let partner_stop = recv_buffer[1];
        if wait_start < partner_stop && latest_stop < partner_stop {
            latest_stop = partner_stop;
            // keep the new champion's record alive, drop the previous one
            if let Some((previous, ..)) =
                latest.replace((request, partner_rank, partner_stream, recv_buffer[3]))
            {
                if let Some(stream) = engine.graph.streams.get_mut(stream_id) {
                    stream.mpi.remove_pending(previous);
                }
            }
        } else if let Some(stream) = engine.graph.streams.get_mut(stream_id) {
            stream.mpi.remove_pending(request);
        }
    }

    if let Some((request, partner_rank, partner_stream, remote_id)) = latest {
        engine.make_region_blocking(enter, leave);
        engine.mpi.add_remote_edge(
            leave,
            partner_rank,
            partner_stream,
            remote_id,
            RemoteEdgeDirection::RemoteToLocal,
        );
        let wtime = latest_stop.min(wait_stop) - wait_start;
        engine.stats.add_stat(StatMetric::MpiWaitallLatePartner, wtime);
        engine
            .graph
            .node_mut(leave)
            .set_counter(Counter::WaitingTime, wtime);
        if let Some(stream) = engine.graph.streams.get_mut(stream_id) {
            stream.mpi.remove_pending(request);
        }
    }
    true
}

// ── Collectives ─────────────────────────────────────────────────

/// Applied at the leave of a blocking collective: all participants exchange
/// enter times; the latest arriver is the bottleneck and inherits the blame
/// for everyone else's wait.
pub(crate) fn collective_rule(engine: &mut AnalysisEngine, leave: NodeRef) -> bool {
    {
        let node = engine.graph.node(leave);
        if node.function != FunctionKind::MpiCollective || !node.is_leave() {
            return false;
        }
    }
    let Some(enter) = engine.enter_of(leave) else {
        return false;
    };
    let my_enter = engine.graph.node(enter).time;
    let my_stop = engine.graph.node(leave).time;
    let enters = match engine.comm.allgather(my_enter) {
        Ok(enters) => enters,
        Err(err) => {
            tracing::warn!(%err, "collective replay failed");
            return false;
        }
    };
    engine.stats.count_activity(ActivityType::MpiCollective);

    let latest = enters.iter().copied().max().unwrap_or(my_enter);
    let latest_rank = enters
        .iter()
        .position(|t| *t == latest)
        .unwrap_or_default() as u32;

    if my_enter < latest {
        engine.make_region_blocking(enter, leave);
        engine.graph.node_mut(leave).mark_mpi_blocking();
        let wtime = latest.min(my_stop) - my_enter;
        engine.stats.add_stat(StatMetric::MpiCollective, wtime);
        engine
            .graph
            .node_mut(leave)
            .set_counter(Counter::WaitingTime, wtime);
    } else if engine.comm.rank() == latest_rank {
        let blame: u64 = enters.iter().map(|t| latest - *t).sum();
        if blame > 0 {
            distribute_blame(&mut engine.graph, enter, blame, mpi_stream_walk, 0);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_edges_are_keyed_by_local_node() {
        let mut state = MpiState::default();
        let local = NodeRef::from_index(3);
        state.add_remote_edge(
            local,
            1,
            StreamId(7),
            42,
            RemoteEdgeDirection::RemoteToLocal,
        );
        let edge = state.remote_edge(local).unwrap();
        assert_eq!(edge.remote_rank, 1);
        assert_eq!(edge.remote_stream, StreamId(7));
        assert_eq!(edge.remote_node_id, 42);
        assert!(state.remote_edge(NodeRef::from_index(4)).is_none());
        assert_eq!(state.remote_edges().count(), 1);
    }
}
