//! The dense node/edge arena with adjacency lists.
//!
//! Nodes and edges live in append-only vectors owned by the graph and are
//! addressed through opaque `u32` indices, which keeps the node↔edge and
//! stream↔node cycles out of the ownership story entirely.

use rustc_hash::FxHashMap;

use casita_types::Paradigm;

use crate::edge::{Edge, EdgeKind, EdgeRef};
use crate::node::{Node, NodeRef};

#[derive(Default)]
pub struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    outgoing: Vec<Vec<EdgeRef>>,
    incoming: Vec<Vec<EdgeRef>>,
    edge_index: FxHashMap<(u32, u32), EdgeRef>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub(crate) fn push_node(&mut self, node: Node) -> NodeRef {
        let node_ref = NodeRef::from_index(self.nodes.len() as u32);
        self.nodes.push(node);
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        node_ref
    }

    pub fn node(&self, node: NodeRef) -> &Node {
        &self.nodes[node.index() as usize]
    }

    pub fn node_mut(&mut self, node: NodeRef) -> &mut Node {
        &mut self.nodes[node.index() as usize]
    }

    pub fn contains_node(&self, node: NodeRef) -> bool {
        (node.index() as usize) < self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeRef, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeRef::from_index(i as u32), n))
    }

    /// Add an edge. Idempotent on the ordered `(from, to)` pair: if an
    /// equivalent edge already exists it is returned untouched.
    pub fn add_edge(
        &mut self,
        from: NodeRef,
        to: NodeRef,
        paradigm: Paradigm,
        kind: EdgeKind,
        blocking: bool,
    ) -> EdgeRef {
        let key = (from.index(), to.index());
        if let Some(existing) = self.edge_index.get(&key) {
            return *existing;
        }
        let (from_node, to_node) = (self.node(from), self.node(to));
        let edge = Edge::new(
            from,
            to,
            from_node.time,
            to_node.time,
            from_node.stream == to_node.stream,
            paradigm,
            kind,
            blocking,
        );
        let edge_ref = EdgeRef::from_index(self.edges.len() as u32);
        self.edges.push(edge);
        self.outgoing[from.index() as usize].push(edge_ref);
        self.incoming[to.index() as usize].push(edge_ref);
        self.edge_index.insert(key, edge_ref);
        edge_ref
    }

    pub fn get_edge(&self, from: NodeRef, to: NodeRef) -> Option<EdgeRef> {
        self.edge_index.get(&(from.index(), to.index())).copied()
    }

    pub fn edge(&self, edge: EdgeRef) -> &Edge {
        &self.edges[edge.index() as usize]
    }

    pub fn edge_mut(&mut self, edge: EdgeRef) -> &mut Edge {
        &mut self.edges[edge.index() as usize]
    }

    pub fn edges(&self) -> impl Iterator<Item = (EdgeRef, &Edge)> {
        self.edges
            .iter()
            .enumerate()
            .map(|(i, e)| (EdgeRef::from_index(i as u32), e))
    }

    pub fn make_blocking(&mut self, edge: EdgeRef) {
        self.edge_mut(edge).make_blocking();
    }

    pub fn add_blame(&mut self, edge: EdgeRef, amount: f64) {
        self.edge_mut(edge).add_blame(amount);
    }

    pub fn out_edges(&self, node: NodeRef) -> &[EdgeRef] {
        &self.outgoing[node.index() as usize]
    }

    pub fn in_edges(&self, node: NodeRef) -> &[EdgeRef] {
        &self.incoming[node.index() as usize]
    }

    /// The intra-stream out-edge with the earliest target timestamp. Multiple
    /// out-edges are ordered by target time so the choice is deterministic.
    pub fn first_intra_stream_out_edge(&self, node: NodeRef) -> Option<EdgeRef> {
        self.out_edges(node)
            .iter()
            .copied()
            .filter(|e| self.edge(*e).is_intra_stream())
            .min_by_key(|e| self.node(self.edge(*e).to_node()).time)
    }
}
