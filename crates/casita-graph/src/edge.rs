//! Typed directed edges with duration, blocking flag and blame accumulator.

use casita_types::Paradigm;

use crate::node::NodeRef;

/// Opaque index of an edge in the graph's dense edge arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeRef(u32);

impl EdgeRef {
    pub(crate) fn from_index(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

/// Semantic kind of a dependency edge added by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EdgeKind {
    #[default]
    None,
    /// The source made the target wait.
    CausesWaitState,
}

/// A directed dependency between two nodes.
///
/// A reverse edge (source later than target) is always blocking with zero
/// duration; it exists only for critical-path traversal and never counts
/// toward duration-weighted metrics.
#[derive(Debug, Clone)]
pub struct Edge {
    from: NodeRef,
    to: NodeRef,
    duration: u64,
    blocking: bool,
    reverse: bool,
    intra_stream: bool,
    paradigm: Paradigm,
    kind: EdgeKind,
    blame: f64,
}

impl Edge {
    pub(crate) fn new(
        from: NodeRef,
        to: NodeRef,
        from_time: u64,
        to_time: u64,
        intra_stream: bool,
        paradigm: Paradigm,
        kind: EdgeKind,
        blocking: bool,
    ) -> Self {
        let reverse = from_time > to_time;
        Self {
            from,
            to,
            duration: if reverse { 0 } else { to_time - from_time },
            blocking: blocking || reverse,
            reverse,
            intra_stream,
            paradigm,
            kind,
            blame: 0.0,
        }
    }

    pub fn from_node(&self) -> NodeRef {
        self.from
    }

    pub fn to_node(&self) -> NodeRef {
        self.to
    }

    pub fn duration(&self) -> u64 {
        self.duration
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn make_blocking(&mut self) {
        self.blocking = true;
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    pub fn is_intra_stream(&self) -> bool {
        self.intra_stream
    }

    pub fn paradigm(&self) -> Paradigm {
        self.paradigm
    }

    pub fn has_paradigm(&self, paradigm: Paradigm) -> bool {
        self.paradigm.intersects(paradigm)
    }

    pub fn kind(&self) -> EdgeKind {
        self.kind
    }

    pub fn blame(&self) -> f64 {
        self.blame
    }

    pub fn add_blame(&mut self, amount: f64) {
        self.blame += amount;
    }

    /// Weight for longest-path search on complemented weights: blocking edges
    /// are infinitely heavy, everything else gets lighter the longer it runs.
    pub fn weight(&self) -> u64 {
        if self.blocking {
            u64::MAX
        } else {
            u64::MAX - self.duration.max(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs() -> (NodeRef, NodeRef) {
        (NodeRef::from_index(0), NodeRef::from_index(1))
    }

    #[test]
    fn forward_edge_duration_and_weight() {
        let (a, b) = refs();
        let e = Edge::new(a, b, 100, 140, true, Paradigm::CPU, EdgeKind::None, false);
        assert_eq!(e.duration(), 40);
        assert!(!e.is_blocking());
        assert_eq!(e.weight(), u64::MAX - 40);
    }

    #[test]
    fn zero_duration_weighs_as_one() {
        let (a, b) = refs();
        let e = Edge::new(a, b, 100, 100, true, Paradigm::CPU, EdgeKind::None, false);
        assert_eq!(e.duration(), 0);
        assert_eq!(e.weight(), u64::MAX - 1);
    }

    #[test]
    fn reverse_edges_are_blocking_with_zero_duration() {
        let (a, b) = refs();
        let e = Edge::new(a, b, 200, 150, false, Paradigm::MPI, EdgeKind::None, false);
        assert!(e.is_reverse());
        assert!(e.is_blocking());
        assert_eq!(e.duration(), 0);
        assert_eq!(e.weight(), u64::MAX);
    }

    #[test]
    fn blocking_dominates_weight() {
        let (a, b) = refs();
        let mut e = Edge::new(a, b, 0, 50, true, Paradigm::MPI, EdgeKind::None, false);
        e.make_blocking();
        assert_eq!(e.weight(), u64::MAX);
    }
}
