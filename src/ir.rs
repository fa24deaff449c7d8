//! Model intermediate representation.
//!
//! The parser produces a `Model`: for every host, the cell pieces it stores,
//! their tree matrices, and the split declarations joining pieces across
//! threads and hosts. The analysis driver loads it into thread storage.

use crate::solver::registry::{BackboneStyle, Sid};
use crate::tree::CellId;

/// One tree node of a piece. Row `i` holds `d` on the diagonal and `b` in the
/// parent's column; the parent's row holds `a` in column `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub parent: Option<usize>,
    pub d: f64,
    pub rhs: f64,
    pub a: f64,
    pub b: f64,
    pub area: f64,
    pub v: f64,
}

impl Default for NodeSpec {
    fn default() -> Self {
        Self {
            parent: None,
            d: 1.0,
            rhs: 0.0,
            a: 0.0,
            b: 0.0,
            area: 0.0,
            v: 0.0,
        }
    }
}

/// A split declaration on node `node` of a piece.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitSpec {
    pub node: usize,
    pub sid: Sid,
    pub style: BackboneStyle,
}

/// A connected piece of a cell stored on one thread.
#[derive(Debug, Clone, PartialEq)]
pub struct PieceSpec {
    pub cell: CellId,
    pub thread: usize,
    pub nodes: Vec<NodeSpec>,
    pub splits: Vec<SplitSpec>,
}

impl PieceSpec {
    /// Row weight of node `k` when split rows are summed.
    ///
    /// Reduced-tree split nodes with membrane area carry their row scaled by
    /// `area / 100`; every other row counts once.
    pub fn row_weight(&self, k: usize) -> f64 {
        let reduced = self
            .splits
            .iter()
            .any(|s| s.node == k && s.style == BackboneStyle::ReducedTree);
        let area = self.nodes[k].area;
        if reduced && area > 0.0 {
            area / 100.0
        } else {
            1.0
        }
    }

    pub fn sid_of(&self, k: usize) -> Option<Sid> {
        self.splits.iter().find(|s| s.node == k).map(|s| s.sid)
    }
}

/// Everything stored on one host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostSpec {
    pub threads: usize,
    pub pieces: Vec<PieceSpec>,
}

impl Default for HostSpec {
    fn default() -> Self {
        Self {
            threads: 1,
            pieces: Vec::new(),
        }
    }
}

/// A whole distributed model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Model {
    pub hosts: Vec<HostSpec>,
}

impl Model {
    pub fn num_hosts(&self) -> usize {
        self.hosts.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.hosts
            .iter()
            .flat_map(|h| &h.pieces)
            .map(|p| p.nodes.len())
            .sum()
    }
}
