//! Split-point registry.
//!
//! Records, per cell piece, the one or two nodes where the cell was cut and
//! the identifier (sid) that ties each of them to the matching node of the
//! neighbouring pieces on other hosts or threads.

use std::collections::HashMap;
use std::fmt;

use crate::error::{MultisplitError, Result};
use crate::tree::{CellId, NodeId};

/// User-assigned split identifier.
pub type Sid = u32;

/// How a piece with two split points is solved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackboneStyle {
    /// The 2x2 backbone system is solved after the exchange by the owner.
    Long,
    /// The 2x2 backbone system is solved during the exchange and the answer
    /// is sent to every long-side peer.
    Short,
    /// All split points of the whole cell form a ReducedTree solved on one
    /// elected host.
    ReducedTree,
}

impl BackboneStyle {
    fn merge(self, other: BackboneStyle) -> Option<BackboneStyle> {
        use BackboneStyle::*;
        match (self, other) {
            (ReducedTree, ReducedTree) => Some(ReducedTree),
            (ReducedTree, _) | (_, ReducedTree) => None,
            (Short, _) | (_, Short) => Some(Short),
            (Long, Long) => Some(Long),
        }
    }
}

impl fmt::Display for BackboneStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackboneStyle::Long => write!(f, "long"),
            BackboneStyle::Short => write!(f, "short"),
            BackboneStyle::ReducedTree => write!(f, "reduced"),
        }
    }
}

/// Where a split point lives: a node on one of this host's threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitLocation {
    pub thread: usize,
    pub node: NodeId,
}

impl SplitLocation {
    pub fn new(thread: usize, node: NodeId) -> Self {
        Self { thread, node }
    }
}

/// Relation of one split point to the rest of its cell, as exchanged between
/// hosts during planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbRelation {
    /// Single split point, or either end of a long backbone.
    Long,
    /// Either end of a short backbone.
    Short,
    /// Piece of a reduced-tree cell. `other` is the far end when the piece is
    /// a backbone.
    ReducedTree { other: Option<Sid> },
}

impl BbRelation {
    pub fn is_reduced(&self) -> bool {
        matches!(self, BbRelation::ReducedTree { .. })
    }
}

/// All split points of one cell piece.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitRecord {
    pub thread: usize,
    pub cell: CellId,
    pub node0: NodeId,
    pub sid0: Sid,
    pub node1: Option<NodeId>,
    pub sid1: Option<Sid>,
    pub style: BackboneStyle,
}

impl SplitRecord {
    pub fn is_backbone(&self) -> bool {
        self.node1.is_some()
    }

    /// A short declaration on a single split point behaves as long.
    pub fn effective_style(&self) -> BackboneStyle {
        match self.style {
            BackboneStyle::Short if !self.is_backbone() => BackboneStyle::Long,
            style => style,
        }
    }

    /// `(sid, relation, node)` for each split point, sid0 first.
    pub fn entries(&self) -> Vec<(Sid, BbRelation, NodeId)> {
        let relation = |other: Option<Sid>| match self.effective_style() {
            BackboneStyle::Long => BbRelation::Long,
            BackboneStyle::Short => BbRelation::Short,
            BackboneStyle::ReducedTree => BbRelation::ReducedTree { other },
        };
        let mut out = vec![(self.sid0, relation(self.sid1), self.node0)];
        if let (Some(node1), Some(sid1)) = (self.node1, self.sid1) {
            out.push((sid1, relation(Some(self.sid0)), node1));
        }
        out
    }
}

/// Registry of every split declared on this host.
#[derive(Debug, Clone, Default)]
pub struct SplitRegistry {
    records: Vec<SplitRecord>,
    by_cell: HashMap<(usize, CellId), usize>,
}

impl SplitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[SplitRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records stored on `thread`, in declaration order.
    pub fn records_on(&self, thread: usize) -> impl Iterator<Item = (usize, &SplitRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter(move |(_, r)| r.thread == thread)
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.by_cell.clear();
    }

    /// Declare that `location` carries split identifier `sid`.
    ///
    /// Repeating a declaration is a no-op. The first sid of a cell becomes
    /// its root after reorder; a second sid turns the piece into a backbone.
    pub fn declare(&mut self, location: SplitLocation, sid: Sid, style: BackboneStyle) -> Result<()> {
        let node = location.node;
        let key = (location.thread, node.cell);
        let Some(&idx) = self.by_cell.get(&key) else {
            self.by_cell.insert(key, self.records.len());
            self.records.push(SplitRecord {
                thread: location.thread,
                cell: node.cell,
                node0: node,
                sid0: sid,
                node1: None,
                sid1: None,
                style,
            });
            return Ok(());
        };

        let record = &mut self.records[idx];
        let merged = record.style.merge(style).ok_or_else(|| {
            MultisplitError::Config(format!(
                "cell {}: style {} conflicts with previously declared {}",
                node.cell, style, record.style
            ))
        })?;

        let existing = [(record.node0, record.sid0)]
            .into_iter()
            .chain(record.node1.zip(record.sid1));
        for (n, s) in existing {
            match (n == node, s == sid) {
                (true, true) => {
                    record.style = merged;
                    return Ok(());
                }
                (true, false) => {
                    return Err(MultisplitError::Config(format!(
                        "node {} already carries sid {}, cannot also carry sid {}",
                        node, s, sid
                    )))
                }
                (false, true) => {
                    return Err(MultisplitError::Config(format!(
                        "sid {} is declared on both node {} and node {} of cell {}",
                        sid, n, node, node.cell
                    )))
                }
                (false, false) => {}
            }
        }

        if record.node1.is_some() {
            return Err(MultisplitError::Config(format!(
                "cell {} already has two split points, cannot add sid {}",
                node.cell, sid
            )));
        }
        record.node1 = Some(node);
        record.sid1 = Some(sid);
        record.style = merged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(cell: CellId, index: usize) -> SplitLocation {
        SplitLocation::new(0, NodeId::new(cell, index))
    }

    #[test]
    fn second_sid_makes_a_backbone() {
        let mut reg = SplitRegistry::new();
        reg.declare(loc(1, 0), 10, BackboneStyle::Long).unwrap();
        reg.declare(loc(1, 5), 11, BackboneStyle::Long).unwrap();
        let r = &reg.records()[0];
        assert!(r.is_backbone());
        assert_eq!(r.sid1, Some(11));
        assert_eq!(r.node1, Some(NodeId::new(1, 5)));
    }

    #[test]
    fn repeated_declaration_is_idempotent() {
        let mut reg = SplitRegistry::new();
        reg.declare(loc(1, 3), 10, BackboneStyle::Long).unwrap();
        reg.declare(loc(1, 3), 10, BackboneStyle::Long).unwrap();
        assert_eq!(reg.records().len(), 1);
        assert!(!reg.records()[0].is_backbone());
    }

    #[test]
    fn conflicting_sid_on_same_node_is_rejected() {
        let mut reg = SplitRegistry::new();
        reg.declare(loc(1, 3), 10, BackboneStyle::Long).unwrap();
        let err = reg.declare(loc(1, 3), 12, BackboneStyle::Long).unwrap_err();
        assert!(matches!(err, MultisplitError::Config(_)));
    }

    #[test]
    fn same_sid_on_two_nodes_is_rejected() {
        let mut reg = SplitRegistry::new();
        reg.declare(loc(1, 3), 10, BackboneStyle::Long).unwrap();
        assert!(reg.declare(loc(1, 4), 10, BackboneStyle::Long).is_err());
    }

    #[test]
    fn third_split_point_is_rejected() {
        let mut reg = SplitRegistry::new();
        reg.declare(loc(1, 0), 1, BackboneStyle::Long).unwrap();
        reg.declare(loc(1, 4), 2, BackboneStyle::Long).unwrap();
        assert!(reg.declare(loc(1, 6), 3, BackboneStyle::Long).is_err());
    }

    #[test]
    fn reduced_and_plain_styles_do_not_mix() {
        let mut reg = SplitRegistry::new();
        reg.declare(loc(1, 0), 1, BackboneStyle::ReducedTree).unwrap();
        let err = reg.declare(loc(1, 4), 2, BackboneStyle::Long).unwrap_err();
        assert!(format!("{err}").contains("conflicts"));
    }

    #[test]
    fn short_wins_over_long_and_single_short_is_long() {
        let mut reg = SplitRegistry::new();
        reg.declare(loc(1, 0), 1, BackboneStyle::Short).unwrap();
        assert_eq!(reg.records()[0].effective_style(), BackboneStyle::Long);
        reg.declare(loc(1, 2), 2, BackboneStyle::Long).unwrap();
        assert_eq!(reg.records()[0].effective_style(), BackboneStyle::Short);
        let rel: Vec<BbRelation> = reg.records()[0].entries().iter().map(|e| e.1).collect();
        assert_eq!(rel, vec![BbRelation::Short, BbRelation::Short]);
    }

    #[test]
    fn reduced_backbone_entries_name_the_far_end() {
        let mut reg = SplitRegistry::new();
        reg.declare(loc(4, 1), 7, BackboneStyle::ReducedTree).unwrap();
        reg.declare(loc(4, 3), 9, BackboneStyle::ReducedTree).unwrap();
        let e = reg.records()[0].entries();
        assert_eq!(e[0].1, BbRelation::ReducedTree { other: Some(9) });
        assert_eq!(e[1].1, BbRelation::ReducedTree { other: Some(7) });
    }
}
