//! Per-thread reorder and backbone elimination.
//!
//! After [`reorder`] a thread's nodes are laid out as
//!
//! ```text
//! [0, begin)                   roots: unsplit cells and single-sid pieces
//! [begin, long_begin)          sid0 of short backbones
//! [long_begin, interior_begin) sid0 of long and reduced-tree backbones
//! [interior_begin, sid1_begin) backbone interior nodes
//! [sid1_begin, end)            sid1 of every backbone, paired with its sid0
//! [end, len)                   everything else
//! ```
//!
//! and every node's parent has a smaller index. The sid1 of the backbone
//! whose sid0 sits at `begin + k` sits at `sid1_begin + k`.
//!
//! Triangularization first folds every subtree into its backbone or root,
//! then eliminates each backbone from both ends, leaving the N-shaped system
//! whose fill-in columns are `sid1a` (coupling to sid1) and `sid1b`
//! (coupling to sid0).

use crate::error::{MultisplitError, Result};
use crate::solver::registry::{BackboneStyle, SplitRecord};
use crate::tree::ThreadTree;

/// Backbone ranges and fill-in storage of one thread.
#[derive(Debug, Clone, PartialEq)]
pub struct BackboneLayout {
    pub thread: usize,
    pub begin: usize,
    pub long_begin: usize,
    pub interior_begin: usize,
    pub sid1_begin: usize,
    pub long_sid1_begin: usize,
    pub end: usize,
    /// Fill-in column towards sid1, indexed by `node - begin`.
    pub sid1a: Vec<f64>,
    /// Fill-in column towards sid0, indexed by `node - begin`.
    pub sid1b: Vec<f64>,
    /// For every backbone node, the index of its backbone's sid0.
    pub sid0_of: Vec<usize>,
    /// Registry index of the record behind each backbone, in sid0 order.
    pub records: Vec<usize>,
}

impl BackboneLayout {
    pub fn backbone_count(&self) -> usize {
        self.interior_begin - self.begin
    }

    pub fn short_count(&self) -> usize {
        self.long_begin - self.begin
    }

    /// Offset into `sid1a`/`sid1b` of a backbone node.
    pub fn offset(&self, index: usize) -> Option<usize> {
        (self.begin..self.end).contains(&index).then(|| index - self.begin)
    }

    /// Fold every subtree hanging below the backbones and roots into them.
    pub fn triang_subtrees(&self, tree: &mut ThreadTree) {
        for i in (self.end..tree.len()).rev() {
            let Some(ip) = tree.parent(i) else { continue };
            let p = tree.a[i] / tree.d[i];
            tree.d[ip] -= p * tree.b[i];
            tree.rhs[ip] -= p * tree.rhs[i];
        }
    }

    /// Eliminate every backbone into its N-shaped 2x2 form.
    pub fn triang_backbones(&mut self, tree: &mut ThreadTree) {
        let begin = self.begin;
        for v in self.sid1a.iter_mut().chain(self.sid1b.iter_mut()) {
            *v = 0.0;
        }
        // The row of the node next to sid1 couples directly to sid1.
        for i in self.sid1_begin..self.end {
            if let Some(ip) = tree.parent(i) {
                self.sid1a[ip - begin] = tree.a[i];
            }
        }
        // Sweep from the sid1 end towards sid0, removing the child coupling.
        for i in (self.interior_begin..self.sid1_begin).rev() {
            let Some(ip) = tree.parent(i) else { continue };
            let p = tree.a[i] / tree.d[i];
            tree.d[ip] -= p * tree.b[i];
            tree.rhs[ip] -= p * tree.rhs[i];
            self.sid1a[ip - begin] = -p * self.sid1a[i - begin];
        }
        // Sweep from the sid0 end towards sid1, removing the parent coupling.
        for i in self.interior_begin..self.sid1_begin {
            let Some(ip) = tree.parent(i) else { continue };
            let (j, jp) = (i - begin, ip - begin);
            if ip < self.interior_begin {
                self.sid1b[j] = tree.b[i];
            } else {
                let p = tree.b[i] / tree.d[ip];
                tree.rhs[i] -= p * tree.rhs[ip];
                self.sid1a[j] -= p * self.sid1a[jp];
                self.sid1b[j] = -p * self.sid1b[jp];
            }
        }
        for i in self.sid1_begin..self.end {
            let Some(ip) = tree.parent(i) else { continue };
            let (j, jp) = (i - begin, ip - begin);
            if ip < self.interior_begin {
                self.sid1b[j] = tree.b[i];
            } else {
                let p = tree.b[i] / tree.d[ip];
                tree.rhs[i] -= p * tree.rhs[ip];
                tree.d[i] -= p * self.sid1a[jp];
                self.sid1b[j] = -p * self.sid1b[jp];
            }
        }
    }

    fn solve_pair(&self, tree: &mut ThreadTree, i: usize, j: usize) {
        let a = self.sid1a[i - self.begin];
        let b = self.sid1b[j - self.begin];
        let p = b / tree.d[i];
        tree.d[j] -= p * a;
        tree.rhs[j] -= p * tree.rhs[i];
        tree.rhs[j] /= tree.d[j];
        tree.rhs[i] -= a * tree.rhs[j];
        tree.rhs[i] /= tree.d[i];
    }

    /// Solve the 2x2 system of every short backbone in place. Afterwards
    /// `rhs` of both ends holds their solution.
    pub fn solve_short_backbones(&self, tree: &mut ThreadTree) {
        for i in self.begin..self.long_begin {
            let j = self.sid1_begin + (i - self.begin);
            self.solve_pair(tree, i, j);
        }
    }

    /// Solve the long 2x2 systems, then recover every interior node.
    pub fn bksub_backbones(&self, tree: &mut ThreadTree) {
        for i in self.long_begin..self.interior_begin {
            let j = self.long_sid1_begin + (i - self.long_begin);
            self.solve_pair(tree, i, j);
        }
        let begin = self.begin;
        // Remove the sid1 contribution from every interior row.
        for i in self.sid1_begin..self.end {
            let vsid1 = tree.rhs[i];
            let mut cur = tree.parent(i);
            while let Some(j) = cur {
                if j < self.interior_begin {
                    break;
                }
                tree.rhs[j] -= self.sid1a[j - begin] * vsid1;
                cur = tree.parent(j);
            }
        }
        // Remove the sid0 contribution and divide by the pivot.
        for i in self.interior_begin..self.sid1_begin {
            let j = i - begin;
            tree.rhs[i] -= self.sid1b[j] * tree.rhs[self.sid0_of[j]];
            tree.rhs[i] /= tree.d[i];
        }
    }

    /// Ordinary back-substitution over roots and subtrees.
    pub fn bksub_subtrees(&self, tree: &mut ThreadTree) {
        for i in 0..self.begin {
            tree.rhs[i] /= tree.d[i];
        }
        for i in self.end..tree.len() {
            if let Some(ip) = tree.parent(i) {
                tree.rhs[i] -= tree.b[i] * tree.rhs[ip];
            }
            tree.rhs[i] /= tree.d[i];
        }
    }
}

/// Reroot every split piece on `tree` at its first split point and lay the
/// thread out in backbone order. `records` pairs registry indices with the
/// records on this thread. Idempotent on its own output.
pub fn reorder(tree: &mut ThreadTree, records: &[(usize, &SplitRecord)]) -> Result<BackboneLayout> {
    let thread = tree.id();
    let locate = |tree: &ThreadTree, r: &SplitRecord, node| {
        tree.index_of(node).ok_or_else(|| {
            MultisplitError::Config(format!(
                "split point {} of cell {} is not stored on thread {}",
                node, r.cell, thread
            ))
        })
    };

    for &(_, r) in records {
        let i0 = locate(tree, r, r.node0)?;
        tree.reroot(i0);
    }

    // Backbones: short ones first, then long and reduced, declaration order.
    let mut backbones: Vec<(usize, usize, usize)> = Vec::new();
    let mut short = 0;
    for want_short in [true, false] {
        for &(idx, r) in records {
            let Some(node1) = r.node1 else { continue };
            if (r.effective_style() == BackboneStyle::Short) != want_short {
                continue;
            }
            backbones.push((idx, locate(tree, r, r.node0)?, locate(tree, r, node1)?));
            if want_short {
                short += 1;
            }
        }
    }
    let n = tree.len();
    let mut is_sid0 = vec![false; n];
    for &(_, i0, _) in &backbones {
        is_sid0[i0] = true;
    }

    let mut order: Vec<usize> = Vec::with_capacity(n);
    let mut placed = vec![false; n];
    for i in 0..n {
        if tree.parent(i).is_none() && !is_sid0[i] {
            order.push(i);
            placed[i] = true;
        }
    }
    let begin = order.len();

    // Interior chains, walked from sid1 up to sid0.
    let mut chains: Vec<Vec<usize>> = Vec::with_capacity(backbones.len());
    for &(_, i0, i1) in &backbones {
        let mut chain = Vec::new();
        let mut cur = tree.parent(i1);
        loop {
            match cur {
                Some(j) if j == i0 => break,
                Some(j) => {
                    chain.push(j);
                    cur = tree.parent(j);
                }
                None => {
                    return Err(MultisplitError::Structure(format!(
                        "thread {}: sid1 node {} is not below its sid0 node {}",
                        thread,
                        tree.node_id(i1),
                        tree.node_id(i0)
                    )))
                }
            }
        }
        chains.push(chain);
    }

    let nback = backbones.len();
    let n_interior: usize = chains.iter().map(Vec::len).sum();
    let interior_begin = begin + nback;
    let sid1_begin = interior_begin + n_interior;
    let end = sid1_begin + nback;

    let mut slot = vec![usize::MAX; end - begin];
    let mut sid0_of = vec![0usize; end - begin];
    let mut ib = sid1_begin;
    for (k, (&(_, i0, i1), chain)) in backbones.iter().zip(&chains).enumerate() {
        let (s0, s1) = (begin + k, sid1_begin + k);
        slot[s0 - begin] = i0;
        slot[s1 - begin] = i1;
        sid0_of[s0 - begin] = s0;
        sid0_of[s1 - begin] = s0;
        for &j in chain {
            ib -= 1;
            slot[ib - begin] = j;
            sid0_of[ib - begin] = s0;
        }
    }
    for &old in &slot {
        if placed[old] {
            return Err(MultisplitError::Structure(format!(
                "thread {}: node {} belongs to two backbones",
                thread,
                tree.node_id(old)
            )));
        }
        placed[old] = true;
    }
    order.extend_from_slice(&slot);

    // Remaining nodes: place each unplaced chain top-down.
    let mut pending = Vec::new();
    for i in 0..n {
        let mut cur = i;
        while !placed[cur] {
            pending.push(cur);
            match tree.parent(cur) {
                Some(p) => cur = p,
                None => break,
            }
        }
        while let Some(j) = pending.pop() {
            placed[j] = true;
            order.push(j);
        }
    }

    tree.permute(&order)?;

    Ok(BackboneLayout {
        thread,
        begin,
        long_begin: begin + short,
        interior_begin,
        sid1_begin,
        long_sid1_begin: sid1_begin + short,
        end,
        sid1a: vec![0.0; end - begin],
        sid1b: vec![0.0; end - begin],
        sid0_of,
        records: backbones.iter().map(|&(idx, _, _)| idx).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::registry::{SplitLocation, SplitRegistry};
    use crate::tree::NodeId;

    /// Chain 0-1-...-(n-1) with diagonally dominant rows.
    fn cable(n: usize) -> ThreadTree {
        let parents: Vec<Option<usize>> = (0..n).map(|k| k.checked_sub(1)).collect();
        let mut t = ThreadTree::new(0);
        t.add_cell(1, &parents).unwrap();
        for k in 0..n {
            let id = NodeId::new(1, k);
            t.set_row(id, 4.0 + 0.1 * k as f64, 1.0 + k as f64).unwrap();
            if k > 0 {
                t.set_coupling(id, -1.0 - 0.01 * k as f64, -1.0 + 0.02 * k as f64).unwrap();
            }
        }
        t
    }

    fn dense(t: &ThreadTree) -> (Vec<Vec<f64>>, Vec<f64>) {
        let n = t.len();
        let mut m = vec![vec![0.0; n]; n];
        for i in 0..n {
            m[i][i] = t.d[i];
            if let Some(p) = t.parent(i) {
                m[p][i] = t.a[i];
                m[i][p] = t.b[i];
            }
        }
        (m, t.rhs.clone())
    }

    fn gauss(mut m: Vec<Vec<f64>>, mut r: Vec<f64>) -> Vec<f64> {
        let n = r.len();
        for k in 0..n {
            for i in k + 1..n {
                let f = m[i][k] / m[k][k];
                for j in k..n {
                    m[i][j] -= f * m[k][j];
                }
                r[i] -= f * r[k];
            }
        }
        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let s: f64 = (i + 1..n).map(|j| m[i][j] * x[j]).sum();
            x[i] = (r[i] - s) / m[i][i];
        }
        x
    }

    fn layout_for(t: &mut ThreadTree, reg: &SplitRegistry) -> BackboneLayout {
        let recs: Vec<(usize, &SplitRecord)> = reg.records_on(0).collect();
        reorder(t, &recs).unwrap()
    }

    fn backbone_registry(style: BackboneStyle, n0: usize, n1: usize) -> SplitRegistry {
        let mut reg = SplitRegistry::new();
        reg.declare(SplitLocation::new(0, NodeId::new(1, n0)), 1, style).unwrap();
        reg.declare(SplitLocation::new(0, NodeId::new(1, n1)), 2, style).unwrap();
        reg
    }

    #[test]
    fn reorder_places_backbone_ranges() {
        let mut t = cable(8);
        let reg = backbone_registry(BackboneStyle::Long, 2, 6);
        let l = layout_for(&mut t, &reg);
        assert_eq!(l.begin, 0);
        assert_eq!(l.interior_begin, 1);
        assert_eq!(l.sid1_begin, 4);
        assert_eq!(l.end, 5);
        assert_eq!(t.node_id(0), NodeId::new(1, 2));
        assert_eq!(t.node_id(4), NodeId::new(1, 6));
        for i in 0..t.len() {
            if let Some(p) = t.parent(i) {
                assert!(p < i, "parent {} of {} out of order", p, i);
            }
        }
    }

    #[test]
    fn reorder_is_idempotent() {
        let mut t = cable(9);
        let reg = backbone_registry(BackboneStyle::Long, 3, 7);
        let first = layout_for(&mut t, &reg);
        let ids: Vec<NodeId> = (0..t.len()).map(|i| t.node_id(i)).collect();
        let second = layout_for(&mut t, &reg);
        let again: Vec<NodeId> = (0..t.len()).map(|i| t.node_id(i)).collect();
        assert_eq!(first, second);
        assert_eq!(ids, again);
    }

    #[test]
    fn short_backbones_precede_long_ones() {
        let mut t = ThreadTree::new(0);
        let parents: Vec<Option<usize>> = (0..5).map(|k: usize| k.checked_sub(1)).collect();
        t.add_cell(1, &parents).unwrap();
        t.add_cell(2, &parents).unwrap();
        let mut reg = SplitRegistry::new();
        reg.declare(SplitLocation::new(0, NodeId::new(1, 0)), 1, BackboneStyle::Long).unwrap();
        reg.declare(SplitLocation::new(0, NodeId::new(1, 4)), 2, BackboneStyle::Long).unwrap();
        reg.declare(SplitLocation::new(0, NodeId::new(2, 1)), 3, BackboneStyle::Short).unwrap();
        reg.declare(SplitLocation::new(0, NodeId::new(2, 3)), 4, BackboneStyle::Short).unwrap();
        let l = layout_for(&mut t, &reg);
        assert_eq!(l.short_count(), 1);
        assert_eq!(t.node_id(l.begin), NodeId::new(2, 1));
        assert_eq!(t.node_id(l.long_begin), NodeId::new(1, 0));
        assert_eq!(t.node_id(l.sid1_begin), NodeId::new(2, 3));
        assert_eq!(t.node_id(l.long_sid1_begin), NodeId::new(1, 4));
        assert_eq!(l.records, vec![1, 0]);
    }

    #[test]
    fn isolated_backbone_solve_matches_dense_elimination() {
        let mut t = cable(10);
        let (m, r) = dense(&t);
        let x = gauss(m, r);
        let ids: Vec<NodeId> = (0..t.len()).map(|i| t.node_id(i)).collect();

        let reg = backbone_registry(BackboneStyle::Long, 3, 7);
        let mut l = layout_for(&mut t, &reg);
        l.triang_subtrees(&mut t);
        l.triang_backbones(&mut t);
        l.bksub_backbones(&mut t);
        l.bksub_subtrees(&mut t);

        for (k, id) in ids.iter().enumerate() {
            let got = t.solution(*id).unwrap();
            assert!((got - x[k]).abs() < 1e-12, "node {}: {} vs {}", id, got, x[k]);
        }
    }

    #[test]
    fn adjacent_split_points_have_no_interior() {
        let mut t = cable(6);
        let (m, r) = dense(&t);
        let x = gauss(m, r);
        let reg = backbone_registry(BackboneStyle::Short, 2, 3);
        let mut l = layout_for(&mut t, &reg);
        assert_eq!(l.interior_begin, l.sid1_begin);
        l.triang_subtrees(&mut t);
        l.triang_backbones(&mut t);
        l.solve_short_backbones(&mut t);
        l.bksub_backbones(&mut t);
        l.bksub_subtrees(&mut t);
        for k in 0..6 {
            let got = t.solution(NodeId::new(1, k)).unwrap();
            assert!((got - x[k]).abs() < 1e-12);
        }
    }
}
