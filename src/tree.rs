//! Per-thread node storage for tree-structured cable matrices.
//!
//! This is the storage the simulation kernel owns and fills every step.
//! Row `i` holds the diagonal `d[i]` and right-hand side `rhs[i]`. The
//! coupling between node `i` and its parent `p` is stored on the child:
//! `a[i]` sits in row `p`, column `i`, and `b[i]` sits in row `i`, column `p`.
//!
//! The split solver never allocates per-node storage. It only rewrites parent
//! links and node order during `rebuild`, and refers to nodes through
//! [`NodeId`] handles that survive reallocation.

use std::collections::HashMap;
use std::fmt;

use crate::error::{MultisplitError, Result};

/// Global identifier of a cell piece.
pub type CellId = usize;

/// Stable identity of a node: the cell piece and the node's classical index
/// inside that piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub cell: CellId,
    pub index: usize,
}

impl NodeId {
    pub fn new(cell: CellId, index: usize) -> Self {
        Self { cell, index }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.cell, self.index)
    }
}

/// Node storage of one worker thread.
#[derive(Debug, Clone)]
pub struct ThreadTree {
    id: usize,
    parent: Vec<Option<usize>>,
    node_id: Vec<NodeId>,
    lookup: HashMap<NodeId, usize>,
    cells: Vec<CellId>,
    generation: u64,
    pub a: Vec<f64>,
    pub b: Vec<f64>,
    pub d: Vec<f64>,
    pub rhs: Vec<f64>,
    pub area: Vec<f64>,
    pub v: Vec<f64>,
}

impl ThreadTree {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            parent: Vec::new(),
            node_id: Vec::new(),
            lookup: HashMap::new(),
            cells: Vec::new(),
            generation: 0,
            a: Vec::new(),
            b: Vec::new(),
            d: Vec::new(),
            rhs: Vec::new(),
            area: Vec::new(),
            v: Vec::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Incremented by every [`reallocate`](Self::reallocate).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cell pieces stored on this thread, in insertion order.
    pub fn cells(&self) -> &[CellId] {
        &self.cells
    }

    /// Append a cell piece. `parents[k]` is the classical parent of node `k`
    /// within the piece and must precede it.
    pub fn add_cell(&mut self, cell: CellId, parents: &[Option<usize>]) -> Result<()> {
        if self.cells.contains(&cell) {
            return Err(MultisplitError::Config(format!(
                "cell {} is already stored on thread {}",
                cell, self.id
            )));
        }
        if parents.is_empty() {
            return Err(MultisplitError::Config(format!("cell {} has no nodes", cell)));
        }
        let base = self.len();
        for (k, parent) in parents.iter().enumerate() {
            if let Some(p) = *parent {
                if p >= k {
                    return Err(MultisplitError::Structure(format!(
                        "node {} of cell {} has parent {} which does not precede it",
                        k, cell, p
                    )));
                }
            }
        }
        for (k, parent) in parents.iter().enumerate() {
            let id = NodeId::new(cell, k);
            self.parent.push(parent.map(|p| base + p));
            self.node_id.push(id);
            self.lookup.insert(id, base + k);
            self.a.push(0.0);
            self.b.push(0.0);
            self.d.push(0.0);
            self.rhs.push(0.0);
            self.area.push(0.0);
            self.v.push(0.0);
        }
        self.cells.push(cell);
        Ok(())
    }

    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.lookup.get(&id).copied()
    }

    pub fn node_id(&self, index: usize) -> NodeId {
        self.node_id[index]
    }

    pub fn parent(&self, index: usize) -> Option<usize> {
        self.parent[index]
    }

    fn locate(&self, id: NodeId) -> Result<usize> {
        self.index_of(id).ok_or_else(|| {
            MultisplitError::Structure(format!("node {} is not stored on thread {}", id, self.id))
        })
    }

    /// Set the coupling of `id` to its classical parent.
    pub fn set_coupling(&mut self, id: NodeId, a: f64, b: f64) -> Result<()> {
        let i = self.locate(id)?;
        self.a[i] = a;
        self.b[i] = b;
        Ok(())
    }

    pub fn set_row(&mut self, id: NodeId, d: f64, rhs: f64) -> Result<()> {
        let i = self.locate(id)?;
        self.d[i] = d;
        self.rhs[i] = rhs;
        Ok(())
    }

    pub fn set_area(&mut self, id: NodeId, area: f64) -> Result<()> {
        let i = self.locate(id)?;
        self.area[i] = area;
        Ok(())
    }

    pub fn set_voltage(&mut self, id: NodeId, v: f64) -> Result<()> {
        let i = self.locate(id)?;
        self.v[i] = v;
        Ok(())
    }

    pub fn voltage(&self, id: NodeId) -> Result<f64> {
        Ok(self.v[self.locate(id)?])
    }

    /// Value left in `rhs` by back-substitution.
    pub fn solution(&self, id: NodeId) -> Result<f64> {
        Ok(self.rhs[self.locate(id)?])
    }

    /// Move every per-node array into fresh storage, as the kernel does when
    /// it compacts memory. Handles held by a solver must be rebound before
    /// they are used again.
    pub fn reallocate(&mut self) {
        for field in [
            &mut self.a,
            &mut self.b,
            &mut self.d,
            &mut self.rhs,
            &mut self.area,
            &mut self.v,
        ] {
            let moved: Vec<f64> = field.iter().copied().collect();
            *field = moved;
        }
        self.generation += 1;
    }

    /// Make `index` the root of its tree by reversing the parent links on the
    /// path to the old root. The `a`/`b` coefficients of every reversed edge
    /// move to the new child so the matrix itself is unchanged.
    pub(crate) fn reroot(&mut self, index: usize) {
        let mut path = vec![index];
        let mut cur = index;
        while let Some(p) = self.parent[cur] {
            path.push(p);
            cur = p;
        }
        if path.len() == 1 {
            return;
        }
        let old: Vec<(f64, f64)> = path.iter().map(|&i| (self.a[i], self.b[i])).collect();
        self.parent[index] = None;
        self.a[index] = 0.0;
        self.b[index] = 0.0;
        for k in 0..path.len() - 1 {
            let (child, up) = (path[k], path[k + 1]);
            self.parent[up] = Some(child);
            self.a[up] = old[k].1;
            self.b[up] = old[k].0;
        }
    }

    /// Reorder nodes so that new position `k` holds old node `order[k]`.
    /// The result must keep every parent before its children.
    pub(crate) fn permute(&mut self, order: &[usize]) -> Result<()> {
        let n = self.len();
        if order.len() != n {
            return Err(MultisplitError::Structure(format!(
                "thread {}: node order covers {} of {} nodes",
                self.id,
                order.len(),
                n
            )));
        }
        let mut new_index = vec![usize::MAX; n];
        for (new, &old) in order.iter().enumerate() {
            if old >= n || new_index[old] != usize::MAX {
                return Err(MultisplitError::Structure(format!(
                    "thread {}: node order is not a permutation",
                    self.id
                )));
            }
            new_index[old] = new;
        }

        let parent: Vec<Option<usize>> = order
            .iter()
            .map(|&old| self.parent[old].map(|p| new_index[p]))
            .collect();
        for (i, p) in parent.iter().enumerate() {
            if let Some(p) = *p {
                if p >= i {
                    return Err(MultisplitError::Structure(format!(
                        "thread {}: node {} precedes its parent after reorder",
                        self.id, self.node_id[order[i]]
                    )));
                }
            }
        }

        let gather = |field: &[f64]| -> Vec<f64> { order.iter().map(|&old| field[old]).collect() };
        self.a = gather(&self.a);
        self.b = gather(&self.b);
        self.d = gather(&self.d);
        self.rhs = gather(&self.rhs);
        self.area = gather(&self.area);
        self.v = gather(&self.v);
        self.parent = parent;
        self.node_id = order.iter().map(|&old| self.node_id[old]).collect();
        self.lookup = self
            .node_id
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn chain(n: usize) -> ThreadTree {
        let parents: Vec<Option<usize>> = (0..n).map(|k| k.checked_sub(1)).collect();
        let mut t = ThreadTree::new(0);
        t.add_cell(7, &parents).unwrap();
        for k in 1..n {
            t.set_coupling(NodeId::new(7, k), -(k as f64), -10.0 * k as f64).unwrap();
        }
        t
    }

    fn entries(t: &ThreadTree) -> BTreeMap<(NodeId, NodeId), f64> {
        let mut m = BTreeMap::new();
        for i in 0..t.len() {
            if let Some(p) = t.parent(i) {
                m.insert((t.node_id(p), t.node_id(i)), t.a[i]);
                m.insert((t.node_id(i), t.node_id(p)), t.b[i]);
            }
        }
        m
    }

    #[test]
    fn add_cell_rejects_forward_parent() {
        let mut t = ThreadTree::new(0);
        let err = t.add_cell(1, &[None, Some(2), Some(0)]).unwrap_err();
        assert!(matches!(err, MultisplitError::Structure(_)));
    }

    #[test]
    fn add_cell_rejects_duplicate_cell() {
        let mut t = ThreadTree::new(0);
        t.add_cell(1, &[None]).unwrap();
        assert!(matches!(t.add_cell(1, &[None]), Err(MultisplitError::Config(_))));
    }

    #[test]
    fn reroot_preserves_matrix_entries() {
        let mut t = chain(5);
        let before = entries(&t);
        t.reroot(3);
        assert_eq!(t.parent(3), None);
        assert_eq!(t.parent(0), Some(1));
        assert_eq!(t.parent(4), Some(3));
        assert_eq!(entries(&t), before);
    }

    #[test]
    fn reroot_at_root_is_noop() {
        let mut t = chain(3);
        let before = entries(&t);
        t.reroot(0);
        assert_eq!(entries(&t), before);
        assert_eq!(t.parent(0), None);
    }

    #[test]
    fn permute_rejects_child_before_parent() {
        let mut t = chain(3);
        let err = t.permute(&[1, 0, 2]).unwrap_err();
        assert!(matches!(err, MultisplitError::Structure(_)));
    }

    #[test]
    fn permute_moves_node_data_and_lookup() {
        let mut parents = vec![None, Some(0)];
        let mut t = ThreadTree::new(0);
        t.add_cell(1, &parents).unwrap();
        parents.truncate(1);
        t.add_cell(2, &parents).unwrap();
        t.set_row(NodeId::new(2, 0), 4.0, 8.0).unwrap();
        t.permute(&[2, 0, 1]).unwrap();
        assert_eq!(t.index_of(NodeId::new(2, 0)), Some(0));
        assert_eq!(t.d[0], 4.0);
        assert_eq!(t.parent(2), Some(1));
    }

    #[test]
    fn reallocate_bumps_generation_and_keeps_values() {
        let mut t = chain(3);
        t.set_row(NodeId::new(7, 2), 3.0, 1.5).unwrap();
        t.reallocate();
        assert_eq!(t.generation(), 1);
        assert_eq!(t.solution(NodeId::new(7, 2)).unwrap(), 1.5);
    }
}
