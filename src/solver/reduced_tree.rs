//! ReducedTree: the small tree system formed by every split point of one
//! cell, solved exactly on the host elected for that cell.
//!
//! Rows are sids. Each piece of the cell contributes its eliminated split
//! rows (`rmap`) and, for backbones, the two fill-in couplings between its
//! ends (`offdiag`). After the solve every contributing location listed in
//! `smap` receives `1e30 * v` with a `1e30` diagonal, so that adding the
//! receiver's own row leaves `v` as the solution.

use std::collections::{HashMap, VecDeque};

use crate::error::{MultisplitError, Result};
use crate::solver::handle::{Slot, Workspace};
use crate::solver::registry::Sid;
use crate::tree::ThreadTree;

/// Scale of the "already solved" answer.
pub const SOLVED_SCALE: f64 = 1e30;

/// Diagonal marking a node whose voltage is fixed during reconciliation.
pub const FIXED_DIAGONAL: f64 = 1e50;

/// Where an off-diagonal contribution lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Row `ip[i]`, column `i`.
    A(usize),
    /// Row `i`, column `ip[i]`.
    B(usize),
}

/// One piece's contribution to a row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RmapEntry {
    pub row: usize,
    pub rhs: Slot,
    pub d: Slot,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffdiagEntry {
    pub slot: Slot,
    pub target: Target,
}

/// Where the answer for one piece is written. `smap[k]` answers `rmap[k]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmapEntry {
    pub row: usize,
    pub rhs: Slot,
    pub d: Slot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReducedTree {
    sids: Vec<Sid>,
    row_of: HashMap<Sid, usize>,
    pub ip: Vec<Option<usize>>,
    pub rhs: Vec<f64>,
    pub d: Vec<f64>,
    pub a: Vec<f64>,
    pub b: Vec<f64>,
    pub rmap: Vec<RmapEntry>,
    pub offdiag: Vec<OffdiagEntry>,
    pub smap: Vec<SmapEntry>,
}

impl ReducedTree {
    /// Order the sids of one cell as a tree. `sids` lists them in discovery
    /// order (duplicates ignored); `edges` holds one pair per backbone. Row 0
    /// is the first sid and every row's parent precedes it.
    pub fn new(sids: &[Sid], edges: &[(Sid, Sid)]) -> Result<Self> {
        let mut discovered: Vec<Sid> = Vec::new();
        let mut rank_of: HashMap<Sid, usize> = HashMap::new();
        for &s in sids {
            if !rank_of.contains_key(&s) {
                rank_of.insert(s, discovered.len());
                discovered.push(s);
            }
        }
        let n = discovered.len();
        if n == 0 {
            return Err(MultisplitError::Structure("reduced tree without sids".into()));
        }
        if edges.len() != n - 1 {
            return Err(MultisplitError::Structure(format!(
                "reduced tree over sids {:?} has {} backbones, a tree needs {}",
                discovered,
                edges.len(),
                n - 1
            )));
        }
        let mut adjacent: Vec<Vec<usize>> = vec![Vec::new(); n];
        for &(s, t) in edges {
            let (Some(&i), Some(&j)) = (rank_of.get(&s), rank_of.get(&t)) else {
                return Err(MultisplitError::Structure(format!(
                    "backbone {}-{} leaves the reduced tree over {:?}",
                    s, t, discovered
                )));
            };
            adjacent[i].push(j);
            adjacent[j].push(i);
        }

        let mut order = Vec::with_capacity(n);
        let mut parent_old: Vec<Option<usize>> = vec![None; n];
        let mut seen = vec![false; n];
        let mut queue = VecDeque::from([0usize]);
        seen[0] = true;
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &j in &adjacent[i] {
                if !seen[j] {
                    seen[j] = true;
                    parent_old[j] = Some(i);
                    queue.push_back(j);
                }
            }
        }
        if order.len() != n {
            return Err(MultisplitError::Structure(format!(
                "sids {:?} do not form one connected cell",
                discovered
            )));
        }

        let mut new_of = vec![0usize; n];
        for (new, &old) in order.iter().enumerate() {
            new_of[old] = new;
        }
        let ordered: Vec<Sid> = order.iter().map(|&old| discovered[old]).collect();
        let ip = order
            .iter()
            .map(|&old| parent_old[old].map(|p| new_of[p]))
            .collect();
        Ok(Self {
            row_of: ordered.iter().enumerate().map(|(r, &s)| (s, r)).collect(),
            sids: ordered,
            ip,
            rhs: vec![0.0; n],
            d: vec![0.0; n],
            a: vec![0.0; n],
            b: vec![0.0; n],
            rmap: Vec::new(),
            offdiag: Vec::new(),
            smap: Vec::new(),
        })
    }

    pub fn rank(&self) -> usize {
        self.sids.len()
    }

    /// Sids in row order.
    pub fn sids(&self) -> &[Sid] {
        &self.sids
    }

    pub fn row_of(&self, sid: Sid) -> Result<usize> {
        self.row_of.get(&sid).copied().ok_or_else(|| {
            MultisplitError::Structure(format!("sid {} is not part of reduced tree {:?}", sid, self.sids))
        })
    }

    /// Entry holding row `row_sid`, column `col_sid`.
    pub fn offdiag_target(&self, row_sid: Sid, col_sid: Sid) -> Result<Target> {
        let i = self.row_of(col_sid)?;
        let j = self.row_of(row_sid)?;
        if self.ip[i] == Some(j) {
            Ok(Target::A(i))
        } else if self.ip[j] == Some(i) {
            Ok(Target::B(j))
        } else {
            Err(MultisplitError::Structure(format!(
                "sids {} and {} are not adjacent in reduced tree {:?}",
                row_sid, col_sid, self.sids
            )))
        }
    }

    /// Register one piece's split row for `sid` and where its answer goes.
    pub fn add_piece(&mut self, sid: Sid, input: (Slot, Slot), answer: (Slot, Slot)) -> Result<()> {
        let row = self.row_of(sid)?;
        self.rmap.push(RmapEntry {
            row,
            rhs: input.0,
            d: input.1,
        });
        self.smap.push(SmapEntry {
            row,
            rhs: answer.0,
            d: answer.1,
        });
        Ok(())
    }

    pub fn add_offdiag(&mut self, row_sid: Sid, col_sid: Sid, slot: Slot) -> Result<()> {
        let target = self.offdiag_target(row_sid, col_sid)?;
        self.offdiag.push(OffdiagEntry { slot, target });
        Ok(())
    }

    pub fn rebind(&mut self, threads: &[ThreadTree]) -> Result<()> {
        for e in &mut self.rmap {
            e.rhs.rebind(threads)?;
            e.d.rebind(threads)?;
        }
        for e in &mut self.smap {
            e.rhs.rebind(threads)?;
            e.d.rebind(threads)?;
        }
        for e in &mut self.offdiag {
            e.slot.rebind(threads)?;
        }
        Ok(())
    }

    fn gather(&mut self, ws: &Workspace<'_>) {
        for v in [&mut self.rhs, &mut self.d, &mut self.a, &mut self.b] {
            v.iter_mut().for_each(|x| *x = 0.0);
        }
        for e in &self.rmap {
            self.rhs[e.row] += ws.get(e.rhs);
            self.d[e.row] += ws.get(e.d);
        }
        for e in &self.offdiag {
            match e.target {
                Target::A(i) => self.a[i] += ws.get(e.slot),
                Target::B(i) => self.b[i] += ws.get(e.slot),
            }
        }
    }

    /// Tree elimination towards row 0 followed by back-substitution. `rhs`
    /// holds the solution afterwards.
    pub fn eliminate(&mut self) {
        for i in (1..self.rank()).rev() {
            let Some(ip) = self.ip[i] else { continue };
            let p = self.a[i] / self.d[i];
            self.d[ip] -= p * self.b[i];
            self.rhs[ip] -= p * self.rhs[i];
        }
        for i in 0..self.rank() {
            if let Some(ip) = self.ip[i] {
                self.rhs[i] -= self.b[i] * self.rhs[ip];
            }
            self.rhs[i] /= self.d[i];
        }
    }

    /// Gather, solve, and scatter the "already solved" answer.
    pub fn solve(&mut self, ws: &mut Workspace<'_>) {
        self.gather(ws);
        self.eliminate();
        for e in &self.smap {
            ws.set(e.rhs, SOLVED_SCALE * self.rhs[e.row]);
            ws.set(e.d, SOLVED_SCALE);
        }
    }

    /// Reconcile algebraic voltages without elimination.
    ///
    /// A piece whose diagonal is [`FIXED_DIAGONAL`] fixes its row's voltage.
    /// Every other piece sums into the row. The fixing piece receives the sum
    /// of the others; the others receive `(v, 1)`. Rows with no fixing piece
    /// give every piece the sums.
    pub fn nocap(&self, ws: &mut Workspace<'_>) {
        let n = self.rank();
        let mut rhs = vec![0.0; n];
        let mut d = vec![0.0; n];
        let mut fixed: Vec<Option<(f64, usize)>> = vec![None; n];
        for (k, e) in self.rmap.iter().enumerate() {
            let (r, dd) = (ws.get(e.rhs), ws.get(e.d));
            if dd == FIXED_DIAGONAL {
                fixed[e.row] = Some((r / FIXED_DIAGONAL, k));
            } else {
                rhs[e.row] += r;
                d[e.row] += dd;
            }
        }
        for (k, e) in self.smap.iter().enumerate() {
            match fixed[e.row] {
                Some((v, owner)) if owner != k => {
                    ws.set(e.rhs, v);
                    ws.set(e.d, 1.0);
                }
                _ => {
                    ws.set(e.rhs, rhs[e.row]);
                    ws.set(e.d, d[e.row]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::backbone::BackboneLayout;

    fn workspace<'a>(recv: &'a mut [f64], send: &'a mut [f64]) -> Workspace<'a> {
        Workspace {
            threads: &mut [],
            layouts: &mut [] as &mut [BackboneLayout],
            recv,
            send,
        }
    }

    #[test]
    fn orders_sids_parent_first() {
        let rt = ReducedTree::new(&[7, 3, 9, 3], &[(3, 9), (7, 3)]).unwrap();
        assert_eq!(rt.sids(), &[7, 3, 9]);
        assert_eq!(rt.ip, vec![None, Some(0), Some(1)]);
    }

    #[test]
    fn cycle_is_a_structure_error() {
        let err = ReducedTree::new(&[1, 2, 3], &[(1, 2), (2, 3), (3, 1)]).unwrap_err();
        assert!(matches!(err, MultisplitError::Structure(_)));
    }

    #[test]
    fn disconnected_sids_are_a_structure_error() {
        let err = ReducedTree::new(&[1, 2, 3, 4], &[(1, 2), (3, 4), (3, 4)]).unwrap_err();
        assert!(format!("{err}").contains("connected"));
    }

    #[test]
    fn offdiag_targets_follow_parent_links() {
        let rt = ReducedTree::new(&[1, 2], &[(1, 2)]).unwrap();
        assert_eq!(rt.offdiag_target(1, 2).unwrap(), Target::A(1));
        assert_eq!(rt.offdiag_target(2, 1).unwrap(), Target::B(1));
    }

    #[test]
    fn three_sid_chain_solves_exactly() {
        // Rows: [4 -1 0; -2 5 -1; 0 -1 3] x = [1 2 3]
        let mut rt = ReducedTree::new(&[10, 20, 30], &[(10, 20), (20, 30)]).unwrap();
        // Split every row over two pieces to check the summing.
        let mut recv = vec![
            1.0, 2.0, 0.0, 2.0, // sid 10: (rhs, d) twice
            1.5, 3.0, 0.5, 2.0, // sid 20
            3.0, 3.0, // sid 30
            -1.0, -2.0, // 10-20 coupling: row 10 col 20, row 20 col 10
            -1.0, -1.0, // 20-30 coupling
        ];
        let mut send = vec![0.0; 6];
        for (k, (sid, at)) in [(10, 0), (10, 2), (20, 4), (20, 6), (30, 8)].iter().enumerate() {
            let answer = if k < 3 {
                (Slot::Send(2 * k + 1), Slot::Send(2 * k))
            } else {
                (Slot::Recv(14), Slot::Recv(15))
            };
            rt.add_piece(*sid, (Slot::Recv(*at), Slot::Recv(at + 1)), answer).unwrap();
        }
        rt.add_offdiag(10, 20, Slot::Recv(10)).unwrap();
        rt.add_offdiag(20, 10, Slot::Recv(11)).unwrap();
        rt.add_offdiag(20, 30, Slot::Recv(12)).unwrap();
        rt.add_offdiag(30, 20, Slot::Recv(13)).unwrap();
        recv.extend([0.0, 0.0]);

        let mut ws = workspace(&mut recv, &mut send);
        rt.solve(&mut ws);

        // Exact solution of the 3x3 system.
        let (x0, x1, x2) = (23.0 / 50.0, 42.0 / 50.0, 64.0 / 50.0);
        assert!((rt.rhs[0] - x0).abs() < 1e-14);
        assert!((rt.rhs[1] - x1).abs() < 1e-14);
        assert!((rt.rhs[2] - x2).abs() < 1e-14);
        assert_eq!(send[0], SOLVED_SCALE);
        assert!((send[1] / SOLVED_SCALE - x0).abs() < 1e-14);
        assert!((send[5] / SOLVED_SCALE - x1).abs() < 1e-14);
    }

    #[test]
    fn nocap_fixes_voltage_from_nonzero_area_piece() {
        let mut rt = ReducedTree::new(&[5], &[]).unwrap();
        // Piece 0 is fixed at v = -65, pieces 1 and 2 are connectors.
        let mut recv = vec![-65.0 * FIXED_DIAGONAL, FIXED_DIAGONAL, 2.0, 0.5, 3.0, 0.25];
        let mut send = vec![0.0; 6];
        for k in 0..3 {
            rt.add_piece(
                5,
                (Slot::Recv(2 * k), Slot::Recv(2 * k + 1)),
                (Slot::Send(2 * k), Slot::Send(2 * k + 1)),
            )
            .unwrap();
        }
        let mut ws = workspace(&mut recv, &mut send);
        rt.nocap(&mut ws);
        assert_eq!(&send[..2], &[5.0, 0.75]);
        for k in [1, 2] {
            assert!((send[2 * k] + 65.0).abs() < 1e-12);
            assert_eq!(send[2 * k + 1], 1.0);
        }
    }
}
