//! Undivided reference solve.
//!
//! Assembles the model as one matrix, with all pieces sharing a sid merged
//! into a single unknown whose row is the weighted sum of the piece rows,
//! and solves it with sparse LU. Used to check distributed results.

use std::collections::{BTreeMap, HashMap};

use faer::prelude::*;
use faer::sparse::{SparseColMat, Triplet};

use crate::error::{MultisplitError, Result};
use crate::ir::Model;
use crate::solver::registry::Sid;
use crate::tree::CellId;

/// Voltage of every node, keyed by `(host, cell, node)`.
pub type ReferenceSolution = BTreeMap<(usize, CellId, usize), f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Unknown {
    Sid(Sid),
    Node(usize, usize, usize),
}

/// Solve the merged system of `model`.
pub fn reference_solve(model: &Model) -> Result<ReferenceSolution> {
    let mut index: HashMap<Unknown, usize> = HashMap::new();
    let unknown = |h: usize, p: usize, k: usize| match model.hosts[h].pieces[p].sid_of(k) {
        Some(sid) => Unknown::Sid(sid),
        None => Unknown::Node(h, p, k),
    };
    for (h, host) in model.hosts.iter().enumerate() {
        for (p, piece) in host.pieces.iter().enumerate() {
            for k in 0..piece.nodes.len() {
                let next = index.len();
                index.entry(unknown(h, p, k)).or_insert(next);
            }
        }
    }

    let n = index.len();
    let mut entries: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    let mut rhs = vec![0.0; n];
    for (h, host) in model.hosts.iter().enumerate() {
        for (p, piece) in host.pieces.iter().enumerate() {
            for (k, node) in piece.nodes.iter().enumerate() {
                let row = index[&unknown(h, p, k)];
                let w = piece.row_weight(k);
                *entries.entry((row, row)).or_default() += w * node.d;
                rhs[row] += w * node.rhs;
                if let Some(parent) = node.parent {
                    let prow = index[&unknown(h, p, parent)];
                    let wp = piece.row_weight(parent);
                    *entries.entry((prow, row)).or_default() += wp * node.a;
                    *entries.entry((row, prow)).or_default() += w * node.b;
                }
            }
        }
    }

    let x = solve_sparse_lu(n, &entries, &rhs)?;
    let mut out = ReferenceSolution::new();
    for (h, host) in model.hosts.iter().enumerate() {
        for (p, piece) in host.pieces.iter().enumerate() {
            for k in 0..piece.nodes.len() {
                out.insert((h, piece.cell, k), x[index[&unknown(h, p, k)]]);
            }
        }
    }
    Ok(out)
}

/// Solve a real-valued linear system with sparse LU.
fn solve_sparse_lu(n: usize, entries: &BTreeMap<(usize, usize), f64>, b: &[f64]) -> Result<Vec<f64>> {
    if b.len() != n {
        return Err(MultisplitError::Solve(format!(
            "dimension mismatch: matrix is {}x{}, rhs length is {}",
            n,
            n,
            b.len()
        )));
    }
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut triplets = Vec::with_capacity(entries.len());
    for (&(row, col), &val) in entries {
        if !val.is_finite() {
            return Err(MultisplitError::Solve("reference matrix contains NaN/Inf".into()));
        }
        triplets.push(Triplet::new(row, col, val));
    }

    let a_sp = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets)
        .map_err(|e| MultisplitError::Solve(format!("sparse matrix build failed: {e:?}")))?;

    let lu = a_sp
        .sp_lu()
        .map_err(|e| MultisplitError::Solve(format!("sparse LU factorization failed: {e:?}")))?;

    let rhs = faer::Mat::<f64>::from_fn(n, 1, |i, _| b[i]);
    let x = lu.solve(rhs);

    let mut out = vec![0.0; n];
    for (i, slot) in out.iter_mut().enumerate() {
        let xi = x[(i, 0)];
        if !xi.is_finite() {
            return Err(MultisplitError::Solve("reference solve produced NaN/Inf".into()));
        }
        *slot = xi;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{HostSpec, NodeSpec, PieceSpec, SplitSpec};
    use crate::solver::registry::BackboneStyle;
    use approx::assert_abs_diff_eq;

    fn piece(cell: CellId, rows: &[(Option<usize>, f64, f64)], splits: Vec<SplitSpec>) -> PieceSpec {
        PieceSpec {
            cell,
            thread: 0,
            nodes: rows
                .iter()
                .map(|&(parent, d, rhs)| NodeSpec {
                    parent,
                    d,
                    rhs,
                    a: -1.0,
                    b: -1.0,
                    ..Default::default()
                })
                .collect(),
            splits,
        }
    }

    #[test]
    fn merged_sid_sums_rows() {
        // Pieces [x0 - s] and [s - y0] sharing sid 7: a 3-node chain.
        let split = |node| SplitSpec {
            node,
            sid: 7,
            style: BackboneStyle::Long,
        };
        let model = Model {
            hosts: vec![
                HostSpec {
                    threads: 1,
                    pieces: vec![piece(0, &[(None, 3.0, 1.0), (Some(0), 1.5, 0.0)], vec![split(1)])],
                },
                HostSpec {
                    threads: 1,
                    pieces: vec![piece(1, &[(None, 1.5, 0.0), (Some(0), 3.0, 1.0)], vec![split(0)])],
                },
            ],
        };
        let x = reference_solve(&model).unwrap();
        // [3 -1 0; -1 3 -1; 0 -1 3] x = [1 0 1] gives x = (3/7, 2/7, 3/7).
        assert_abs_diff_eq!(x[&(0, 0, 0)], 3.0 / 7.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[&(0, 0, 1)], 2.0 / 7.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[&(1, 1, 0)], 2.0 / 7.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[&(1, 1, 1)], 3.0 / 7.0, epsilon = 1e-12);
    }

    #[test]
    fn singular_system_reports_solve_error() {
        let model = Model {
            hosts: vec![HostSpec {
                threads: 1,
                pieces: vec![piece(0, &[(None, 0.0, 1.0)], Vec::new())],
            }],
        };
        let err = reference_solve(&model).unwrap_err();
        assert!(matches!(err, MultisplitError::Solve(_)));
    }
}
