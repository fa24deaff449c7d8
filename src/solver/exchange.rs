//! The five-pass split exchange.
//!
//! 1. post every receive;
//! 2. send long-side contributions (to short backbones, ReducedTree hosts
//!    and long peers);
//! 3. wait for what short backbones and ReducedTrees need, then solve them;
//! 4. send their answers back;
//! 5. wait for everything else and merge into local storage.
//!
//! Messages of a pass only depend on messages of earlier passes, so no host
//! ever waits on a peer that is waiting on it.

use std::time::Instant;

use crate::error::{MultisplitError, Result};
use crate::solver::backbone::BackboneLayout;
use crate::solver::comm::{CommunicationBackend, PendingReceive};
use crate::solver::handle::{Slot, Workspace};
use crate::solver::plan::{ExchangePlan, Phase, TransferInfo};
use crate::solver::reduced_tree::{FIXED_DIAGONAL, SOLVED_SCALE};
use crate::stats::ExchangeCounters;
use crate::tree::ThreadTree;

/// What the exchanged rows mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Triangularized matrix rows; answers are "already solved" values.
    Matrix,
    /// Raw algebraic-node rows; answers replace local rows.
    Nocap,
}

fn fill_rows(t: &TransferInfo, ws: &mut Workspace<'_>) {
    for (k, &n) in t.nodes.iter().enumerate() {
        let d = ws.get(Slot::D(n));
        let rhs = ws.get(Slot::Rhs(n));
        ws.set(Slot::Send(t.displ + 2 * k), d);
        ws.set(Slot::Send(t.displ + 2 * k + 1), rhs);
    }
    let base = t.displ + 2 * t.nodes.len();
    for (q, &(sa, sb)) in t.offdiag.iter().enumerate() {
        let (va, vb) = (ws.get(sa), ws.get(sb));
        ws.set(Slot::Send(base + 2 * q), va);
        ws.set(Slot::Send(base + 2 * q + 1), vb);
    }
}

fn merge_rows(t: &TransferInfo, ws: &mut Workspace<'_>, replace: bool) {
    for (k, &n) in t.nodes.iter().enumerate() {
        let d = ws.get(Slot::Recv(t.displ + 2 * k));
        let rhs = ws.get(Slot::Recv(t.displ + 2 * k + 1));
        if replace {
            ws.set(Slot::D(n), d);
            ws.set(Slot::Rhs(n), rhs);
        } else {
            ws.add(Slot::D(n), d);
            ws.add(Slot::Rhs(n), rhs);
        }
    }
}

fn send_all(
    comm: &dyn CommunicationBackend,
    sends: &[TransferInfo],
    ws: &Workspace<'_>,
    pick: impl Fn(Phase) -> bool,
    counters: &mut ExchangeCounters,
) -> Result<()> {
    for t in sends.iter().filter(|t| pick(t.phase)) {
        tracing::trace!(peer = t.peer, phase = ?t.phase, size = t.size, "send");
        comm.send(t.peer, t.phase.tag(), &ws.send[t.range()])?;
        counters.messages_sent += 1;
    }
    Ok(())
}

fn wait_all(
    comm: &dyn CommunicationBackend,
    receives: &[TransferInfo],
    pending: &[PendingReceive],
    ws: &mut Workspace<'_>,
    pick: impl Fn(Phase) -> bool,
    counters: &mut ExchangeCounters,
) -> Result<()> {
    let start = Instant::now();
    for (t, &p) in receives.iter().zip(pending).filter(|(t, _)| pick(t.phase)) {
        comm.wait(p, &mut ws.recv[t.range()])?;
        tracing::trace!(peer = t.peer, phase = ?t.phase, size = t.size, "received");
        counters.messages_received += 1;
    }
    counters.split_wait += start.elapsed();
    Ok(())
}

/// Run one exchange over `plan`. In [`Mode::Matrix`] the threads must be
/// triangularized; afterwards every split node holds its final row.
pub fn exchange(
    plan: &mut ExchangePlan,
    threads: &mut [ThreadTree],
    layouts: &mut [BackboneLayout],
    comm: &dyn CommunicationBackend,
    mode: Mode,
    counters: &mut ExchangeCounters,
) -> Result<()> {
    if !plan.is_current(threads) {
        return Err(MultisplitError::Structure(
            "node storage moved since the exchange plan was built; call rebind".into(),
        ));
    }
    let ExchangePlan {
        sends,
        receives,
        send_buf,
        recv_buf,
        reduced_trees,
        area_buf,
        area_rt,
        ..
    } = plan;
    let mut ws = Workspace {
        threads,
        layouts,
        recv: recv_buf,
        send: send_buf,
    };

    // Pass 1.
    let pending: Vec<PendingReceive> = receives
        .iter()
        .map(|t| comm.post_receive(t.peer, t.phase.tag(), t.size))
        .collect();

    // Pass 2.
    for t in sends.iter().filter(|t| t.phase.is_contribution()) {
        fill_rows(t, &mut ws);
    }
    if mode == Mode::Matrix {
        for a in area_buf.iter() {
            for &s in &a.scaled {
                ws.scale(s, 0.01 * a.area);
            }
        }
    }
    send_all(comm, sends, &ws, Phase::is_contribution, counters)?;

    // Pass 3.
    wait_all(comm, receives, &pending, &mut ws, Phase::feeds_solvers, counters)?;
    for t in receives.iter().filter(|t| t.phase == Phase::LongToShort) {
        merge_rows(t, &mut ws, false);
    }
    let start = Instant::now();
    if mode == Mode::Matrix {
        for layout in ws.layouts.iter() {
            layout.solve_short_backbones(&mut ws.threads[layout.thread]);
        }
        for a in area_rt.iter() {
            for &s in &a.scaled {
                ws.scale(s, 0.01 * a.area);
            }
        }
        for rt in reduced_trees.iter_mut() {
            rt.solve(&mut ws);
        }
    } else {
        for rt in reduced_trees.iter() {
            rt.nocap(&mut ws);
        }
    }
    counters.rt_compute += start.elapsed();

    // Pass 4. FromReducedTree buffers were filled by the ReducedTree scatter.
    for t in sends.iter().filter(|t| t.phase == Phase::ShortToLong) {
        for (k, &n) in t.nodes.iter().enumerate() {
            let (d, rhs) = match mode {
                Mode::Matrix => (SOLVED_SCALE, SOLVED_SCALE * ws.get(Slot::Rhs(n))),
                Mode::Nocap => (ws.get(Slot::D(n)), ws.get(Slot::Rhs(n))),
            };
            ws.set(Slot::Send(t.displ + 2 * k), d);
            ws.set(Slot::Send(t.displ + 2 * k + 1), rhs);
        }
    }
    send_all(comm, sends, &ws, |p| !p.is_contribution(), counters)?;

    // Pass 5.
    wait_all(comm, receives, &pending, &mut ws, |p| !p.feeds_solvers(), counters)?;
    for t in receives.iter().filter(|t| !t.phase.feeds_solvers()) {
        let replace = mode == Mode::Nocap && t.phase != Phase::LongToLong;
        merge_rows(t, &mut ws, replace);
    }
    counters.exchanges += 1;
    Ok(())
}

/// Encode every non-zero-area split node as a fixed voltage.
pub fn nocap_fix(plan: &ExchangePlan, threads: &mut [ThreadTree]) {
    for a in plan.area_nodes() {
        let t = &mut threads[a.node.thread];
        t.d[a.node.index] = FIXED_DIAGONAL;
        t.rhs[a.node.index] = FIXED_DIAGONAL * t.v[a.node.index];
    }
}

/// Store the current each non-zero-area node must absorb, per unit area.
pub fn nocap_adjust(plan: &mut ExchangePlan, threads: &[ThreadTree]) {
    let ExchangePlan {
        area_buf,
        area_rt,
        adjust,
        ..
    } = plan;
    for (slot, a) in adjust.iter_mut().zip(area_buf.iter().chain(area_rt.iter())) {
        let t = &threads[a.node.thread];
        let i = a.node.index;
        *slot = (t.rhs[i] - t.d[i] * t.v[i]) * 100.0 / a.area;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::comm::SingleProcessComm;
    use crate::solver::handle::NodeRef;
    use crate::solver::plan::AreaNode;
    use crate::tree::NodeId;

    fn one_thread(values: &[(f64, f64)]) -> Vec<ThreadTree> {
        let mut t = ThreadTree::new(0);
        t.add_cell(0, &vec![None; values.len()]).unwrap();
        for (k, &(d, rhs)) in values.iter().enumerate() {
            t.set_row(NodeId::new(0, k), d, rhs).unwrap();
        }
        vec![t]
    }

    fn node(k: usize) -> NodeRef {
        NodeRef {
            thread: 0,
            id: NodeId::new(0, k),
            index: k,
        }
    }

    fn empty_plan(threads: &[ThreadTree]) -> ExchangePlan {
        ExchangePlan {
            host: 0,
            sends: Vec::new(),
            receives: Vec::new(),
            send_buf: Vec::new(),
            recv_buf: Vec::new(),
            reduced_trees: Vec::new(),
            area_buf: Vec::new(),
            area_rt: Vec::new(),
            adjust: Vec::new(),
            algebraic: Vec::new(),
            generations: threads.iter().map(ThreadTree::generation).collect(),
        }
    }

    #[test]
    fn stale_plan_is_rejected() {
        let mut threads = one_thread(&[(1.0, 1.0)]);
        let mut plan = empty_plan(&threads);
        threads[0].reallocate();
        let mut counters = ExchangeCounters::default();
        let err = exchange(&mut plan, &mut threads, &mut [], &SingleProcessComm, Mode::Matrix, &mut counters)
            .unwrap_err();
        assert!(matches!(err, MultisplitError::Structure(_)));
        plan.rebind(&threads).unwrap();
        exchange(&mut plan, &mut threads, &mut [], &SingleProcessComm, Mode::Matrix, &mut counters).unwrap();
        assert_eq!(counters.exchanges, 1);
    }

    #[test]
    fn rows_are_packed_as_d_then_rhs() {
        let mut threads = one_thread(&[(2.0, 3.0), (5.0, 7.0)]);
        let t = TransferInfo {
            peer: 1,
            phase: Phase::LongToLong,
            nodes: vec![node(1), node(0)],
            offdiag: Vec::new(),
            displ: 1,
            size: 4,
        };
        let mut send = vec![0.0; 5];
        let mut ws = Workspace {
            threads: &mut threads,
            layouts: &mut [],
            recv: &mut [],
            send: &mut send,
        };
        fill_rows(&t, &mut ws);
        assert_eq!(send, vec![0.0, 5.0, 7.0, 2.0, 3.0]);
    }

    #[test]
    fn nocap_adjust_is_the_missing_current_per_area() {
        let mut threads = one_thread(&[(0.0, 0.0)]);
        threads[0].v[0] = 2.0;
        let mut plan = empty_plan(&threads);
        plan.area_rt.push(AreaNode {
            node: node(0),
            area: 50.0,
            scaled: Vec::new(),
        });
        plan.adjust = vec![0.0];
        nocap_fix(&plan, &mut threads);
        assert_eq!(threads[0].d[0], FIXED_DIAGONAL);
        // Neighbours supply sum(d) = 3, sum(rhs) = 9.
        threads[0].d[0] = 3.0;
        threads[0].rhs[0] = 9.0;
        nocap_adjust(&mut plan, &threads);
        assert_eq!(plan.adjust, vec![(9.0 - 3.0 * 2.0) * 100.0 / 50.0]);
    }
}
