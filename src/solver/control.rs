//! The per-model split solver context.

use std::fmt::Write as _;

use rayon::prelude::*;

use crate::error::{MultisplitError, Result};
use crate::solver::backbone::{self, BackboneLayout};
use crate::solver::comm::CommunicationBackend;
use crate::solver::exchange::{self, Mode};
use crate::solver::plan::{self, ExchangePlan, LocalEntry};
use crate::solver::registry::{BackboneStyle, Sid, SplitLocation, SplitRecord, SplitRegistry};
use crate::stats::ExchangeCounters;
use crate::tree::ThreadTree;

/// Split declarations, thread layouts and the exchange plan of one host.
///
/// Usage per host:
///
/// 1. `declare_split` for every split point stored here;
/// 2. `rebuild` on every host together (it runs collectives);
/// 3. per step, `triangulate`, `exchange`, `back_substitute` (or `solve`).
///
/// After the kernel reallocates node storage, call `rebind` before the next
/// step. After any topology change, call `rebuild` again.
#[derive(Debug, Default)]
pub struct MultiSplit {
    registry: SplitRegistry,
    layouts: Vec<BackboneLayout>,
    plan: Option<ExchangePlan>,
    counters: ExchangeCounters,
}

impl MultiSplit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `location` carries split identifier `sid`. Takes effect
    /// at the next `rebuild`.
    pub fn declare_split(&mut self, location: SplitLocation, sid: Sid, style: BackboneStyle) -> Result<()> {
        self.registry.declare(location, sid, style)?;
        self.plan = None;
        Ok(())
    }

    pub fn registry(&self) -> &SplitRegistry {
        &self.registry
    }

    pub fn layouts(&self) -> &[BackboneLayout] {
        &self.layouts
    }

    pub fn plan(&self) -> Option<&ExchangePlan> {
        self.plan.as_ref()
    }

    pub fn counters(&self) -> ExchangeCounters {
        self.counters
    }

    fn prepare(&self, threads: &mut [ThreadTree]) -> Result<(Vec<BackboneLayout>, Vec<LocalEntry>)> {
        for (k, tree) in threads.iter().enumerate() {
            if tree.id() != k {
                return Err(MultisplitError::Structure(format!(
                    "thread storage {} reports id {}",
                    k,
                    tree.id()
                )));
            }
        }
        if let Some(r) = self.registry.records().iter().find(|r| r.thread >= threads.len()) {
            return Err(MultisplitError::Config(format!(
                "cell {} is declared on thread {}, but this host has {} threads",
                r.cell,
                r.thread,
                threads.len()
            )));
        }
        let mut layouts = Vec::with_capacity(threads.len());
        for tree in threads.iter_mut() {
            let records: Vec<(usize, &SplitRecord)> = self.registry.records_on(tree.id()).collect();
            layouts.push(backbone::reorder(tree, &records)?);
        }
        let entries = plan::local_entries(&self.registry, &layouts, threads)?;
        Ok((layouts, entries))
    }

    /// Reorder every thread and negotiate the exchange plan with all hosts.
    ///
    /// Collective: every host must call it. A failure on any host makes
    /// every host return an error.
    pub fn rebuild(&mut self, threads: &mut [ThreadTree], comm: &dyn CommunicationBackend) -> Result<()> {
        let _span = tracing::info_span!("rebuild", host = comm.rank()).entered();
        self.plan = None;
        let local = self.prepare(threads);
        let planned = plan::exchange_setup(comm, local.as_ref().ok().map(|(_, e)| e.as_slice()), threads);
        let (layouts, _) = local?;
        let planned = planned?;
        tracing::info!(
            records = self.registry.records().len(),
            backbones = layouts.iter().map(BackboneLayout::backbone_count).sum::<usize>(),
            sends = planned.sends.len(),
            receives = planned.receives.len(),
            reduced_trees = planned.reduced_trees.len(),
            "split layout ready"
        );
        self.layouts = layouts;
        self.plan = Some(planned);
        Ok(())
    }

    /// Re-resolve every planned handle after node storage moved.
    pub fn rebind(&mut self, threads: &[ThreadTree]) -> Result<()> {
        let plan = self.plan.as_mut().ok_or_else(not_built)?;
        plan.rebind(threads)?;
        tracing::debug!(host = plan.host, "exchange plan rebound");
        Ok(())
    }

    fn ensure_current(&self, threads: &[ThreadTree]) -> Result<()> {
        let plan = self.plan.as_ref().ok_or_else(not_built)?;
        if self.layouts.len() != threads.len() {
            return Err(MultisplitError::Structure(format!(
                "layout covers {} threads, storage has {}",
                self.layouts.len(),
                threads.len()
            )));
        }
        if !plan.is_current(threads) {
            return Err(MultisplitError::Structure(
                "node storage moved since the exchange plan was built; call rebind".into(),
            ));
        }
        Ok(())
    }

    /// Eliminate every subtree and backbone, thread-parallel.
    pub fn triangulate(&mut self, threads: &mut [ThreadTree]) -> Result<()> {
        let _span = tracing::debug_span!("triangulate").entered();
        self.ensure_current(threads)?;
        threads
            .par_iter_mut()
            .zip(self.layouts.par_iter_mut())
            .for_each(|(tree, layout)| {
                layout.triang_subtrees(tree);
                layout.triang_backbones(tree);
            });
        Ok(())
    }

    /// Exchange and combine split rows with every connected host.
    pub fn exchange(&mut self, threads: &mut [ThreadTree], comm: &dyn CommunicationBackend) -> Result<()> {
        let _span = tracing::debug_span!("exchange").entered();
        self.ensure_current(threads)?;
        let plan = self.plan.as_mut().ok_or_else(not_built)?;
        exchange::exchange(plan, threads, &mut self.layouts, comm, Mode::Matrix, &mut self.counters)
    }

    /// Recover every node's value; `rhs` holds the solution afterwards.
    pub fn back_substitute(&mut self, threads: &mut [ThreadTree]) -> Result<()> {
        let _span = tracing::debug_span!("back_substitute").entered();
        self.ensure_current(threads)?;
        threads
            .par_iter_mut()
            .zip(self.layouts.par_iter())
            .for_each(|(tree, layout)| {
                layout.bksub_backbones(tree);
                layout.bksub_subtrees(tree);
            });
        Ok(())
    }

    /// One full step: triangulate, exchange, back-substitute.
    pub fn solve(&mut self, threads: &mut [ThreadTree], comm: &dyn CommunicationBackend) -> Result<()> {
        self.triangulate(threads)?;
        self.exchange(threads, comm)?;
        self.back_substitute(threads)
    }

    /// Make algebraic split-node rows consistent across pieces.
    ///
    /// Every non-zero-area reduced-tree node fixes its voltage, the rows are
    /// exchanged without elimination, and the current each such node must
    /// absorb is stored for `adjust_rhs`.
    pub fn reconcile_algebraic_nodes(
        &mut self,
        threads: &mut [ThreadTree],
        comm: &dyn CommunicationBackend,
    ) -> Result<()> {
        let _span = tracing::debug_span!("reconcile_algebraic_nodes").entered();
        self.ensure_current(threads)?;
        let plan = self.plan.as_mut().ok_or_else(not_built)?;
        exchange::nocap_fix(plan, threads);
        exchange::exchange(plan, threads, &mut self.layouts, comm, Mode::Nocap, &mut self.counters)?;
        exchange::nocap_adjust(plan, threads);
        self.counters.reconciliations += 1;
        Ok(())
    }

    /// Add the stored adjustment to the RHS of every non-zero-area node.
    pub fn adjust_rhs(&self, threads: &mut [ThreadTree]) -> Result<()> {
        self.ensure_current(threads)?;
        let plan = self.plan.as_ref().ok_or_else(not_built)?;
        for (a, adj) in plan.area_nodes().zip(&plan.adjust) {
            threads[a.node.thread].rhs[a.node.index] += adj;
        }
        Ok(())
    }

    /// Set `v = rhs / d` on every zero-area split node.
    pub fn apply_algebraic_voltages(&self, threads: &mut [ThreadTree]) -> Result<()> {
        self.ensure_current(threads)?;
        let plan = self.plan.as_ref().ok_or_else(not_built)?;
        for n in &plan.algebraic {
            let t = &mut threads[n.thread];
            let d = t.d[n.index];
            if d == 0.0 {
                return Err(MultisplitError::Solve(format!("algebraic node {} has a zero diagonal", n.id)));
            }
            t.v[n.index] = t.rhs[n.index] / d;
        }
        Ok(())
    }

    /// Forget every declaration and the plan built from them.
    pub fn clear(&mut self) {
        self.registry.clear();
        self.layouts.clear();
        self.plan = None;
    }

    /// Render declarations, layouts and the plan for diagnostics.
    pub fn describe(&self) -> String {
        let mut s = String::new();
        for r in self.registry.records() {
            let _ = write!(s, "cell {} thread {} {} sid {}", r.cell, r.thread, r.style, r.sid0);
            if let Some(sid1) = r.sid1 {
                let _ = write!(s, "-{}", sid1);
            }
            let _ = writeln!(s);
        }
        for l in &self.layouts {
            let _ = writeln!(
                s,
                "thread {}: roots [0,{}) short [{},{}) long [{},{}) interior [{},{}) sid1 [{},{})",
                l.thread,
                l.begin,
                l.begin,
                l.long_begin,
                l.long_begin,
                l.interior_begin,
                l.interior_begin,
                l.sid1_begin,
                l.sid1_begin,
                l.end
            );
        }
        match &self.plan {
            Some(p) => s.push_str(&p.describe()),
            None => s.push_str("no exchange plan\n"),
        }
        s
    }
}

fn not_built() -> MultisplitError {
    MultisplitError::Structure("exchange plan not built; call rebuild".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::comm::SingleProcessComm;
    use crate::tree::NodeId;
    use approx::assert_abs_diff_eq;

    /// Chain of `n` nodes with rows `-1 3 -1` and unit rhs.
    fn chain(thread: usize, cell: usize, n: usize) -> ThreadTree {
        let parents: Vec<Option<usize>> = (0..n).map(|k| k.checked_sub(1)).collect();
        let mut t = ThreadTree::new(thread);
        t.add_cell(cell, &parents).unwrap();
        for k in 0..n {
            let id = NodeId::new(cell, k);
            t.set_row(id, 3.0, 1.0).unwrap();
            if k > 0 {
                t.set_coupling(id, -1.0, -1.0).unwrap();
            }
        }
        t
    }

    #[test]
    fn unsplit_tree_solves_without_messages() {
        let mut ms = MultiSplit::new();
        let mut threads = vec![chain(0, 0, 3)];
        ms.rebuild(&mut threads, &SingleProcessComm).unwrap();
        ms.solve(&mut threads, &SingleProcessComm).unwrap();
        let v: Vec<f64> = (0..3)
            .map(|k| threads[0].solution(NodeId::new(0, k)).unwrap())
            .collect();
        assert_abs_diff_eq!(v[0], 4.0 / 7.0, epsilon = 1e-12);
        assert_abs_diff_eq!(v[1], 5.0 / 7.0, epsilon = 1e-12);
        assert_abs_diff_eq!(v[2], 4.0 / 7.0, epsilon = 1e-12);
        assert_eq!(ms.counters().messages_sent, 0);
    }

    #[test]
    fn steps_before_rebuild_are_structure_errors() {
        let mut ms = MultiSplit::new();
        let mut threads = vec![chain(0, 0, 2)];
        assert!(matches!(ms.triangulate(&mut threads), Err(MultisplitError::Structure(_))));
    }

    #[test]
    fn declaring_on_a_missing_thread_fails_rebuild() {
        let mut ms = MultiSplit::new();
        let mut threads = vec![chain(0, 0, 2)];
        ms.declare_split(SplitLocation::new(3, NodeId::new(0, 0)), 1, BackboneStyle::Long)
            .unwrap();
        let err = ms.rebuild(&mut threads, &SingleProcessComm).unwrap_err();
        assert!(matches!(err, MultisplitError::Config(_)));
        assert!(ms.plan().is_none());
    }

    #[test]
    fn clear_drops_plan_and_records() {
        let mut ms = MultiSplit::new();
        let mut threads = vec![chain(0, 0, 2)];
        ms.declare_split(SplitLocation::new(0, NodeId::new(0, 1)), 5, BackboneStyle::Long)
            .unwrap();
        ms.rebuild(&mut threads, &SingleProcessComm).unwrap();
        assert!(ms.describe().contains("sid 5"));
        ms.clear();
        assert!(ms.registry().is_empty());
        assert!(ms.describe().contains("no exchange plan"));
    }
}
