//! Analysis driver: loads a model into per-host storage and runs solve steps.
//!
//! Every host of the model runs on its own OS thread with a `LocalComm`
//! endpoint, exactly as separate processes would with MPI.

use std::time::{Duration, Instant};

use crate::error::{MultisplitError, Result};
use crate::ir::{HostSpec, Model};
use crate::solver::comm::CommunicationBackend;
use crate::solver::comm_local::LocalComm;
use crate::solver::control::MultiSplit;
use crate::solver::plan;
use crate::solver::reference::ReferenceSolution;
use crate::solver::registry::SplitLocation;
use crate::stats::ExchangeCounters;
use crate::tree::{CellId, NodeId, ThreadTree};

/// What to run on every host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub steps: usize,
    /// Reconcile algebraic split nodes once before the first step.
    pub nocap: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { steps: 1, nocap: false }
    }
}

/// Result of one host's run.
#[derive(Debug, Clone)]
pub struct HostRun {
    pub host: usize,
    /// `(cell, node, value)` after the last step, in model order.
    pub solution: Vec<(CellId, usize, f64)>,
    /// `(cell, node, v)` of every zero-area split node after reconciliation.
    pub algebraic: Vec<(CellId, usize, f64)>,
    /// RHS adjustment of every non-zero-area split node after reconciliation.
    pub adjustments: Vec<(CellId, usize, f64)>,
    pub counters: ExchangeCounters,
    pub triangulate: Duration,
    pub exchange: Duration,
    pub back_substitute: Duration,
}

/// Allocate thread storage for `spec` and declare its splits.
pub fn build_host(spec: &HostSpec) -> Result<(Vec<ThreadTree>, MultiSplit)> {
    let mut threads: Vec<ThreadTree> = (0..spec.threads).map(ThreadTree::new).collect();
    let mut ms = MultiSplit::new();
    for piece in &spec.pieces {
        let tree = threads.get_mut(piece.thread).ok_or_else(|| {
            MultisplitError::Config(format!(
                "cell {} is placed on thread {} of {}",
                piece.cell, piece.thread, spec.threads
            ))
        })?;
        let parents: Vec<Option<usize>> = piece.nodes.iter().map(|n| n.parent).collect();
        tree.add_cell(piece.cell, &parents)?;
        for (k, node) in piece.nodes.iter().enumerate() {
            let id = NodeId::new(piece.cell, k);
            if node.parent.is_some() {
                tree.set_coupling(id, node.a, node.b)?;
            }
            tree.set_area(id, node.area)?;
            tree.set_voltage(id, node.v)?;
        }
        for split in &piece.splits {
            let location = SplitLocation::new(piece.thread, NodeId::new(piece.cell, split.node));
            ms.declare_split(location, split.sid, split.style)?;
        }
    }
    Ok((threads, ms))
}

/// Reset every row to the model's `d` and `rhs`.
pub fn load_step(threads: &mut [ThreadTree], spec: &HostSpec) -> Result<()> {
    for piece in &spec.pieces {
        let tree = &mut threads[piece.thread];
        for (k, node) in piece.nodes.iter().enumerate() {
            tree.set_row(NodeId::new(piece.cell, k), node.d, node.rhs)?;
        }
    }
    Ok(())
}

fn collect<F>(spec: &HostSpec, threads: &[ThreadTree], mut value: F) -> Result<Vec<(CellId, usize, f64)>>
where
    F: FnMut(&ThreadTree, NodeId) -> Result<f64>,
{
    let mut out = Vec::new();
    for piece in &spec.pieces {
        for k in 0..piece.nodes.len() {
            out.push((piece.cell, k, value(&threads[piece.thread], NodeId::new(piece.cell, k))?));
        }
    }
    Ok(out)
}

/// Run one host: build, rebuild, optional reconciliation, then `steps`
/// solves. Collective with every other host of the model.
pub fn run_host(spec: &HostSpec, comm: &dyn CommunicationBackend, options: &RunOptions) -> Result<HostRun> {
    let _span = tracing::info_span!("host", rank = comm.rank()).entered();
    let (mut threads, mut ms) = match build_host(spec) {
        Ok(built) => built,
        Err(e) => {
            // Peers are already heading into the rebuild collectives.
            if let Err(peer) = plan::withdraw(comm) {
                tracing::warn!(error = %peer, "could not withdraw from rebuild");
            }
            return Err(e);
        }
    };
    ms.rebuild(&mut threads, comm)?;
    tracing::debug!(plan = %ms.describe(), "rebuilt");

    let mut algebraic = Vec::new();
    let mut adjustments = Vec::new();
    if options.nocap {
        load_step(&mut threads, spec)?;
        ms.reconcile_algebraic_nodes(&mut threads, comm)?;
        ms.apply_algebraic_voltages(&mut threads)?;
        if let Some(p) = ms.plan() {
            for n in &p.algebraic {
                algebraic.push((n.id.cell, n.id.index, threads[n.thread].v[n.index]));
            }
            for (a, adj) in p.area_nodes().zip(&p.adjust) {
                adjustments.push((a.node.id.cell, a.node.id.index, *adj));
            }
        }
    }

    let (mut tri, mut exc, mut bks) = (Duration::ZERO, Duration::ZERO, Duration::ZERO);
    for step in 0..options.steps {
        tracing::debug!(step, "solve step");
        load_step(&mut threads, spec)?;
        let t0 = Instant::now();
        ms.triangulate(&mut threads)?;
        let t1 = Instant::now();
        ms.exchange(&mut threads, comm)?;
        let t2 = Instant::now();
        ms.back_substitute(&mut threads)?;
        tri += t1 - t0;
        exc += t2 - t1;
        bks += t2.elapsed();
    }

    let solution = collect(spec, &threads, |t, id| t.solution(id))?;
    Ok(HostRun {
        host: comm.rank(),
        solution,
        algebraic,
        adjustments,
        counters: ms.counters(),
        triangulate: tri,
        exchange: exc,
        back_substitute: bks,
    })
}

/// Run every host of `model` on its own thread of this process.
pub fn run_local(model: &Model, options: &RunOptions) -> Result<Vec<HostRun>> {
    let comms = LocalComm::cluster(model.num_hosts());
    let results: Vec<Result<HostRun>> = std::thread::scope(|s| {
        let handles: Vec<_> = model
            .hosts
            .iter()
            .zip(&comms)
            .map(|(spec, comm)| s.spawn(move || run_host(spec, comm, options)))
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(MultisplitError::Solve("host thread panicked".into())))
            })
            .collect()
    });
    results.into_iter().collect()
}

/// Largest absolute difference between distributed and reference values.
pub fn max_deviation(runs: &[HostRun], reference: &ReferenceSolution) -> Result<f64> {
    let mut worst: f64 = 0.0;
    for run in runs {
        for &(cell, node, v) in &run.solution {
            let r = reference.get(&(run.host, cell, node)).ok_or_else(|| {
                MultisplitError::Solve(format!("no reference value for host {} node {}[{}]", run.host, cell, node))
            })?;
            worst = worst.max((v - r).abs());
        }
    }
    Ok(worst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn build_host_rejects_conflicting_sids() {
        let model = parse(
            "host 0\ncell 0\nnode 0\nnode 1 parent=0\nsplit 1 sid=3\nsplit 1 sid=4\n",
        )
        .unwrap();
        assert!(matches!(build_host(&model.hosts[0]), Err(MultisplitError::Config(_))));
    }

    #[test]
    fn local_error_fails_every_host() {
        // Host 1 declares two sids on one node; host 0 must not hang.
        let model = parse(
            "host 0\ncell 0\nnode 0 d=2\nsplit 0 sid=3\n\
             host 1\ncell 1\nnode 0 d=2\nsplit 0 sid=3\nsplit 0 sid=4\n",
        )
        .unwrap();
        let err = run_local(&model, &RunOptions::default()).unwrap_err();
        assert!(matches!(err, MultisplitError::Structure(_)));
    }

    #[test]
    fn hosts_keep_step_counters_for_stats() {
        let model = parse(
            "host 0\ncell 0\nnode 0 d=2 rhs=1\nsplit 0 sid=3\n\
             host 1\ncell 1\nnode 0 d=2 rhs=3\nsplit 0 sid=3\n",
        )
        .unwrap();
        let runs = run_local(&model, &RunOptions { steps: 2, nocap: false }).unwrap();
        for run in &runs {
            assert!((run.solution[0].2 - 1.0).abs() < 1e-12);
        }

        let mut stats = crate::stats::Stats::new();
        for run in &runs {
            stats.add_host(run.host, run.counters);
        }
        assert_eq!(stats.hosts.len(), 2);
        for c in &stats.hosts {
            assert_eq!(c.exchanges, 2);
            assert_eq!(c.messages_sent, 2);
            assert_eq!(c.messages_received, 2);
        }
    }
}
