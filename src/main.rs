use clap::Parser;
use multisplit::analysis::{self, RunOptions};
use multisplit::output;
use multisplit::parser;
use multisplit::solver::reference;
use std::io;
use std::time::Instant;

/// Domain-decomposed tree-matrix solver
#[derive(Parser)]
#[command(name = "multisplit", version)]
struct Cli {
    /// Model description file
    model: String,

    /// Number of solve steps to run
    #[arg(long, default_value_t = 1)]
    steps: usize,

    /// Print performance stats to stderr
    #[arg(long)]
    stats: bool,

    /// Compare against an undivided reference solve
    #[arg(long)]
    check: bool,

    /// Reconcile algebraic split nodes before solving
    #[arg(long)]
    nocap: bool,
}

/// Largest deviation from the reference accepted by `--check`.
const CHECK_TOLERANCE: f64 = 1e-9;

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut stats = if cli.stats { Some(multisplit::stats::Stats::new()) } else { None };

    let input = std::fs::read_to_string(&cli.model).unwrap_or_else(|e| {
        eprintln!("Error reading {}: {}", cli.model, e);
        std::process::exit(1);
    });

    let t = Instant::now();
    let model = parser::parse(&input).unwrap_or_else(|e| {
        eprintln!("Parse error: {}", e);
        std::process::exit(1);
    });
    if let Some(s) = stats.as_mut() {
        s.add_phase("parse", t.elapsed());
    }

    let options = RunOptions {
        steps: cli.steps,
        nocap: cli.nocap,
    };
    let t = Instant::now();
    let runs = analysis::run_local(&model, &options).unwrap_or_else(|e| {
        eprintln!("Solve error: {}", e);
        std::process::exit(1);
    });
    if let Some(s) = stats.as_mut() {
        s.add_phase("run", t.elapsed());
        s.steps = cli.steps as u32;
        for run in &runs {
            s.triangulate += run.triangulate;
            s.exchange += run.exchange;
            s.back_substitute += run.back_substitute;
            s.add_host(run.host, run.counters);
        }
    }

    let mut stdout = io::stdout();
    if cli.nocap {
        output::write_reconciliation_csv(&runs, &mut stdout).unwrap_or_else(|e| {
            eprintln!("Output error: {}", e);
            std::process::exit(1);
        });
    }
    output::write_solution_csv(&runs, &mut stdout).unwrap_or_else(|e| {
        eprintln!("Output error: {}", e);
        std::process::exit(1);
    });

    if cli.check {
        let t = Instant::now();
        let reference = reference::reference_solve(&model).unwrap_or_else(|e| {
            eprintln!("Reference solve error: {}", e);
            std::process::exit(1);
        });
        let worst = analysis::max_deviation(&runs, &reference).unwrap_or_else(|e| {
            eprintln!("Check error: {}", e);
            std::process::exit(1);
        });
        if let Some(s) = stats.as_mut() {
            s.add_phase("reference", t.elapsed());
        }
        eprintln!("max deviation from reference: {:e}", worst);
        if worst > CHECK_TOLERANCE {
            eprintln!("check failed: deviation exceeds {:e}", CHECK_TOLERANCE);
            std::process::exit(2);
        }
    }

    if let Some(ref stats) = stats {
        stats.display();
    }
}
