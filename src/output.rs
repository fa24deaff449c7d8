//! Results output formatting (CSV).

use crate::analysis::HostRun;
use crate::error::Result;
use std::io::Write;

/// Write every host's solved values as CSV.
///
/// Format:
/// ```csv
/// host,cell,node,v
/// 0,1,0,0.571428
/// 1,2,0,0.714285
/// ```
pub fn write_solution_csv<W: Write>(runs: &[HostRun], writer: &mut W) -> Result<()> {
    writeln!(writer, "host,cell,node,v")?;
    for run in runs {
        for (cell, node, v) in &run.solution {
            writeln!(writer, "{},{},{},{}", run.host, cell, node, v)?;
        }
    }
    Ok(())
}

/// Write the outcome of algebraic-node reconciliation as CSV.
///
/// Format:
/// ```csv
/// host,cell,node,kind,value
/// 0,1,0,adjust,-0.25
/// 1,2,0,v,-65.0
/// ```
pub fn write_reconciliation_csv<W: Write>(runs: &[HostRun], writer: &mut W) -> Result<()> {
    writeln!(writer, "host,cell,node,kind,value")?;
    for run in runs {
        for (cell, node, v) in &run.algebraic {
            writeln!(writer, "{},{},{},v,{}", run.host, cell, node, v)?;
        }
        for (cell, node, adj) in &run.adjustments {
            writeln!(writer, "{},{},{},adjust,{}", run.host, cell, node, adj)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::ExchangeCounters;
    use std::time::Duration;

    fn run(host: usize, solution: Vec<(usize, usize, f64)>) -> HostRun {
        HostRun {
            host,
            solution,
            algebraic: vec![(7, 0, -65.0)],
            adjustments: Vec::new(),
            counters: ExchangeCounters::default(),
            triangulate: Duration::ZERO,
            exchange: Duration::ZERO,
            back_substitute: Duration::ZERO,
        }
    }

    #[test]
    fn solution_rows_follow_host_order() {
        let runs = vec![run(0, vec![(1, 0, 0.5), (1, 1, 0.25)]), run(1, vec![(2, 0, 2.0)])];
        let mut out = Vec::new();
        write_solution_csv(&runs, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "host,cell,node,v\n0,1,0,0.5\n0,1,1,0.25\n1,2,0,2\n");
    }

    #[test]
    fn reconciliation_rows_are_tagged() {
        let mut out = Vec::new();
        write_reconciliation_csv(&[run(3, Vec::new())], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("3,7,0,v,-65\n"));
    }
}
