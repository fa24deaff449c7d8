//! Performance statistics collection for `--stats` output.

use std::ops::AddAssign;
use std::time::{Duration, Instant};

/// Counters kept by one host's exchange, accumulated over every step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExchangeCounters {
    /// Time spent blocked on split-row receives.
    pub split_wait: Duration,
    /// Time spent solving ReducedTrees.
    pub rt_compute: Duration,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub exchanges: u64,
    pub reconciliations: u64,
}

impl AddAssign for ExchangeCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.split_wait += rhs.split_wait;
        self.rt_compute += rhs.rt_compute;
        self.messages_sent += rhs.messages_sent;
        self.messages_received += rhs.messages_received;
        self.exchanges += rhs.exchanges;
        self.reconciliations += rhs.reconciliations;
    }
}

/// Collects performance counters and phase timings.
///
/// Created when `--stats` is passed and filled from every host's run
/// afterwards. Step timings and exchange counters are always kept by the
/// hosts themselves; `Stats` only sums and prints them.
pub struct Stats {
    total_start: Instant,
    phases: Vec<(&'static str, Duration)>,
    // Per-step sub-phases, summed over hosts
    pub triangulate: Duration,
    pub exchange: Duration,
    pub back_substitute: Duration,
    pub steps: u32,
    /// Exchange counters per host, indexed by rank.
    pub hosts: Vec<ExchangeCounters>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            total_start: Instant::now(),
            phases: Vec::new(),
            triangulate: Duration::ZERO,
            exchange: Duration::ZERO,
            back_substitute: Duration::ZERO,
            steps: 0,
            hosts: Vec::new(),
        }
    }

    /// Record a completed phase with its duration.
    pub fn add_phase(&mut self, name: &'static str, duration: Duration) {
        self.phases.push((name, duration));
    }

    pub fn add_host(&mut self, rank: usize, counters: ExchangeCounters) {
        if self.hosts.len() <= rank {
            self.hosts.resize(rank + 1, ExchangeCounters::default());
        }
        self.hosts[rank] += counters;
    }

    /// Print the stats table to stderr.
    pub fn display(&self) {
        let total = self.total_start.elapsed();
        eprintln!();
        eprintln!("=== MultiSplit Performance Stats ===");

        for (name, dur) in &self.phases {
            eprintln!("  {:<24} {:>8.3}s", name, dur.as_secs_f64());
        }

        if self.steps > 0 {
            eprintln!("  Solve steps:            {}", self.steps);
            eprintln!("    Triangulate:          {:>8.3}s", self.triangulate.as_secs_f64());
            eprintln!("    Exchange:             {:>8.3}s", self.exchange.as_secs_f64());
            eprintln!("    Back-substitute:      {:>8.3}s", self.back_substitute.as_secs_f64());
        }

        for (rank, c) in self.hosts.iter().enumerate() {
            eprintln!(
                "  Host {:<3} sent={} recv={} wait={:.6}s rt={:.6}s exchanges={} nocap={}",
                rank,
                c.messages_sent,
                c.messages_received,
                c.split_wait.as_secs_f64(),
                c.rt_compute.as_secs_f64(),
                c.exchanges,
                c.reconciliations
            );
        }

        eprintln!("  ─────────────────────────────────");
        eprintln!("  Total:                  {:>8.3}s", total.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_counters_accumulate_by_rank() {
        let mut stats = Stats::new();
        let one = ExchangeCounters {
            messages_sent: 2,
            exchanges: 1,
            ..Default::default()
        };
        stats.add_host(2, one);
        stats.add_host(2, one);
        assert_eq!(stats.hosts.len(), 3);
        assert_eq!(stats.hosts[2].messages_sent, 4);
        assert_eq!(stats.hosts[0], ExchangeCounters::default());
    }
}
