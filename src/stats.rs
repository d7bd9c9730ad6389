//! Performance statistics collection for `--stats` output.

use std::time::{Duration, Instant};

/// Collects performance counters and phase timings.
///
/// Created when `--stats` is passed, threaded as `Option<&mut Stats>`.
/// Zero cost when `None`: no timing calls, no counter increments.
pub struct Stats {
    total_start: Instant,
    phases: Vec<(&'static str, Duration)>,
    // Continuation
    pub pseudo_steps: u32,
    pub newton_iterations: u32,
    pub solver_iters_per_newton: Vec<u32>,
    // Sub-phase accumulators (set by callers via start/stop helpers)
    pub stiffness: Duration,
    pub assembly: Duration,
    pub schur: Duration,
    pub linear_solve: Duration,
    // Elemental matrices
    pub elemental_accepted: usize,
    pub elemental_fallback: usize,
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
            pseudo_steps: 0,
            newton_iterations: 0,
            solver_iters_per_newton: Vec::new(),
            stiffness: Duration::ZERO,
            assembly: Duration::ZERO,
            schur: Duration::ZERO,
            linear_solve: Duration::ZERO,
            elemental_accepted: 0,
            elemental_fallback: 0,
        }
    }

    /// Record a completed phase with its duration.
    pub fn add_phase(&mut self, name: &'static str, duration: Duration) {
        self.phases.push((name, duration));
    }

    pub fn phases(&self) -> &[(&'static str, Duration)] {
        &self.phases
    }

    /// Print the stats table to stderr.
    pub fn display(&self) {
        let total = self.total_start.elapsed();
        eprintln!();
        eprintln!("=== Mimetic Flow Performance Stats ===");

        for (name, dur) in &self.phases {
            eprintln!("  {:<24} {:>8.3}s", name, dur.as_secs_f64());
        }

        if self.elemental_accepted + self.elemental_fallback > 0 {
            eprintln!(
                "  Elemental matrices:     accepted={}  fallback={}",
                self.elemental_accepted, self.elemental_fallback
            );
        }

        if self.newton_iterations > 0 {
            eprintln!("  Pseudo-time steps:      {}", self.pseudo_steps);
            eprintln!("  Newton iterations:      {}", self.newton_iterations);
            eprintln!("    Stiffness:            {:>8.3}s", self.stiffness.as_secs_f64());
            eprintln!("    Assembly:             {:>8.3}s", self.assembly.as_secs_f64());
            eprintln!("    Schur complement:     {:>8.3}s", self.schur.as_secs_f64());
            eprintln!("    Linear solve:         {:>8.3}s", self.linear_solve.as_secs_f64());
            if !self.solver_iters_per_newton.is_empty() {
                let avg: f64 = self.solver_iters_per_newton.iter().map(|&i| i as f64).sum::<f64>()
                    / self.solver_iters_per_newton.len() as f64;
                eprintln!("      Solver iters avg:   {:.1}", avg);
            }
        }

        eprintln!("  ─────────────────────────────────");
        eprintln!("  Total:                  {:>8.3}s", total.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_recorded_in_order() {
        let mut stats = Stats::new();
        stats.add_phase("mesh", Duration::from_millis(3));
        stats.add_phase("solve", Duration::from_millis(5));
        let names: Vec<_> = stats.phases().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["mesh", "solve"]);
        assert_eq!(stats.newton_iterations, 0);
    }
}
