// kestrel_sim/src/scheduler.rs

//! Periodic task bookkeeping.
//!
//! Both runners drive their tasks off absolute deadlines: the next due
//! time advances by whole periods from the previous deadline, never from
//! "now", so a late cycle does not shift the grid and the long-run rate
//! stays exact. [`Cadence`] is the tick-domain version for the
//! deterministic loop, [`DeadlineTicker`] the wall-clock version for the
//! threaded runner.

use std::time::{Duration, Instant};

use kestrel_core::types::Tick;
use serde::Serialize;
use tracing::warn;

/// Tick-domain periodic trigger.
#[derive(Debug, Clone)]
pub struct Cadence {
    period: Tick,
    next_due: Tick,
}

impl Cadence {
    pub fn new(period: Tick) -> Self {
        assert!(period > 0, "cadence period must be non-zero");
        Self {
            period,
            next_due: 0,
        }
    }

    /// True when `tick` has reached the deadline. Fires once per call;
    /// a stall past several deadlines skips the missed instances and
    /// keeps the original grid.
    pub fn due(&mut self, tick: Tick) -> bool {
        if tick < self.next_due {
            return false;
        }
        self.next_due += self.period;
        while self.next_due <= tick {
            self.next_due += self.period;
        }
        true
    }
}

/// Wall-clock periodic trigger for the threaded runner.
#[derive(Debug)]
pub struct DeadlineTicker {
    period: Duration,
    next: Instant,
}

impl DeadlineTicker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    /// Sleeps until the next absolute deadline, then advances it by whole
    /// periods. Returns how many deadlines were already gone when the
    /// caller arrived.
    pub fn wait(&mut self) -> u32 {
        let now = Instant::now();
        if now < self.next {
            std::thread::sleep(self.next - now);
        }
        let mut missed = 0;
        self.next += self.period;
        while self.next <= Instant::now() {
            self.next += self.period;
            missed += 1;
        }
        missed
    }
}

// --- Task registry ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskMetadata {
    pub name: &'static str,
    /// Nominal period in ms.
    pub period: Tick,
    /// Execution budget in us; running past it counts as an overrun.
    pub budget_us: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TaskStats {
    pub runs: u64,
    pub overruns: u64,
    pub last_us: u64,
    pub max_us: u64,
    /// Exponential moving average of the execution time, in us.
    pub avg_us: f64,
}

impl TaskStats {
    fn record(&mut self, elapsed_us: u64, budget_us: u64) {
        self.runs += 1;
        self.last_us = elapsed_us;
        self.max_us = self.max_us.max(elapsed_us);
        if self.runs == 1 {
            self.avg_us = elapsed_us as f64;
        } else {
            self.avg_us += 0.1 * (elapsed_us as f64 - self.avg_us);
        }
        if elapsed_us > budget_us {
            self.overruns += 1;
        }
    }
}

/// Execution statistics for a set of periodic tasks, owned by the runner
/// that drives them.
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: Vec<(TaskMetadata, TaskStats)>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, metadata: TaskMetadata) -> usize {
        self.tasks.push((metadata, TaskStats::default()));
        self.tasks.len() - 1
    }

    pub fn record(&mut self, id: usize, elapsed: Duration) {
        if let Some((metadata, stats)) = self.tasks.get_mut(id) {
            let elapsed_us = elapsed.as_micros() as u64;
            if elapsed_us > metadata.budget_us {
                warn!(task = metadata.name, elapsed_us, "task budget overrun");
            }
            stats.record(elapsed_us, metadata.budget_us);
        }
    }

    pub fn stats(&self, id: usize) -> TaskStats {
        self.tasks.get(id).map(|(_, s)| *s).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TaskMetadata, &TaskStats)> {
        self.tasks.iter().map(|(m, s)| (m, s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cadence_fires_on_the_period_grid() {
        let mut cadence = Cadence::new(10);
        assert!(cadence.due(0));
        assert!(!cadence.due(5));
        assert!(!cadence.due(9));
        assert!(cadence.due(10));
        assert!(cadence.due(20));
    }

    #[test]
    fn test_cadence_keeps_grid_after_stall() {
        let mut cadence = Cadence::new(10);
        assert!(cadence.due(0));
        // Stalled past three deadlines: fire once, skip the backlog, and
        // stay on the original grid.
        assert!(cadence.due(34));
        assert!(!cadence.due(38));
        assert!(cadence.due(40));
    }

    #[test]
    fn test_task_stats_track_overruns_and_average() {
        let mut tasks = TaskSet::new();
        let id = tasks.register(TaskMetadata {
            name: "estimation",
            period: 10,
            budget_us: 2_000,
        });

        tasks.record(id, Duration::from_micros(1_500));
        tasks.record(id, Duration::from_micros(2_500));
        tasks.record(id, Duration::from_micros(1_500));

        let stats = tasks.stats(id);
        assert_eq!(stats.runs, 3);
        assert_eq!(stats.overruns, 1);
        assert_eq!(stats.max_us, 2_500);
        assert_eq!(stats.last_us, 1_500);
        assert!(stats.avg_us > 1_500.0 && stats.avg_us < 2_500.0);
    }

    #[test]
    fn test_deadline_ticker_reports_missed_instances() {
        let mut ticker = DeadlineTicker::new(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(23));
        // We slept through several deadlines before waiting.
        assert!(ticker.wait() >= 3);
        // Caught up; allow one more miss in case the host oversleeps.
        assert!(ticker.wait() <= 1);
    }
}
