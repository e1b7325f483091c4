//! Per-task execution statistics.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Call counter and timing accumulator of one task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    /// Number of executions
    pub n_calls: u64,
    /// Number of timed executions
    pub n_timed: u64,
    /// Sum of timed durations
    pub total: Duration,
    /// Shortest timed execution
    pub min: Option<Duration>,
    /// Longest timed execution
    pub max: Option<Duration>,
}

impl TaskStats {
    /// Count an untimed call
    pub fn count(&mut self) {
        self.n_calls += 1;
    }

    /// Count a timed call
    pub fn record(&mut self, elapsed: Duration) {
        self.n_calls += 1;
        self.n_timed += 1;
        self.total += elapsed;
        self.min = Some(self.min.map_or(elapsed, |m| m.min(elapsed)));
        self.max = Some(self.max.map_or(elapsed, |m| m.max(elapsed)));
    }

    /// Average timed duration, zero when nothing was timed
    #[must_use]
    pub fn average(&self) -> Duration {
        if self.n_timed == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total.as_nanos() / u128::from(self.n_timed);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Clear all counters
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Snapshot of a task's statistics, as exposed to profilers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    /// Task name
    pub name: String,
    /// Whether the task can be replicated across threads
    pub replicable: bool,
    /// Number of executions
    pub n_calls: u64,
    /// Average timed duration
    pub average: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_average() {
        let mut stats = TaskStats::default();
        assert_eq!(stats.average(), Duration::ZERO);

        stats.record(Duration::from_micros(10));
        stats.record(Duration::from_micros(30));
        stats.count();

        assert_eq!(stats.n_calls, 3);
        assert_eq!(stats.n_timed, 2);
        assert_eq!(stats.average(), Duration::from_micros(20));
        assert_eq!(stats.min, Some(Duration::from_micros(10)));
        assert_eq!(stats.max, Some(Duration::from_micros(30)));

        stats.reset();
        assert_eq!(stats, TaskStats::default());
    }
}
