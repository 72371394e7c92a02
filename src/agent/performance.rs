use std::collections::HashMap;

use serde::Serialize;

/// Shortest interval self-tuning will ever assign a task.
pub const MIN_TASK_INTERVAL_SECS: u64 = 300;
/// Longest interval self-tuning will ever assign a task.
pub const MAX_TASK_INTERVAL_SECS: u64 = 86_400;

const TUNING_MIN_RUNS: u64 = 5;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceRecord {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    /// Running mean over all runs, not a windowed average.
    pub avg_duration_secs: f64,
}

impl PerformanceRecord {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.successes as f64 / self.total as f64
    }
}

/// Rolling per-task success/failure counts and average duration.
#[derive(Debug, Default)]
pub struct PerformanceTracker {
    records: HashMap<String, PerformanceRecord>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, task_id: &str, success: bool, duration_secs: f64) {
        let record = self.records.entry(task_id.to_string()).or_default();
        record.total += 1;
        if success {
            record.successes += 1;
        } else {
            record.failures += 1;
        }
        record.avg_duration_secs = (record.avg_duration_secs * (record.total - 1) as f64
            + duration_secs)
            / record.total as f64;
    }

    pub fn get(&self, task_id: &str) -> Option<&PerformanceRecord> {
        self.records.get(task_id)
    }
}

/// Advisory interval adjustment based on a task's track record.
///
/// Fast, reliable tasks can run more often; failing tasks back off. Needs at
/// least five recorded runs before suggesting anything, and never moves the
/// interval outside [300s, 86400s]. Returns None when the interval should
/// stay as it is.
pub fn tuned_interval(record: &PerformanceRecord, current_secs: u64) -> Option<u64> {
    if record.total < TUNING_MIN_RUNS {
        return None;
    }

    let success_rate = record.success_rate();
    if success_rate >= 0.7 && record.avg_duration_secs < 5.0 {
        let shrunk = (current_secs as f64 * 0.8) as u64;
        Some(shrunk.max(MIN_TASK_INTERVAL_SECS))
    } else if success_rate < 0.5 {
        let grown = (current_secs as f64 * 1.5) as u64;
        Some(grown.min(MAX_TASK_INTERVAL_SECS))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(successes: u64, failures: u64, avg: f64) -> PerformanceRecord {
        PerformanceRecord {
            total: successes + failures,
            successes,
            failures,
            avg_duration_secs: avg,
        }
    }

    #[test]
    fn running_mean_matches_formula() {
        let mut tracker = PerformanceTracker::new();
        tracker.record("t", true, 2.0);
        tracker.record("t", true, 4.0);
        tracker.record("t", false, 6.0);

        let record = tracker.get("t").unwrap();
        assert_eq!(record.total, 3);
        assert_eq!(record.successes, 2);
        assert_eq!(record.failures, 1);
        assert!((record.avg_duration_secs - 4.0).abs() < 1e-9);
    }

    #[test]
    fn shrinks_by_twenty_percent_for_fast_reliable_tasks() {
        let record = seeded(4, 1, 2.0);
        assert_eq!(tuned_interval(&record, 1800), Some(1440));
    }

    #[test]
    fn shrink_clamps_at_floor() {
        let record = seeded(5, 0, 1.0);
        assert_eq!(tuned_interval(&record, 310), Some(MIN_TASK_INTERVAL_SECS));
    }

    #[test]
    fn grows_by_half_for_failing_tasks_with_ceiling() {
        let record = seeded(1, 4, 10.0);
        assert_eq!(tuned_interval(&record, 1200), Some(1800));
        assert_eq!(tuned_interval(&record, 80_000), Some(MAX_TASK_INTERVAL_SECS));
    }

    #[test]
    fn no_action_in_the_middle_band_or_with_sparse_data() {
        // 3/5 = 0.6 success rate sits in the no-action band
        assert_eq!(tuned_interval(&seeded(3, 2, 1.0), 1800), None);
        // High success but slow: leave it alone
        assert_eq!(tuned_interval(&seeded(5, 0, 30.0), 1800), None);
        // Fewer than five runs: not enough data
        assert_eq!(tuned_interval(&seeded(4, 0, 1.0), 1800), None);
    }
}
