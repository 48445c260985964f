//! Post-run accounting.
//!
//! After every shard has finished, the [`AccuracyTracker`] compares
//! predicted and actual shard durations, scores the run's balance and feeds
//! per-unit observations back into the [`HistorySnapshot`]. It is the only
//! writer of history and runs exactly once per run.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::executor::{ShardResult, ShardStatus};
use super::partitioner::ShardAssignment;
use crate::discovery::TestUnit;
use crate::history::{HistorySnapshot, ShardRunSummary};

/// Predicted vs. actual duration of one shard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardAccuracy {
    pub shard_id: usize,
    pub estimated_duration: f64,
    pub actual_duration: f64,

    /// `|actual - estimated| / estimated`; `None` when the shard did not
    /// finish or the ratio is undefined.
    pub accuracy: Option<f64>,
}

/// Run-level figures derived from the shard results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetrics {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub shard_count: usize,

    /// Longest actual shard duration.
    pub makespan: f64,

    /// Mean of the defined per-shard accuracies.
    pub avg_accuracy: Option<f64>,

    /// Passed shards over executed shards.
    pub success_rate: f64,

    /// `1 - stdev / mean` of executed shard durations, floored at 0.
    pub load_balance: f64,

    /// Coefficient of variation of executed shard durations.
    pub duration_cv: f64,

    pub shards: Vec<ShardAccuracy>,

    /// History entries written for units.
    pub units_recorded: usize,
}

/// Relative estimation error of one shard.
///
/// Zero when the values match. When the estimate sits at or below `floor`
/// and the actual is also at or below it, the error is taken as zero; an
/// estimate of zero against a real duration is undefined.
///
/// ```
/// use shardsmith::orchestrator::tracker::accuracy;
///
/// assert_eq!(accuracy(10.0, 10.0, 0.01), Some(0.0));
/// assert_eq!(accuracy(10.0, 15.0, 0.01), Some(0.5));
/// assert_eq!(accuracy(0.0, 3.0, 0.01), None);
/// ```
pub fn accuracy(estimated: f64, actual: f64, floor: f64) -> Option<f64> {
    if estimated <= floor && actual <= floor {
        return Some(0.0);
    }
    if estimated <= 0.0 {
        return None;
    }
    Some((actual - estimated).abs() / estimated)
}

/// Population coefficient of variation. Zero for fewer than two values or a
/// non-positive mean.
pub fn coefficient_of_variation(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() / mean
}

/// `1 - CV`, floored at zero. A single shard scores 1.0.
pub fn load_balance_score(durations: &[f64]) -> f64 {
    (1.0 - coefficient_of_variation(durations)).max(0.0)
}

/// Compares estimates with outcomes and updates history.
#[derive(Debug, Clone)]
pub struct AccuracyTracker {
    min_duration: f64,
}

impl AccuracyTracker {
    /// `min_duration` is the estimator floor used to recognise trivial shards.
    pub fn new(min_duration: f64) -> Self {
        Self { min_duration }
    }

    /// Scores the run and appends its observations to `history`.
    ///
    /// Units of passed shards get a success entry; units of failed or
    /// crashed shards get a failure entry. Units of timed-out or aborted
    /// shards get nothing. Each entry carries the runner's measured unit
    /// duration when one was reported, otherwise the unit's estimate.
    ///
    /// Must be called once per run, after every shard finished. Calling it
    /// twice double-counts.
    pub fn update(
        &self,
        history: &mut HistorySnapshot,
        units: &[TestUnit],
        shards: &[ShardAssignment],
        results: &BTreeMap<usize, ShardResult>,
        timestamp: DateTime<Utc>,
    ) -> RunMetrics {
        let estimates: HashMap<&str, f64> = units
            .iter()
            .map(|u| (u.path.as_str(), u.estimated_duration))
            .collect();

        let mut shard_accuracy = Vec::with_capacity(shards.len());
        let mut executed_durations = Vec::new();
        let mut executed = 0usize;
        let mut passed = 0usize;
        let mut units_recorded = 0usize;

        for shard in shards {
            let Some(result) = results.get(&shard.id) else {
                continue;
            };
            if !result.status.was_executed() {
                continue;
            }

            executed += 1;
            if result.status.is_passed() {
                passed += 1;
            }
            executed_durations.push(result.duration);

            let finished = matches!(result.status, ShardStatus::Passed | ShardStatus::Failed);
            let shard_error = if finished {
                accuracy(shard.estimated_duration, result.duration, self.min_duration)
            } else {
                None
            };
            debug!(
                "Shard {}: estimated {:.2}s, actual {:.2}s ({})",
                shard.id, shard.estimated_duration, result.duration, result.status
            );
            shard_accuracy.push(ShardAccuracy {
                shard_id: shard.id,
                estimated_duration: shard.estimated_duration,
                actual_duration: result.duration,
                accuracy: shard_error,
            });

            if !result.status.has_unit_outcome() {
                continue;
            }
            let success = result.status.is_passed();
            for path in &shard.units {
                let measured = result
                    .unit_durations
                    .as_ref()
                    .and_then(|m| m.get(path))
                    .copied()
                    .filter(|d| d.is_finite() && *d >= 0.0);
                let Some(duration) = measured.or_else(|| estimates.get(path.as_str()).copied())
                else {
                    continue;
                };
                history.record_unit(path, duration, success, timestamp);
                units_recorded += 1;
            }
        }

        let defined: Vec<f64> = shard_accuracy.iter().filter_map(|s| s.accuracy).collect();
        let avg_accuracy =
            (!defined.is_empty()).then(|| defined.iter().sum::<f64>() / defined.len() as f64);
        let success_rate = if executed == 0 {
            1.0
        } else {
            passed as f64 / executed as f64
        };
        let makespan = executed_durations.iter().copied().fold(0.0, f64::max);
        let duration_cv = coefficient_of_variation(&executed_durations);

        let metrics = RunMetrics {
            run_id: Uuid::new_v4(),
            timestamp,
            shard_count: shards.len(),
            makespan,
            avg_accuracy,
            success_rate,
            load_balance: (1.0 - duration_cv).max(0.0),
            duration_cv,
            shards: shard_accuracy,
            units_recorded,
        };

        history.record_run(ShardRunSummary {
            run_id: metrics.run_id,
            timestamp,
            shard_count: metrics.shard_count,
            total_duration: metrics.makespan,
            avg_accuracy: metrics.avg_accuracy,
            success_rate: metrics.success_rate,
        });
        history.bump_version();

        info!(
            "Run {}: makespan {:.2}s, load balance {:.2}, {} unit observations recorded",
            metrics.run_id, metrics.makespan, metrics.load_balance, metrics.units_recorded
        );

        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn result(shard_id: usize, status: ShardStatus, duration: f64) -> ShardResult {
        ShardResult {
            shard_id,
            status,
            duration,
            exit_code: None,
            stdout_ref: None,
            stderr_ref: None,
            unit_durations: None,
            error: None,
        }
    }

    fn shard(id: usize, units: &[(&str, f64)]) -> ShardAssignment {
        ShardAssignment {
            id,
            units: units.iter().map(|(p, _)| p.to_string()).collect(),
            estimated_duration: units.iter().map(|(_, d)| d).sum(),
        }
    }

    fn units(items: &[(&str, f64)]) -> Vec<TestUnit> {
        items.iter().map(|(p, d)| TestUnit::new(*p, *d)).collect()
    }

    fn results(items: Vec<ShardResult>) -> BTreeMap<usize, ShardResult> {
        items.into_iter().map(|r| (r.shard_id, r)).collect()
    }

    #[test]
    fn test_accuracy_identity() {
        assert_eq!(accuracy(12.5, 12.5, 0.01), Some(0.0));
        assert_eq!(accuracy(0.01, 0.0, 0.01), Some(0.0));
        assert_eq!(accuracy(4.0, 2.0, 0.01), Some(0.5));
    }

    #[test]
    fn test_load_balance() {
        assert_eq!(load_balance_score(&[5.0]), 1.0);
        assert_eq!(load_balance_score(&[]), 1.0);
        assert_eq!(load_balance_score(&[7.0, 7.0, 7.0]), 1.0);
        // mean 10, stdev 5
        assert!((load_balance_score(&[5.0, 15.0]) - 0.5).abs() < 1e-9);
        assert_eq!(load_balance_score(&[0.0, 0.0]), 1.0);
    }

    #[test]
    fn test_matching_durations_score_perfectly() {
        let units = units(&[("a", 4.0), ("b", 4.0)]);
        let shards = vec![shard(1, &[("a", 4.0)]), shard(2, &[("b", 4.0)])];
        let results = results(vec![
            result(1, ShardStatus::Passed, 4.0),
            result(2, ShardStatus::Passed, 4.0),
        ]);

        let mut history = HistorySnapshot::default();
        let metrics =
            AccuracyTracker::new(0.01).update(&mut history, &units, &shards, &results, ts());

        assert_eq!(metrics.avg_accuracy, Some(0.0));
        assert_eq!(metrics.load_balance, 1.0);
        assert_eq!(metrics.success_rate, 1.0);
        assert_eq!(metrics.makespan, 4.0);
        assert!(metrics.shards.iter().all(|s| s.accuracy == Some(0.0)));
    }

    #[test]
    fn test_history_updated_per_outcome() {
        let units = units(&[("pass", 2.0), ("fail", 3.0), ("slow", 5.0), ("gone", 1.0)]);
        let shards = vec![
            shard(1, &[("pass", 2.0)]),
            shard(2, &[("fail", 3.0)]),
            shard(3, &[("slow", 5.0)]),
            shard(4, &[("gone", 1.0)]),
        ];
        let results = results(vec![
            result(1, ShardStatus::Passed, 2.5),
            result(2, ShardStatus::Failed, 3.0),
            result(3, ShardStatus::TimedOut, 30.0),
            result(4, ShardStatus::Aborted, 0.5),
        ]);

        let mut history = HistorySnapshot::default();
        let metrics =
            AccuracyTracker::new(0.01).update(&mut history, &units, &shards, &results, ts());

        assert_eq!(metrics.units_recorded, 2);
        assert_eq!(history.avg_duration("pass"), Some(2.0));
        assert_eq!(history.failure_rate("pass"), 0.0);
        assert_eq!(history.failure_rate("fail"), 1.0);
        assert!(history.get("slow").is_none());
        assert!(history.get("gone").is_none());
        assert_eq!(metrics.success_rate, 0.25);
    }

    #[test]
    fn test_measured_unit_durations_preferred() {
        let units = units(&[("a", 2.0), ("b", 2.0)]);
        let shards = vec![shard(1, &[("a", 2.0), ("b", 2.0)])];
        let mut passed = result(1, ShardStatus::Passed, 6.0);
        passed.unit_durations = Some(BTreeMap::from([("a".to_string(), 5.0)]));

        let mut history = HistorySnapshot::default();
        AccuracyTracker::new(0.01).update(
            &mut history,
            &units,
            &shards,
            &results(vec![passed]),
            ts(),
        );

        assert_eq!(history.avg_duration("a"), Some(5.0));
        assert_eq!(history.avg_duration("b"), Some(2.0));
    }

    #[test]
    fn test_unfinished_shards_have_no_accuracy() {
        let units = units(&[("a", 10.0), ("b", 10.0)]);
        let shards = vec![shard(1, &[("a", 10.0)]), shard(2, &[("b", 10.0)])];
        let results = results(vec![
            result(1, ShardStatus::Passed, 15.0),
            result(2, ShardStatus::TimedOut, 60.0),
        ]);

        let mut history = HistorySnapshot::default();
        let metrics =
            AccuracyTracker::new(0.01).update(&mut history, &units, &shards, &results, ts());

        assert_eq!(metrics.shards[0].accuracy, Some(0.5));
        assert_eq!(metrics.shards[1].accuracy, None);
        assert_eq!(metrics.avg_accuracy, Some(0.5));
        assert_eq!(metrics.makespan, 60.0);
    }

    #[test]
    fn test_skipped_shards_excluded() {
        let units = units(&[("a", 3.0)]);
        let shards = vec![shard(1, &[("a", 3.0)]), shard(2, &[])];
        let results = results(vec![
            result(1, ShardStatus::Passed, 3.0),
            result(2, ShardStatus::Skipped, 0.0),
        ]);

        let mut history = HistorySnapshot::default();
        let metrics =
            AccuracyTracker::new(0.01).update(&mut history, &units, &shards, &results, ts());

        assert_eq!(metrics.shards.len(), 1);
        assert_eq!(metrics.load_balance, 1.0);
        assert_eq!(metrics.success_rate, 1.0);
        assert_eq!(metrics.shard_count, 2);
    }

    #[test]
    fn test_run_summary_appended_and_version_bumped() {
        let units = units(&[("a", 3.0)]);
        let shards = vec![shard(1, &[("a", 3.0)])];
        let results = results(vec![result(1, ShardStatus::Passed, 3.0)]);

        let mut history = HistorySnapshot::default();
        let before = history.version;
        let metrics =
            AccuracyTracker::new(0.01).update(&mut history, &units, &shards, &results, ts());

        assert_eq!(history.version, before + 1);
        assert_eq!(history.runs().len(), 1);
        let summary = &history.runs()[0];
        assert_eq!(summary.run_id, metrics.run_id);
        assert_eq!(summary.total_duration, 3.0);
        assert_eq!(summary.timestamp, ts());
    }
}
