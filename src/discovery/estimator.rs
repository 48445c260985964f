//! Duration estimation from history and static complexity.

use serde::Serialize;
use tracing::debug;

use crate::config::EstimatorConfig;
use crate::history::HistorySnapshot;

/// Complexity can inflate a historical baseline by at most this factor
/// on top of the baseline itself (so at most 3x overall).
const MAX_HISTORY_INFLATION: f64 = 2.0;

/// Where an estimate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateSource {
    /// Scaled from the unit's historical average duration.
    History,
    /// No usable history; derived from test count and complexity.
    ColdStart,
}

/// A predicted duration in seconds and its provenance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Estimate {
    pub duration: f64,
    pub source: EstimateSource,
}

/// Predicts per-unit execution time. Pure and deterministic.
#[derive(Debug, Clone)]
pub struct DurationEstimator {
    base_time_per_test: f64,
    min_duration: f64,
}

impl DurationEstimator {
    pub fn new(config: &EstimatorConfig) -> Self {
        Self {
            base_time_per_test: config.base_time_per_test_secs,
            min_duration: config.min_duration_secs,
        }
    }

    /// The floor every estimate is clamped to.
    pub fn min_duration(&self) -> f64 {
        self.min_duration
    }

    /// Estimates the duration of one test unit.
    ///
    /// With history: `avg * (1 + min(complexity / 100, 2))`.
    /// Cold start: `tests * base_time * (1 + complexity / 200)`.
    /// Both are clamped to the configured floor.
    ///
    /// # Example
    ///
    /// ```
    /// use shardsmith::config::EstimatorConfig;
    /// use shardsmith::discovery::{DurationEstimator, EstimateSource};
    /// use shardsmith::history::HistorySnapshot;
    ///
    /// let estimator = DurationEstimator::new(&EstimatorConfig::default());
    /// let estimate = estimator.estimate("a.test.js", 4, 0.0, &HistorySnapshot::default());
    /// assert_eq!(estimate.duration, 2.0);
    /// assert_eq!(estimate.source, EstimateSource::ColdStart);
    /// ```
    pub fn estimate(
        &self,
        path: &str,
        test_count: usize,
        complexity_score: f64,
        history: &HistorySnapshot,
    ) -> Estimate {
        let complexity = complexity_score.max(0.0);

        let (raw, source) = match history.avg_duration(path) {
            Some(avg) => {
                let inflation = 1.0 + (complexity / 100.0).min(MAX_HISTORY_INFLATION);
                (avg * inflation, EstimateSource::History)
            }
            None => {
                debug!("No history for {}, using cold-start estimate", path);
                let raw = test_count as f64 * self.base_time_per_test * (1.0 + complexity / 200.0);
                (raw, EstimateSource::ColdStart)
            }
        };

        let duration = if raw.is_finite() {
            raw.max(self.min_duration)
        } else {
            self.min_duration
        };

        Estimate { duration, source }
    }
}
