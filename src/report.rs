//! Optimization reports.
//!
//! The [`ReportGenerator`] turns a finished run into an
//! [`OptimizationReport`]: an execution summary, a per-shard breakdown,
//! recommendations from fixed heuristics and a makespan trend over recent
//! runs. The report is plain serializable data; [`write_json`] and
//! [`print_summary`] are the two ways it leaves the process.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::ReportConfig;
use crate::discovery::SkippedFile;
use crate::history::HistorySnapshot;
use crate::orchestrator::executor::{ShardResult, ShardStatus};
use crate::orchestrator::partitioner::ShardAssignment;
use crate::orchestrator::tracker::RunMetrics;
use crate::orchestrator::Plan;

/// Direction of recent makespans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Degrading,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendAnalysis {
    pub trend: Trend,

    /// Least-squares makespan slope per run, relative to the mean makespan.
    pub relative_slope: Option<f64>,

    pub runs_considered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    /// Shard durations vary too much.
    Rebalance,
    /// Estimates are not yet trustworthy.
    GatherHistory,
    /// Some shard did not pass.
    IsolateFailures,
    /// The run is too slow overall.
    ScaleOut,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub run_id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub shard_count: usize,
    pub unit_count: usize,

    /// Run makespan in seconds.
    pub total_duration: f64,

    pub estimated_makespan: f64,

    /// `1 - mean relative error`, floored at 0.
    pub estimation_accuracy: Option<f64>,

    /// Mean relative error of finished shards.
    pub mean_estimation_error: Option<f64>,

    pub success_rate: f64,
    pub load_balance: f64,

    /// Units estimated without history.
    pub cold_start_units: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardBreakdown {
    pub shard_id: usize,
    pub status: ShardStatus,
    pub units: Vec<String>,
    pub estimated_duration: f64,
    pub actual_duration: f64,
    pub accuracy: Option<f64>,
    pub exit_code: Option<i32>,
    pub stdout_ref: Option<String>,
    pub stderr_ref: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything known about one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationReport {
    pub summary: ExecutionSummary,
    pub shards: Vec<ShardBreakdown>,
    pub recommendations: Vec<Recommendation>,
    pub trend: TrendAnalysis,

    /// Files discovery could not use.
    pub skipped_files: Vec<SkippedFile>,

    /// History paths no longer discovered.
    pub stale_history: Vec<String>,

    /// How many stale paths were removed from history.
    pub pruned_history: usize,

    /// Non-fatal problems, e.g. history that could not be saved.
    pub warnings: Vec<String>,
}

impl OptimizationReport {
    /// True when no shard failed, timed out, crashed or was aborted.
    pub fn success(&self) -> bool {
        self.shards
            .iter()
            .all(|s| matches!(s.status, ShardStatus::Passed | ShardStatus::Skipped))
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Builds reports from run results and configured thresholds.
#[derive(Debug, Clone)]
pub struct ReportGenerator {
    config: ReportConfig,
}

impl ReportGenerator {
    pub fn new(config: ReportConfig) -> Self {
        Self { config }
    }

    /// Builds the report for a finished run.
    ///
    /// `history` should already contain this run's summary so the trend
    /// includes it.
    pub fn generate(
        &self,
        shards: &[ShardAssignment],
        results: &BTreeMap<usize, ShardResult>,
        metrics: &RunMetrics,
        history: &HistorySnapshot,
    ) -> OptimizationReport {
        let accuracy_by_shard: BTreeMap<usize, Option<f64>> = metrics
            .shards
            .iter()
            .map(|s| (s.shard_id, s.accuracy))
            .collect();

        let breakdown: Vec<ShardBreakdown> = shards
            .iter()
            .map(|shard| {
                let result = results.get(&shard.id);
                ShardBreakdown {
                    shard_id: shard.id,
                    status: result.map_or(ShardStatus::Skipped, |r| r.status),
                    units: shard.units.clone(),
                    estimated_duration: shard.estimated_duration,
                    actual_duration: result.map_or(0.0, |r| r.duration),
                    accuracy: accuracy_by_shard.get(&shard.id).copied().flatten(),
                    exit_code: result.and_then(|r| r.exit_code),
                    stdout_ref: result.and_then(|r| r.stdout_ref.clone()),
                    stderr_ref: result.and_then(|r| r.stderr_ref.clone()),
                    error: result.and_then(|r| r.error.clone()),
                }
            })
            .collect();

        let summary = ExecutionSummary {
            run_id: metrics.run_id,
            timestamp: metrics.timestamp,
            shard_count: metrics.shard_count,
            unit_count: shards.iter().map(|s| s.units.len()).sum(),
            total_duration: metrics.makespan,
            estimated_makespan: shards
                .iter()
                .map(|s| s.estimated_duration)
                .fold(0.0, f64::max),
            estimation_accuracy: metrics.avg_accuracy.map(|e| (1.0 - e).max(0.0)),
            mean_estimation_error: metrics.avg_accuracy,
            success_rate: metrics.success_rate,
            load_balance: metrics.load_balance,
            cold_start_units: 0,
        };

        let recommendations = self.recommend(&summary, &breakdown, metrics.duration_cv);
        let trend = self.trend(history);

        OptimizationReport {
            summary,
            shards: breakdown,
            recommendations,
            trend,
            skipped_files: Vec::new(),
            stale_history: Vec::new(),
            pruned_history: 0,
            warnings: Vec::new(),
        }
    }

    fn recommend(
        &self,
        summary: &ExecutionSummary,
        shards: &[ShardBreakdown],
        duration_cv: f64,
    ) -> Vec<Recommendation> {
        let mut recommendations = Vec::new();

        if duration_cv > self.config.rebalance_variance_threshold {
            recommendations.push(Recommendation {
                kind: RecommendationKind::Rebalance,
                message: format!(
                    "Shard durations vary by {:.0}% (threshold {:.0}%); rebalance shards or split the slowest units.",
                    duration_cv * 100.0,
                    self.config.rebalance_variance_threshold * 100.0
                ),
            });
        }

        if let Some(score) = summary.estimation_accuracy
            && score < self.config.accuracy_threshold
        {
            recommendations.push(Recommendation {
                kind: RecommendationKind::GatherHistory,
                message: format!(
                    "Estimation accuracy is {:.0}% (threshold {:.0}%); collect more historical runs before relying on estimates.",
                    score * 100.0,
                    self.config.accuracy_threshold * 100.0
                ),
            });
        }

        let failed: Vec<String> = shards
            .iter()
            .filter(|s| !matches!(s.status, ShardStatus::Passed | ShardStatus::Skipped))
            .map(|s| format!("{} ({})", s.shard_id, s.status))
            .collect();
        if !failed.is_empty() {
            recommendations.push(Recommendation {
                kind: RecommendationKind::IsolateFailures,
                message: format!(
                    "Shards {} did not pass; isolate flaky tests or raise the per-shard timeout.",
                    failed.join(", ")
                ),
            });
        }

        if summary.total_duration > self.config.makespan_ceiling_secs {
            recommendations.push(Recommendation {
                kind: RecommendationKind::ScaleOut,
                message: format!(
                    "Makespan {:.1}s exceeds {:.1}s; increase the shard count or optimize the slowest units.",
                    summary.total_duration, self.config.makespan_ceiling_secs
                ),
            });
        }

        recommendations
    }

    /// Classifies the last `trend_window` makespans.
    pub fn trend(&self, history: &HistorySnapshot) -> TrendAnalysis {
        let makespans: Vec<f64> = history
            .recent_runs(self.config.trend_window)
            .iter()
            .map(|r| r.total_duration)
            .collect();

        let relative_slope = relative_slope(&makespans);
        let trend = match relative_slope {
            Some(s) if s < -self.config.trend_threshold => Trend::Improving,
            Some(s) if s > self.config.trend_threshold => Trend::Degrading,
            _ => Trend::Stable,
        };

        TrendAnalysis {
            trend,
            relative_slope,
            runs_considered: makespans.len(),
        }
    }
}

/// Least-squares slope of `values` against their index, divided by their
/// mean. `None` for fewer than two values or a non-positive mean.
fn relative_slope(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;
    if mean_y <= 0.0 {
        return None;
    }

    let (num, den) = values
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, y)| {
            let dx = i as f64 - mean_x;
            (num + dx * (y - mean_y), den + dx * dx)
        });
    Some(num / den / mean_y)
}

/// Writes the report as pretty-printed JSON, creating parent directories.
pub fn write_json(report: &OptimizationReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write report: {}", path.display()))?;
    Ok(())
}

fn style_status(status: ShardStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        ShardStatus::Passed => console::style(text).green(),
        ShardStatus::Skipped => console::style(text).dim(),
        ShardStatus::Failed | ShardStatus::Crashed => console::style(text).red(),
        ShardStatus::TimedOut | ShardStatus::Aborted => console::style(text).yellow(),
    }
}

fn percent(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.1}%", v * 100.0))
}

/// Prints a summary of the report to the console.
pub fn print_summary(report: &OptimizationReport) {
    let summary = &report.summary;

    println!();
    println!("Run {}:", summary.run_id);
    println!("  Units:          {}", summary.unit_count);
    println!("  Shards:         {}", summary.shard_count);
    println!(
        "  Makespan:       {:.2}s (estimated {:.2}s)",
        summary.total_duration, summary.estimated_makespan
    );
    println!("  Accuracy:       {}", percent(summary.estimation_accuracy));
    println!("  Load balance:   {:.2}", summary.load_balance);
    println!("  Success rate:   {}", percent(Some(summary.success_rate)));
    println!("  Trend:          {:?}", report.trend.trend);

    println!();
    for shard in &report.shards {
        println!(
            "  Shard {:>3}  {:<10} {:>4} units  est {:>8.2}s  actual {:>8.2}s",
            shard.shard_id,
            style_status(shard.status),
            shard.units.len(),
            shard.estimated_duration,
            shard.actual_duration
        );
    }

    if !report.skipped_files.is_empty() {
        println!();
        println!(
            "{}",
            console::style(format!("Skipped {} files", report.skipped_files.len())).yellow()
        );
    }

    for warning in &report.warnings {
        println!("{} {}", console::style("warning:").yellow().bold(), warning);
    }

    if !report.recommendations.is_empty() {
        println!();
        println!("Recommendations:");
        for rec in &report.recommendations {
            println!("  - {}", rec.message);
        }
    }

    println!();
    if report.success() {
        println!("{}", console::style("All shards passed!").green().bold());
    } else {
        println!("{}", console::style("Some shards failed.").red().bold());
    }
}

/// Prints a partition plan to the console.
pub fn print_plan(plan: &Plan) {
    println!();
    println!(
        "Plan: {} units across {} shards, estimated makespan {:.2}s",
        plan.units.len(),
        plan.shards.len(),
        plan.estimated_makespan()
    );
    if plan.cold_start > 0 {
        println!(
            "{}",
            console::style(format!("{} units have no history", plan.cold_start)).yellow()
        );
    }
    for shard in &plan.shards {
        println!(
            "  Shard {:>3}  {:>4} units  est {:>8.2}s",
            shard.id,
            shard.units.len(),
            shard.estimated_duration
        );
        for unit in &shard.units {
            println!("      {}", console::style(unit).dim());
        }
    }
    if !plan.skipped.is_empty() {
        println!();
        for skipped in &plan.skipped {
            println!(
                "{} {}: {}",
                console::style("skipped").yellow(),
                skipped.path,
                skipped.reason
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ShardRunSummary;
    use crate::orchestrator::tracker::ShardAccuracy;

    fn ts(secs: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn history_with_makespans(makespans: &[f64]) -> HistorySnapshot {
        let mut history = HistorySnapshot::default();
        for (i, m) in makespans.iter().enumerate() {
            history.record_run(ShardRunSummary {
                run_id: uuid::Uuid::new_v4(),
                timestamp: ts(i as i64),
                shard_count: 2,
                total_duration: *m,
                avg_accuracy: Some(0.1),
                success_rate: 1.0,
            });
        }
        history
    }

    fn shard(id: usize, estimated: f64) -> ShardAssignment {
        ShardAssignment {
            id,
            units: vec![format!("u{}", id)],
            estimated_duration: estimated,
        }
    }

    fn result(id: usize, status: ShardStatus, duration: f64) -> ShardResult {
        ShardResult {
            shard_id: id,
            status,
            duration,
            exit_code: Some(if status == ShardStatus::Passed { 0 } else { 1 }),
            stdout_ref: None,
            stderr_ref: None,
            unit_durations: None,
            error: None,
        }
    }

    fn metrics(makespan: f64, avg_accuracy: Option<f64>, duration_cv: f64) -> RunMetrics {
        RunMetrics {
            run_id: uuid::Uuid::new_v4(),
            timestamp: ts(0),
            shard_count: 2,
            makespan,
            avg_accuracy,
            success_rate: 1.0,
            load_balance: 1.0 - duration_cv,
            duration_cv,
            shards: vec![ShardAccuracy {
                shard_id: 1,
                estimated_duration: 10.0,
                actual_duration: 10.0,
                accuracy: avg_accuracy,
            }],
            units_recorded: 2,
        }
    }

    fn kinds(report: &OptimizationReport) -> Vec<RecommendationKind> {
        report.recommendations.iter().map(|r| r.kind).collect()
    }

    fn generator() -> ReportGenerator {
        ReportGenerator::new(ReportConfig::default())
    }

    #[test]
    fn test_healthy_run_has_no_recommendations() {
        let shards = vec![shard(1, 10.0), shard(2, 10.0)];
        let results = BTreeMap::from([
            (1, result(1, ShardStatus::Passed, 10.0)),
            (2, result(2, ShardStatus::Passed, 10.0)),
        ]);
        let report = generator().generate(
            &shards,
            &results,
            &metrics(10.0, Some(0.0), 0.0),
            &HistorySnapshot::default(),
        );

        assert!(report.recommendations.is_empty());
        assert!(report.success());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.summary.estimation_accuracy, Some(1.0));
        assert_eq!(report.shards[0].accuracy, Some(0.0));
    }

    #[test]
    fn test_each_heuristic_fires() {
        let shards = vec![shard(1, 10.0), shard(2, 10.0)];
        let results = BTreeMap::from([
            (1, result(1, ShardStatus::Passed, 700.0)),
            (2, result(2, ShardStatus::TimedOut, 900.0)),
        ]);
        let report = generator().generate(
            &shards,
            &results,
            &metrics(900.0, Some(0.5), 0.3),
            &HistorySnapshot::default(),
        );

        assert_eq!(
            kinds(&report),
            vec![
                RecommendationKind::Rebalance,
                RecommendationKind::GatherHistory,
                RecommendationKind::IsolateFailures,
                RecommendationKind::ScaleOut,
            ]
        );
        assert!(!report.success());
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_unknown_accuracy_does_not_recommend_history() {
        let shards = vec![shard(1, 10.0)];
        let results = BTreeMap::from([(1, result(1, ShardStatus::Passed, 10.0))]);
        let report = generator().generate(
            &shards,
            &results,
            &metrics(10.0, None, 0.0),
            &HistorySnapshot::default(),
        );
        assert!(report.recommendations.is_empty());
        assert_eq!(report.summary.estimation_accuracy, None);
    }

    #[test]
    fn test_skipped_shards_do_not_fail_the_run() {
        let shards = vec![shard(1, 10.0), shard(2, 0.0)];
        let results = BTreeMap::from([
            (1, result(1, ShardStatus::Passed, 10.0)),
            (2, result(2, ShardStatus::Skipped, 0.0)),
        ]);
        let report = generator().generate(
            &shards,
            &results,
            &metrics(10.0, Some(0.0), 0.0),
            &HistorySnapshot::default(),
        );
        assert!(report.success());
    }

    #[test]
    fn test_trend_classification() {
        let generator = generator();

        let falling = history_with_makespans(&[100.0, 90.0, 80.0, 70.0, 60.0]);
        assert_eq!(generator.trend(&falling).trend, Trend::Improving);

        let rising = history_with_makespans(&[60.0, 70.0, 80.0, 90.0, 100.0]);
        assert_eq!(generator.trend(&rising).trend, Trend::Degrading);

        let flat = history_with_makespans(&[80.0, 81.0, 79.0, 80.0, 80.5]);
        assert_eq!(generator.trend(&flat).trend, Trend::Stable);

        let single = history_with_makespans(&[80.0]);
        let analysis = generator.trend(&single);
        assert_eq!(analysis.trend, Trend::Stable);
        assert_eq!(analysis.relative_slope, None);
    }

    #[test]
    fn test_trend_uses_recent_window() {
        let mut makespans = vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0];
        makespans.extend([60.0; 10]);
        let history = history_with_makespans(&makespans);

        let analysis = generator().trend(&history);
        assert_eq!(analysis.runs_considered, 10);
        assert_eq!(analysis.trend, Trend::Stable);
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out/report.json");
        let shards = vec![shard(1, 10.0)];
        let results = BTreeMap::from([(1, result(1, ShardStatus::Passed, 10.0))]);
        let report = generator().generate(
            &shards,
            &results,
            &metrics(10.0, Some(0.0), 0.0),
            &HistorySnapshot::default(),
        );

        write_json(&report, &path).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["shards"][0]["status"], "passed");
        assert_eq!(value["trend"]["trend"], "stable");
    }
}
