//! Configuration schema definitions for shardsmith.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Every section is optional and falls back to
//! defaults tuned for a Jest-style JavaScript/TypeScript test suite.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── SchedulerConfig        - Shard count, timeouts, file patterns
//! ├── AnalyzerConfig         - Test markers, dependency patterns, indicators
//! │   └── IndicatorConfig    - One complexity category (pattern + weight)
//! ├── EstimatorConfig        - Cold-start heuristic and duration floor
//! ├── HistoryConfig          - History file location and rolling window caps
//! ├── RunnerConfig           - External test-runner command
//! └── ReportConfig           - Recommendation thresholds and report output
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure for shardsmith.
///
/// # TOML Structure
///
/// ```toml
/// [scheduler]
/// shard_count = 4
/// per_shard_timeout_secs = 300
/// file_patterns = ["tests/**/*.test.js"]
///
/// [analyzer.indicators.network]
/// pattern = "\\bfetch\\s*\\("
/// weight = 5.0
///
/// [runner]
/// command = "npx jest {files}"
/// ```
///
/// # Example
///
/// ```
/// use shardsmith::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [scheduler]
///     shard_count = 2
/// "#).unwrap();
/// assert_eq!(config.scheduler.shard_count, 2);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Shard count, timeouts and which files to consider.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Static analysis patterns.
    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    /// Duration estimation tuning.
    #[serde(default)]
    pub estimator: EstimatorConfig,

    /// History persistence.
    #[serde(default)]
    pub history: HistoryConfig,

    /// External test-runner invocation.
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Report thresholds and output.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Core scheduling settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `shard_count` | 4 |
/// | `per_shard_timeout_secs` | 900 (15 minutes) |
/// | `global_timeout_secs` | None |
/// | `file_patterns` | `**/*.test.{js,ts}`, `**/*.spec.{js,ts}` |
/// | `working_dir` | None (current directory) |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Number of shards to partition the discovered units into.
    ///
    /// Signed so that a negative value reaches validation and is reported
    /// as an invalid configuration instead of a TOML type error.
    ///
    /// Default: 4
    #[serde(default = "default_shard_count")]
    pub shard_count: i64,

    /// Upper bound on a single shard's execution, in seconds.
    ///
    /// Default: 900 (15 minutes)
    #[serde(default = "default_per_shard_timeout")]
    pub per_shard_timeout_secs: f64,

    /// Optional bound on the whole parallel phase, in seconds.
    ///
    /// When it expires every still-running shard is aborted.
    #[serde(default)]
    pub global_timeout_secs: Option<f64>,

    /// Glob patterns selecting candidate test files, relative to `working_dir`.
    #[serde(default = "default_file_patterns")]
    pub file_patterns: Vec<String>,

    /// Root directory for discovery.
    ///
    /// If not specified, the current working directory is used.
    pub working_dir: Option<PathBuf>,
}

/// Largest timeout, in seconds, that validation accepts (one year).
pub const MAX_TIMEOUT_SECS: f64 = 366.0 * 24.0 * 60.0 * 60.0;

impl SchedulerConfig {
    /// Per-shard timeout as a [`Duration`].
    pub fn per_shard_timeout(&self) -> Duration {
        timeout_duration(self.per_shard_timeout_secs)
    }

    /// Global timeout as a [`Duration`], if configured.
    pub fn global_timeout(&self) -> Option<Duration> {
        self.global_timeout_secs.map(timeout_duration)
    }
}

/// Saturates at [`MAX_TIMEOUT_SECS`].
fn timeout_duration(secs: f64) -> Duration {
    if secs.is_nan() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(secs.clamp(0.0, MAX_TIMEOUT_SECS))
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            per_shard_timeout_secs: default_per_shard_timeout(),
            global_timeout_secs: None,
            file_patterns: default_file_patterns(),
            working_dir: None,
        }
    }
}

fn default_shard_count() -> i64 {
    4
}

fn default_per_shard_timeout() -> f64 {
    900.0 // 15 minutes
}

fn default_file_patterns() -> Vec<String> {
    vec![
        "**/*.test.js".to_string(),
        "**/*.test.ts".to_string(),
        "**/*.spec.js".to_string(),
        "**/*.spec.ts".to_string(),
    ]
}

/// Static analysis configuration.
///
/// All patterns are regular expressions (Rust `regex` syntax). Test markers
/// are counted per match; dependency patterns must have one capture group
/// holding the imported module identifier.
///
/// # Example
///
/// ```toml
/// [analyzer]
/// test_markers = ["^\\s*def test_"]
/// dependency_patterns = ["^\\s*import\\s+([\\w.]+)"]
/// line_weight = 0.1
///
/// [analyzer.indicators.async]
/// pattern = "\\basync\\b|\\bawait\\b"
/// weight = 2.0
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalyzerConfig {
    /// Patterns whose matches are counted as individual test cases.
    #[serde(default = "default_test_markers")]
    pub test_markers: Vec<String>,

    /// Patterns extracting imported module identifiers (capture group 1).
    #[serde(default = "default_dependency_patterns")]
    pub dependency_patterns: Vec<String>,

    /// Complexity indicator categories keyed by name.
    #[serde(default = "default_indicators")]
    pub indicators: BTreeMap<String, IndicatorConfig>,

    /// Complexity contributed by every non-empty line.
    ///
    /// Default: 0.1
    #[serde(default = "default_line_weight")]
    pub line_weight: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            test_markers: default_test_markers(),
            dependency_patterns: default_dependency_patterns(),
            indicators: default_indicators(),
            line_weight: default_line_weight(),
        }
    }
}

/// A single complexity indicator category.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IndicatorConfig {
    /// Regular expression; every match counts once.
    pub pattern: String,

    /// Complexity added per match. Must be non-negative.
    pub weight: f64,
}

impl IndicatorConfig {
    pub fn new(pattern: impl Into<String>, weight: f64) -> Self {
        Self {
            pattern: pattern.into(),
            weight,
        }
    }
}

// `it(` / `test(` calls, not methods like `regex.test(`.
fn default_test_markers() -> Vec<String> {
    vec![r"(?m)(?:^|[^.\w$])(?:it|test)(?:\.only|\.skip|\.each\([^)]*\))?\s*\(".to_string()]
}

fn default_dependency_patterns() -> Vec<String> {
    vec![
        r#"\bimport\s+(?:[^'";]*?\s+from\s+)?['"]([^'"]+)['"]"#.to_string(),
        r#"\brequire\s*\(\s*['"]([^'"]+)['"]\s*\)"#.to_string(),
    ]
}

fn default_indicators() -> BTreeMap<String, IndicatorConfig> {
    BTreeMap::from([
        (
            "async".to_string(),
            IndicatorConfig::new(r"\basync\b|\bawait\b", 2.0),
        ),
        (
            "network".to_string(),
            IndicatorConfig::new(r"\bfetch\s*\(|\baxios\b|\bhttps?\.|\bsupertest\b", 5.0),
        ),
        (
            "timers".to_string(),
            IndicatorConfig::new(r"\bsetTimeout\b|\bsetInterval\b|\bsleep\s*\(", 3.0),
        ),
        (
            "database".to_string(),
            IndicatorConfig::new(
                r"\bdatabase\b|\bdb\.|\.query\s*\(|\bmongoose\b|\bsequelize\b|\bprisma\b",
                4.0,
            ),
        ),
        (
            "mocking".to_string(),
            IndicatorConfig::new(r"\bjest\.mock\b|\bjest\.fn\b|\bsinon\b|\bspyOn\b", 1.5),
        ),
    ])
}

fn default_line_weight() -> f64 {
    0.1
}

/// Duration estimation settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `base_time_per_test_secs` | 0.5 |
/// | `min_duration_secs` | 0.01 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EstimatorConfig {
    /// Cold-start seconds per test case.
    #[serde(default = "default_base_time_per_test")]
    pub base_time_per_test_secs: f64,

    /// Floor applied to every estimate. Must be strictly positive.
    #[serde(default = "default_min_duration")]
    pub min_duration_secs: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            base_time_per_test_secs: default_base_time_per_test(),
            min_duration_secs: default_min_duration(),
        }
    }
}

fn default_base_time_per_test() -> f64 {
    0.5
}

fn default_min_duration() -> f64 {
    0.01
}

/// History persistence settings.
///
/// # Example
///
/// ```toml
/// [history]
/// path = "~/.cache/shardsmith/history.json"
/// per_unit_cap = 100
/// per_run_cap = 50
/// prune_stale = true
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistoryConfig {
    /// JSON file holding the history snapshot. `~` and `$VAR` are expanded.
    #[serde(default = "default_history_path")]
    pub path: PathBuf,

    /// Rolling window size per test unit.
    #[serde(default = "default_per_unit_cap")]
    pub per_unit_cap: usize,

    /// Rolling window size of run summaries.
    #[serde(default = "default_per_run_cap")]
    pub per_run_cap: usize,

    /// Drop records of units that were not discovered in the current run.
    ///
    /// Default: false (stale records are only listed in the report)
    #[serde(default)]
    pub prune_stale: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: default_history_path(),
            per_unit_cap: default_per_unit_cap(),
            per_run_cap: default_per_run_cap(),
            prune_stale: false,
        }
    }
}

fn default_history_path() -> PathBuf {
    PathBuf::from(".shardsmith/history.json")
}

fn default_per_unit_cap() -> usize {
    100
}

fn default_per_run_cap() -> usize {
    50
}

/// External test-runner settings used by [`CommandRunner`](crate::runner::CommandRunner).
///
/// # Example
///
/// ```toml
/// [runner]
/// command = "npx jest --ci {files}"
/// working_dir = "."
/// log_dir = "test-results/shards"
///
/// [runner.env]
/// NODE_ENV = "test"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Command template. `{files}` expands to the shard's file paths as
    /// separate arguments; without the placeholder they are appended.
    #[serde(default = "default_runner_command")]
    pub command: String,

    /// Working directory for the runner process.
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables for the runner process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Directory receiving per-shard stdout/stderr logs.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: default_runner_command(),
            working_dir: None,
            env: HashMap::new(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_runner_command() -> String {
    "npx jest --ci {files}".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".shardsmith/logs")
}

/// Report thresholds and output location.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `rebalance_variance_threshold` | 0.2 |
/// | `accuracy_threshold` | 0.8 |
/// | `makespan_ceiling_secs` | 600 |
/// | `trend_window` | 10 |
/// | `trend_threshold` | 0.05 |
/// | `output` | `.shardsmith/report.json` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Coefficient of variation of shard durations above which a
    /// rebalance is recommended.
    #[serde(default = "default_variance_threshold")]
    pub rebalance_variance_threshold: f64,

    /// Estimation accuracy (1 - mean relative error) below which more
    /// history is recommended.
    #[serde(default = "default_accuracy_threshold")]
    pub accuracy_threshold: f64,

    /// Makespan, in seconds, above which more shards are recommended.
    #[serde(default = "default_makespan_ceiling")]
    pub makespan_ceiling_secs: f64,

    /// Number of recent run summaries considered for trend analysis.
    #[serde(default = "default_trend_window")]
    pub trend_window: usize,

    /// Relative makespan slope per run separating stable from
    /// improving/degrading.
    #[serde(default = "default_trend_threshold")]
    pub trend_threshold: f64,

    /// Where the JSON report is written.
    #[serde(default = "default_report_output")]
    pub output: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            rebalance_variance_threshold: default_variance_threshold(),
            accuracy_threshold: default_accuracy_threshold(),
            makespan_ceiling_secs: default_makespan_ceiling(),
            trend_window: default_trend_window(),
            trend_threshold: default_trend_threshold(),
            output: default_report_output(),
        }
    }
}

fn default_variance_threshold() -> f64 {
    0.2
}

fn default_accuracy_threshold() -> f64 {
    0.8
}

fn default_makespan_ceiling() -> f64 {
    600.0
}

fn default_trend_window() -> usize {
    10
}

fn default_trend_threshold() -> f64 {
    0.05
}

fn default_report_output() -> PathBuf {
    PathBuf::from(".shardsmith/report.json")
}
