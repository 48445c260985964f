//! Run orchestration.
//!
//! The [`Orchestrator`] wires the stages of a run together. Everything up
//! to partitioning is synchronous and happens before the first shard
//! starts; execution is the only concurrent stage; history is written once,
//! after every shard has finished.
//!
//! # Architecture
//!
//! ```text
//!  HistoryStore.load() ──► HistorySnapshot (read-only)
//!                               │
//!  FileSource ──► Discoverer ───┤──► Vec<TestUnit>
//!                                          │
//!                                     Partitioner
//!                                          │
//!                               Vec<ShardAssignment>
//!                                          │
//!                   ParallelExecutor ──► TestRunner (one call per shard)
//!                                          │
//!                         BTreeMap<shard id, ShardResult>   ── join barrier
//!                                          │
//!                   AccuracyTracker ──► HistorySnapshot (mutated)
//!                                          │
//!                   HistoryStore.save()  ReportGenerator
//!                                          │
//!                                  OptimizationReport
//! ```
//!
//! Configuration errors are the only thing that stops a run, and they are
//! raised by [`Orchestrator::new`] before any stage runs. Per-file,
//! per-shard and persistence failures end up in the report.
//!
//! # Example
//!
//! ```no_run
//! use shardsmith::config::load_config;
//! use shardsmith::history::JsonFileStore;
//! use shardsmith::orchestrator::{Orchestrator, file_source};
//! use shardsmith::runner::CommandRunner;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("shardsmith.toml"))?;
//!
//!     let runner = CommandRunner::new(&config.runner)?;
//!     let store = JsonFileStore::new(&config.history.path, 100, 50);
//!     let source = file_source(&config);
//!
//!     let orchestrator = Orchestrator::new(config, runner, store)?;
//!     let report = orchestrator.run(source).await;
//!
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod executor;
pub mod partitioner;
pub mod tracker;

use std::path::PathBuf;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, ConfigError};
use crate::discovery::{
    Discoverer, DiscoveryError, GlobFileSource, SkippedFile, SourceFile, TestUnit,
};
use crate::history::{HistorySnapshot, HistoryStore};
use crate::report::{OptimizationReport, ReportGenerator};
use crate::runner::TestRunner;

pub use executor::{ParallelExecutor, ShardCallback, ShardResult, ShardStatus};
pub use partitioner::{Partitioner, ShardAssignment};
pub use tracker::{AccuracyTracker, RunMetrics};

/// Discovery and partitioning output, before anything runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub units: Vec<TestUnit>,
    pub shards: Vec<ShardAssignment>,
    pub skipped: Vec<SkippedFile>,

    /// History paths that were not discovered.
    pub stale: Vec<String>,

    pub cold_start: usize,
}

impl Plan {
    pub fn estimated_makespan(&self) -> f64 {
        partitioner::estimated_makespan(&self.shards)
    }
}

/// The file source described by the configuration.
///
/// Patterns are resolved under `scheduler.working_dir`, or the current
/// directory when unset.
pub fn file_source(config: &Config) -> GlobFileSource {
    let root = config
        .scheduler
        .working_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    GlobFileSource::new(root, &config.scheduler.file_patterns)
}

/// Coordinates one scheduling run.
///
/// # Type Parameters
///
/// - `R`: The test runner (implements [`TestRunner`])
/// - `H`: The history store (implements [`HistoryStore`])
pub struct Orchestrator<R, H> {
    config: Config,
    runner: R,
    store: H,
    discoverer: Discoverer,
    partitioner: Partitioner,
    cancellation_token: CancellationToken,
    shard_callback: Option<ShardCallback>,
}

impl<R, H> Orchestrator<R, H>
where
    R: TestRunner,
    H: HistoryStore,
{
    /// Validates the configuration and builds every stage.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidConfiguration`] for any invalid setting. No
    /// file is read, no history is loaded and nothing is executed.
    pub fn new(config: Config, runner: R, store: H) -> Result<Self, ConfigError> {
        config.validate()?;
        let discoverer = Discoverer::from_config(&config)?;
        let partitioner = Partitioner::new(config.shard_count())?;

        Ok(Self {
            config,
            runner,
            store,
            discoverer,
            partitioner,
            cancellation_token: CancellationToken::new(),
            shard_callback: None,
        })
    }

    /// Cancelling the token aborts outstanding shards.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Called as each shard finishes.
    pub fn with_shard_callback(mut self, callback: ShardCallback) -> Self {
        self.shard_callback = Some(callback);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The stored history, or an empty one when loading failed.
    ///
    /// The flag is `false` after a failed load; such a snapshot must not be
    /// saved over the store.
    fn load_history(&self, warnings: &mut Vec<String>) -> (HistorySnapshot, bool) {
        let (mut history, loaded) = match self.store.load() {
            Ok(history) => (history, true),
            Err(e) => {
                warn!("Failed to load history, starting empty: {}", e);
                warnings.push(format!("history could not be loaded: {}", e));
                (HistorySnapshot::default(), false)
            }
        };
        history.set_caps(
            self.config.history.per_unit_cap,
            self.config.history.per_run_cap,
        );
        (history, loaded)
    }

    fn plan_with<S>(&self, source: S, history: &HistorySnapshot) -> Plan
    where
        S: IntoIterator<Item = Result<SourceFile, DiscoveryError>>,
    {
        let discovery = self.discoverer.discover(source, history);
        let stale = history.stale_paths(&discovery.paths());
        if !stale.is_empty() {
            info!("{} history entries were not discovered this run", stale.len());
        }
        let shards = self.partitioner.partition(&discovery.units);

        Plan {
            units: discovery.units,
            shards,
            skipped: discovery.skipped,
            stale,
            cold_start: discovery.cold_start,
        }
    }

    /// Discovers, estimates and partitions without executing anything.
    ///
    /// History is read but never written.
    pub fn plan<S>(&self, source: S) -> Plan
    where
        S: IntoIterator<Item = Result<SourceFile, DiscoveryError>>,
    {
        let mut warnings = Vec::new();
        let (history, _) = self.load_history(&mut warnings);
        self.plan_with(source, &history)
    }

    /// Runs the whole pipeline and returns the report.
    ///
    /// Never fails: per-file, per-shard and history failures are recorded
    /// in the report.
    pub async fn run<S>(&self, source: S) -> OptimizationReport
    where
        S: IntoIterator<Item = Result<SourceFile, DiscoveryError>>,
    {
        let mut warnings = Vec::new();
        let (mut history, loaded) = self.load_history(&mut warnings);

        let plan = self.plan_with(source, &history);
        info!(
            "Planned {} units across {} shards (estimated makespan {:.2}s)",
            plan.units.len(),
            plan.shards.len(),
            plan.estimated_makespan()
        );

        let started = chrono::Utc::now();
        let mut executor = ParallelExecutor::new(self.config.scheduler.per_shard_timeout())
            .with_global_timeout(self.config.scheduler.global_timeout())
            .with_cancellation_token(self.cancellation_token.clone());
        if let Some(callback) = &self.shard_callback {
            executor = executor.with_shard_callback(callback.clone());
        }
        let results = executor.execute(&plan.shards, &self.runner).await;

        let tracker = AccuracyTracker::new(self.config.estimator.min_duration_secs);
        let metrics = tracker.update(&mut history, &plan.units, &plan.shards, &results, started);

        let pruned = if self.config.history.prune_stale {
            let pruned = history.prune(&plan.stale);
            if pruned > 0 {
                info!("Pruned {} stale history entries", pruned);
            }
            pruned
        } else {
            0
        };

        if !loaded {
            warn!("Not saving history: the stored history could not be loaded");
            warnings.push(
                "history was not updated: the stored history could not be loaded".to_string(),
            );
        } else if let Err(e) = self.store.save(&history) {
            warn!("Failed to save history: {}", e);
            warnings.push(format!("history was not updated: {}", e));
        }

        let generator = ReportGenerator::new(self.config.report.clone());
        let mut report = generator.generate(&plan.shards, &results, &metrics, &history);
        report.summary.cold_start_units = plan.cold_start;
        report.skipped_files = plan.skipped;
        report.stale_history = plan.stale;
        report.pruned_history = pruned;
        report.warnings = warnings;

        if report.success() {
            info!("All {} shards passed", report.shards.len());
        } else {
            warn!("Run finished with failing shards");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::EstimateSource;
    use crate::history::HistoryError;
    use crate::runner::{RunOutput, RunnerError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<(usize, Vec<String>)>>,
        failing_shard: Option<usize>,
    }

    #[async_trait]
    impl TestRunner for RecordingRunner {
        async fn run_shard(
            &self,
            shard_id: usize,
            paths: &[String],
        ) -> Result<RunOutput, RunnerError> {
            self.calls.lock().unwrap().push((shard_id, paths.to_vec()));
            let exit_code = if self.failing_shard == Some(shard_id) { 1 } else { 0 };
            Ok(RunOutput {
                exit_code,
                duration: paths.len() as f64,
                ..RunOutput::default()
            })
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        snapshot: Mutex<Option<HistorySnapshot>>,
        fail_load: bool,
        fail_save: bool,
        saves: AtomicUsize,
    }

    fn io_error(msg: &str) -> HistoryError {
        HistoryError::Io {
            path: PathBuf::from("memory"),
            source: std::io::Error::other(msg.to_string()),
        }
    }

    impl HistoryStore for MemoryStore {
        fn load(&self) -> Result<HistorySnapshot, HistoryError> {
            if self.fail_load {
                return Err(io_error("unreadable"));
            }
            Ok(self.snapshot.lock().unwrap().clone().unwrap_or_default())
        }

        fn save(&self, snapshot: &HistorySnapshot) -> Result<(), HistoryError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.fail_save {
                return Err(io_error("disk full"));
            }
            *self.snapshot.lock().unwrap() = Some(snapshot.clone());
            Ok(())
        }
    }

    fn files() -> Vec<Result<SourceFile, DiscoveryError>> {
        vec![
            Ok(SourceFile::new(
                "a.test.js",
                "test('1', () => {});\ntest('2', () => {});\ntest('3', () => {});\n",
            )),
            Ok(SourceFile::new("b.test.js", "test('1', () => {});\ntest('2', () => {});\n")),
            Ok(SourceFile::new("c.test.js", "test('1', () => {});\n")),
            Ok(SourceFile::new("d.test.js", "test('1', () => {});\n")),
        ]
    }

    fn config(shards: i64) -> Config {
        let mut config = Config::default();
        config.scheduler.shard_count = shards;
        config
    }

    #[tokio::test]
    async fn test_run_end_to_end() {
        let orchestrator = Orchestrator::new(
            config(2),
            RecordingRunner::default(),
            MemoryStore::default(),
        )
        .unwrap();

        let report = orchestrator.run(files()).await;

        assert!(report.success());
        assert_eq!(report.shards.len(), 2);
        assert_eq!(report.summary.unit_count, 4);
        assert_eq!(report.summary.cold_start_units, 4);
        assert!(report.warnings.is_empty());

        let calls = orchestrator.runner.calls.lock().unwrap();
        let mut executed: Vec<String> = calls.iter().flat_map(|(_, p)| p.clone()).collect();
        executed.sort();
        assert_eq!(executed, vec!["a.test.js", "b.test.js", "c.test.js", "d.test.js"]);

        let saved = orchestrator.store.snapshot.lock().unwrap().clone().unwrap();
        assert_eq!(saved.version, 1);
        assert_eq!(saved.runs().len(), 1);
        assert!(saved.avg_duration("a.test.js").is_some());
    }

    #[tokio::test]
    async fn test_second_run_uses_history() {
        let orchestrator = Orchestrator::new(
            config(2),
            RecordingRunner::default(),
            MemoryStore::default(),
        )
        .unwrap();
        orchestrator.run(files()).await;

        let plan = orchestrator.plan(files());
        assert_eq!(plan.cold_start, 0);
        assert!(plan.units.iter().all(|u| u.estimate_source == EstimateSource::History));
    }

    #[tokio::test]
    async fn test_failed_shard_recorded_in_history() {
        let runner = RecordingRunner {
            failing_shard: Some(1),
            ..RecordingRunner::default()
        };
        let orchestrator = Orchestrator::new(config(2), runner, MemoryStore::default()).unwrap();

        let report = orchestrator.run(files()).await;

        assert!(!report.success());
        assert_eq!(report.exit_code(), 1);
        let saved = orchestrator.store.snapshot.lock().unwrap().clone().unwrap();
        for path in &report.shards[0].units {
            assert_eq!(saved.failure_rate(path), 1.0);
        }
    }

    #[tokio::test]
    async fn test_save_failure_is_a_warning() {
        let store = MemoryStore {
            fail_save: true,
            ..MemoryStore::default()
        };
        let orchestrator = Orchestrator::new(config(2), RecordingRunner::default(), store).unwrap();

        let report = orchestrator.run(files()).await;

        assert!(report.success());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("history was not updated"));
    }

    #[tokio::test]
    async fn test_load_failure_falls_back_to_cold_start() {
        let store = MemoryStore {
            fail_load: true,
            ..MemoryStore::default()
        };
        let orchestrator = Orchestrator::new(config(2), RecordingRunner::default(), store).unwrap();

        let report = orchestrator.run(files()).await;

        assert!(report.success());
        assert_eq!(report.summary.cold_start_units, 4);
        assert!(report.warnings[0].contains("could not be loaded"));
    }

    #[tokio::test]
    async fn test_load_failure_leaves_stored_history_intact() {
        let mut stored = HistorySnapshot::default();
        let ts = chrono::Utc::now();
        for _ in 0..100 {
            stored.record_unit("old.test.js", 4.0, true, ts);
        }
        stored.version = 7;

        let store = MemoryStore {
            snapshot: Mutex::new(Some(stored.clone())),
            fail_load: true,
            ..MemoryStore::default()
        };
        let orchestrator = Orchestrator::new(config(2), RecordingRunner::default(), store).unwrap();

        let report = orchestrator.run(files()).await;

        assert!(report.success());
        assert_eq!(orchestrator.store.saves.load(Ordering::SeqCst), 0);
        assert!(
            report
                .warnings
                .iter()
                .any(|w| w.contains("history was not updated"))
        );
        let kept = orchestrator.store.snapshot.lock().unwrap().clone().unwrap();
        assert_eq!(kept, stored);
    }

    #[test]
    fn test_invalid_config_has_no_side_effects() {
        let runner = RecordingRunner::default();
        let store = MemoryStore::default();

        for shards in [0, -2] {
            let result = Orchestrator::new(config(shards), &runner, &store);
            assert!(matches!(result, Err(ConfigError::InvalidConfiguration(_))));
        }
        assert!(runner.calls.lock().unwrap().is_empty());
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_plan_does_not_touch_history() {
        let orchestrator = Orchestrator::new(
            config(3),
            RecordingRunner::default(),
            MemoryStore::default(),
        )
        .unwrap();

        let plan = orchestrator.plan(files());

        assert_eq!(plan.shards.len(), 3);
        assert_eq!(plan.units.len(), 4);
        assert_eq!(orchestrator.store.saves.load(Ordering::SeqCst), 0);
        assert!(orchestrator.runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_history_reported_and_pruned() {
        let mut history = HistorySnapshot::default();
        history.record_unit("removed.test.js", 3.0, true, chrono::Utc::now());
        let store = MemoryStore {
            snapshot: Mutex::new(Some(history)),
            ..MemoryStore::default()
        };

        let mut config = config(2);
        config.history.prune_stale = true;
        let orchestrator = Orchestrator::new(config, RecordingRunner::default(), store).unwrap();

        let report = orchestrator.run(files()).await;

        assert_eq!(report.stale_history, vec!["removed.test.js"]);
        assert_eq!(report.pruned_history, 1);
        let saved = orchestrator.store.snapshot.lock().unwrap().clone().unwrap();
        assert!(saved.get("removed.test.js").is_none());
    }

    #[tokio::test]
    async fn test_more_shards_than_units() {
        let orchestrator = Orchestrator::new(
            config(6),
            RecordingRunner::default(),
            MemoryStore::default(),
        )
        .unwrap();

        let report = orchestrator.run(files()).await;

        assert!(report.success());
        assert_eq!(report.shards.len(), 6);
        let skipped = report
            .shards
            .iter()
            .filter(|s| s.status == ShardStatus::Skipped)
            .count();
        assert_eq!(skipped, 2);
        assert_eq!(orchestrator.runner.calls.lock().unwrap().len(), 4);
    }
}
