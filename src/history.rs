//! Historical run data.
//!
//! The [`HistorySnapshot`] is the single owner of two rolling windows:
//! per-unit duration/outcome entries and run-level summaries. It is loaded
//! once before a run, passed by shared reference to the estimator, and
//! mutated only by the tracker after every shard has finished.
//!
//! Persistence goes through the [`HistoryStore`] trait. [`JsonFileStore`]
//! keeps the snapshot as pretty-printed JSON on disk.
//!
//! # Example
//!
//! ```no_run
//! use shardsmith::history::{HistoryStore, JsonFileStore};
//!
//! let store = JsonFileStore::new(".shardsmith/history.json", 100, 50);
//! let mut history = store.load()?;
//!
//! history.record_unit("tests/a.test.js", 1.5, true, chrono::Utc::now());
//! store.save(&history)?;
//! # Ok::<(), shardsmith::history::HistoryError>(())
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Errors from loading or saving history.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// Reading or writing the backing storage failed.
    #[error("History I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The stored snapshot could not be decoded or encoded.
    #[error("History serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One observation of a test unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Seconds attributed to the unit for this run.
    pub duration: f64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

/// Rolling window of observations for one test unit, with aggregates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub entries: VecDeque<HistoryEntry>,

    /// Mean duration of the successful entries in the window.
    pub avg_duration: Option<f64>,

    /// Fraction of entries in the window that failed.
    pub failure_rate: f64,
}

impl HistoryRecord {
    fn push(&mut self, entry: HistoryEntry, cap: usize) {
        self.entries.push_back(entry);
        self.truncate(cap);
    }

    fn truncate(&mut self, cap: usize) {
        while self.entries.len() > cap {
            self.entries.pop_front();
        }
        self.recompute();
    }

    fn recompute(&mut self) {
        let (sum, successes) = self
            .entries
            .iter()
            .filter(|e| e.success)
            .fold((0.0, 0usize), |(sum, n), e| (sum + e.duration, n + 1));
        self.avg_duration = (successes > 0).then(|| sum / successes as f64);

        self.failure_rate = if self.entries.is_empty() {
            0.0
        } else {
            (self.entries.len() - successes) as f64 / self.entries.len() as f64
        };
    }
}

/// Run-level snapshot used for trend analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRunSummary {
    pub run_id: uuid::Uuid,
    pub timestamp: DateTime<Utc>,
    pub shard_count: usize,

    /// Makespan of the run, in seconds.
    pub total_duration: f64,

    /// Mean relative estimation error across shards whose runner finished.
    /// `None` when no shard produced a comparable duration.
    pub avg_accuracy: Option<f64>,

    /// Fraction of executed shards that passed.
    pub success_rate: f64,
}

/// Versioned snapshot of all learning state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    /// Incremented on every tracker update.
    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    units: BTreeMap<String, HistoryRecord>,

    #[serde(default)]
    runs: VecDeque<ShardRunSummary>,

    #[serde(skip, default = "default_per_unit_cap")]
    per_unit_cap: usize,

    #[serde(skip, default = "default_per_run_cap")]
    per_run_cap: usize,
}

fn default_per_unit_cap() -> usize {
    100
}

fn default_per_run_cap() -> usize {
    50
}

impl Default for HistorySnapshot {
    fn default() -> Self {
        Self::with_caps(default_per_unit_cap(), default_per_run_cap())
    }
}

impl HistorySnapshot {
    /// Creates an empty snapshot with the given window caps (minimum 1).
    pub fn with_caps(per_unit_cap: usize, per_run_cap: usize) -> Self {
        Self {
            version: 0,
            units: BTreeMap::new(),
            runs: VecDeque::new(),
            per_unit_cap: per_unit_cap.max(1),
            per_run_cap: per_run_cap.max(1),
        }
    }

    /// Applies new caps, evicting the oldest entries that no longer fit.
    pub fn set_caps(&mut self, per_unit_cap: usize, per_run_cap: usize) {
        self.per_unit_cap = per_unit_cap.max(1);
        self.per_run_cap = per_run_cap.max(1);
        for record in self.units.values_mut() {
            record.truncate(self.per_unit_cap);
        }
        while self.runs.len() > self.per_run_cap {
            self.runs.pop_front();
        }
    }

    pub fn per_unit_cap(&self) -> usize {
        self.per_unit_cap
    }

    pub fn per_run_cap(&self) -> usize {
        self.per_run_cap
    }

    /// Returns the record for a unit, if it was ever observed.
    pub fn get(&self, path: &str) -> Option<&HistoryRecord> {
        self.units.get(path)
    }

    /// Historical average duration for a unit, if it has successful runs.
    pub fn avg_duration(&self, path: &str) -> Option<f64> {
        self.units.get(path).and_then(|r| r.avg_duration)
    }

    /// Historical failure rate for a unit; 0 when never observed.
    pub fn failure_rate(&self, path: &str) -> f64 {
        self.units.get(path).map(|r| r.failure_rate).unwrap_or(0.0)
    }

    /// Iterates over all unit records in path order.
    pub fn units(&self) -> impl Iterator<Item = (&str, &HistoryRecord)> {
        self.units.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Run summaries, oldest first.
    pub fn runs(&self) -> &VecDeque<ShardRunSummary> {
        &self.runs
    }

    /// The most recent `n` run summaries, oldest first.
    pub fn recent_runs(&self, n: usize) -> Vec<&ShardRunSummary> {
        let skip = self.runs.len().saturating_sub(n);
        self.runs.iter().skip(skip).collect()
    }

    /// Appends one observation to a unit's window, creating the record on
    /// first observation and evicting the oldest entry past the cap.
    pub fn record_unit(
        &mut self,
        path: &str,
        duration: f64,
        success: bool,
        timestamp: DateTime<Utc>,
    ) {
        let cap = self.per_unit_cap;
        self.units.entry(path.to_string()).or_default().push(
            HistoryEntry {
                duration,
                timestamp,
                success,
            },
            cap,
        );
    }

    /// Appends a run summary, evicting the oldest past the cap.
    pub fn record_run(&mut self, summary: ShardRunSummary) {
        self.runs.push_back(summary);
        while self.runs.len() > self.per_run_cap {
            self.runs.pop_front();
        }
    }

    /// Paths with history that are not in `discovered`.
    pub fn stale_paths(&self, discovered: &BTreeSet<String>) -> Vec<String> {
        self.units
            .keys()
            .filter(|path| !discovered.contains(*path))
            .cloned()
            .collect()
    }

    /// Removes the records of the given paths. Returns how many were removed.
    pub fn prune(&mut self, paths: &[String]) -> usize {
        paths
            .iter()
            .filter(|path| self.units.remove(path.as_str()).is_some())
            .count()
    }

    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }
}

/// Persistence boundary for history snapshots.
///
/// Implementations decide the storage medium. Both calls happen on the
/// orchestrator's single control path: `load` before discovery, `save`
/// after every shard has finished.
pub trait HistoryStore: Send + Sync {
    /// Loads the current snapshot. A store with nothing saved yet returns
    /// an empty snapshot.
    fn load(&self) -> Result<HistorySnapshot, HistoryError>;

    /// Persists a snapshot, replacing the previous one.
    fn save(&self, snapshot: &HistorySnapshot) -> Result<(), HistoryError>;
}

impl<T> HistoryStore for &T
where
    T: HistoryStore + ?Sized,
{
    fn load(&self) -> Result<HistorySnapshot, HistoryError> {
        (**self).load()
    }

    fn save(&self, snapshot: &HistorySnapshot) -> Result<(), HistoryError> {
        (**self).save(snapshot)
    }
}

/// Stores the history snapshot as a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    per_unit_cap: usize,
    per_run_cap: usize,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>, per_unit_cap: usize, per_run_cap: usize) -> Self {
        Self {
            path: path.into(),
            per_unit_cap,
            per_run_cap,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistoryStore for JsonFileStore {
    fn load(&self) -> Result<HistorySnapshot, HistoryError> {
        tracing::debug!("Loading history from: {}", self.path.display());

        if !self.path.exists() {
            tracing::debug!("History file does not exist, starting empty");
            return Ok(HistorySnapshot::with_caps(self.per_unit_cap, self.per_run_cap));
        }

        let contents = fs::read_to_string(&self.path).map_err(|source| HistoryError::Io {
            path: self.path.clone(),
            source,
        })?;
        let mut snapshot: HistorySnapshot = serde_json::from_str(&contents)?;
        snapshot.set_caps(self.per_unit_cap, self.per_run_cap);

        tracing::debug!(
            "Loaded history v{} with {} units and {} runs",
            snapshot.version,
            snapshot.units.len(),
            snapshot.runs.len()
        );
        Ok(snapshot)
    }

    fn save(&self, snapshot: &HistorySnapshot) -> Result<(), HistoryError> {
        tracing::debug!("Saving history to: {}", self.path.display());

        let io_err = |source: std::io::Error| HistoryError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let contents = serde_json::to_string_pretty(snapshot)?;

        // Sibling temp file, then rename over the target
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, contents).map_err(io_err)?;
        fs::rename(&tmp_path, &self.path).map_err(io_err)?;

        tracing::debug!("Saved history v{}", snapshot.version);
        Ok(())
    }
}
