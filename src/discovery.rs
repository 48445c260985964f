//! Test unit discovery.
//!
//! Discovery pulls `(path, content)` pairs from a [`FileSource`], runs the
//! [`StaticAnalyzer`] over each one and asks the [`DurationEstimator`] for a
//! predicted duration. The result is a list of [`TestUnit`]s in discovery
//! order, plus the files that had to be skipped.
//!
//! ```text
//!  FileSource ──► (path, content) ──► StaticAnalyzer ──► Analysis
//!                                                          │
//!                              HistorySnapshot ──► DurationEstimator
//!                                                          │
//!                                                          ▼
//!                                                      TestUnit
//! ```
//!
//! A file that cannot be read or analyzed never aborts discovery: it is
//! logged, recorded as a [`SkippedFile`], and the next file is processed.

pub mod analyzer;
pub mod estimator;

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::history::HistorySnapshot;

pub use analyzer::{Analysis, StaticAnalyzer};
pub use estimator::{DurationEstimator, Estimate, EstimateSource};

/// Errors for a single candidate file.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The file could not be read.
    #[error("Failed to read {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file was read but its content cannot be analyzed.
    #[error("Failed to parse {path}: {reason}")]
    Unparseable { path: String, reason: String },

    /// A file pattern could not be expanded.
    #[error("Invalid file pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },
}

impl DiscoveryError {
    /// The path (or pattern) the error refers to.
    pub fn subject(&self) -> &str {
        match self {
            DiscoveryError::Unreadable { path, .. } => path,
            DiscoveryError::Unparseable { path, .. } => path,
            DiscoveryError::Pattern { pattern, .. } => pattern,
        }
    }
}

/// A candidate file handed to the analyzer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Stable identifier of the unit, usually a root-relative path.
    pub path: String,
    pub content: String,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// A lazy, finite sequence of candidate files.
///
/// Any iterator of `Result<SourceFile, DiscoveryError>` is a file source,
/// so tests can feed a `Vec` directly.
pub trait FileSource: Iterator<Item = Result<SourceFile, DiscoveryError>> {}

impl<T> FileSource for T where T: Iterator<Item = Result<SourceFile, DiscoveryError>> {}

/// File source that expands glob patterns under a root directory.
///
/// Patterns are expanded in order; within a pattern paths come out in
/// alphabetical order. A file matched by several patterns is yielded once.
/// Paths are reported relative to the root with `/` separators.
pub struct GlobFileSource {
    root: PathBuf,
    patterns: VecDeque<String>,
    current: Option<glob::Paths>,
    seen: HashSet<PathBuf>,
}

impl GlobFileSource {
    pub fn new(root: impl Into<PathBuf>, patterns: &[String]) -> Self {
        Self {
            root: root.into(),
            patterns: patterns.iter().cloned().collect(),
            current: None,
            seen: HashSet::new(),
        }
    }

    fn relative_id(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn read(&self, path: &Path) -> Result<SourceFile, DiscoveryError> {
        let id = self.relative_id(path);
        let bytes = std::fs::read(path).map_err(|source| DiscoveryError::Unreadable {
            path: id.clone(),
            source,
        })?;
        let content = String::from_utf8(bytes).map_err(|e| DiscoveryError::Unparseable {
            path: id.clone(),
            reason: format!("not valid UTF-8: {}", e.utf8_error()),
        })?;
        Ok(SourceFile { path: id, content })
    }
}

impl Iterator for GlobFileSource {
    type Item = Result<SourceFile, DiscoveryError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let pattern = self.patterns.pop_front()?;
                let root = glob::Pattern::escape(&self.root.to_string_lossy());
                let full = format!("{}/{}", root.trim_end_matches('/'), pattern);
                match glob::glob(&full) {
                    Ok(paths) => self.current = Some(paths),
                    Err(e) => {
                        return Some(Err(DiscoveryError::Pattern {
                            pattern,
                            reason: e.to_string(),
                        }));
                    }
                }
            }

            let paths = self.current.as_mut()?;
            match paths.next() {
                None => self.current = None,
                Some(Err(e)) => {
                    let path = self.relative_id(e.path());
                    return Some(Err(DiscoveryError::Unreadable {
                        path,
                        source: e.into_error(),
                    }));
                }
                Some(Ok(path)) => {
                    if path.is_dir() || !self.seen.insert(path.clone()) {
                        continue;
                    }
                    return Some(self.read(&path));
                }
            }
        }
    }
}

/// One discoverable test file/module with its predicted cost.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestUnit {
    /// Unique identifier, stable across runs.
    pub path: String,

    /// Predicted seconds. Estimates from discovery are always positive.
    pub estimated_duration: f64,

    pub test_count: usize,
    pub complexity_score: f64,

    /// Imported modules. Informational only.
    pub dependencies: BTreeSet<String>,

    /// Rolling failure rate from history, in `[0, 1]`.
    pub historical_failure_rate: f64,

    pub estimate_source: EstimateSource,
}

impl TestUnit {
    /// Creates a unit with a known estimate and no analysis data.
    pub fn new(path: impl Into<String>, estimated_duration: f64) -> Self {
        Self {
            path: path.into(),
            estimated_duration,
            test_count: 0,
            complexity_score: 0.0,
            dependencies: BTreeSet::new(),
            historical_failure_rate: 0.0,
            estimate_source: EstimateSource::ColdStart,
        }
    }
}

/// A candidate file that was not turned into a unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

/// Output of a discovery pass.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    /// Units in discovery order.
    pub units: Vec<TestUnit>,
    pub skipped: Vec<SkippedFile>,

    /// Units estimated without history.
    pub cold_start: usize,
}

impl Discovery {
    /// Paths of every discovered unit.
    pub fn paths(&self) -> BTreeSet<String> {
        self.units.iter().map(|u| u.path.clone()).collect()
    }
}

/// Turns candidate files into estimated test units.
pub struct Discoverer {
    analyzer: StaticAnalyzer,
    estimator: DurationEstimator,
}

impl Discoverer {
    pub fn new(analyzer: StaticAnalyzer, estimator: DurationEstimator) -> Self {
        Self {
            analyzer,
            estimator,
        }
    }

    /// Builds the analyzer and estimator from configuration.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(
            StaticAnalyzer::new(&config.analyzer)?,
            DurationEstimator::new(&config.estimator),
        ))
    }

    pub fn estimator(&self) -> &DurationEstimator {
        &self.estimator
    }

    /// Consumes the source once, analyzing and estimating every file.
    ///
    /// Single-threaded and synchronous. Per-file failures and duplicate
    /// paths are skipped with a warning.
    pub fn discover<S>(&self, source: S, history: &HistorySnapshot) -> Discovery
    where
        S: IntoIterator<Item = Result<SourceFile, DiscoveryError>>,
    {
        let mut discovery = Discovery::default();
        let mut seen = HashSet::new();

        for item in source {
            let file = match item {
                Ok(file) => file,
                Err(e) => {
                    warn!("Skipping {}: {}", e.subject(), e);
                    discovery.skipped.push(SkippedFile {
                        path: e.subject().to_string(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if !seen.insert(file.path.clone()) {
                warn!("Skipping duplicate path {}", file.path);
                discovery.skipped.push(SkippedFile {
                    path: file.path,
                    reason: "duplicate path".to_string(),
                });
                continue;
            }

            let analysis = match self.analyzer.analyze(&file.path, &file.content) {
                Ok(analysis) => analysis,
                Err(e) => {
                    warn!("Skipping {}: {}", file.path, e);
                    discovery.skipped.push(SkippedFile {
                        path: file.path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let estimate = self.estimator.estimate(
                &file.path,
                analysis.test_count,
                analysis.complexity_score,
                history,
            );
            if estimate.source == EstimateSource::ColdStart {
                discovery.cold_start += 1;
            }

            debug!(
                "{}: {} tests, complexity {:.2}, estimate {:.2}s ({:?})",
                file.path,
                analysis.test_count,
                analysis.complexity_score,
                estimate.duration,
                estimate.source
            );

            discovery.units.push(TestUnit {
                historical_failure_rate: history.failure_rate(&file.path),
                path: file.path,
                estimated_duration: estimate.duration,
                test_count: analysis.test_count,
                complexity_score: analysis.complexity_score,
                dependencies: analysis.dependencies,
                estimate_source: estimate.source,
            });
        }

        if discovery.cold_start > 0 {
            warn!(
                "{} of {} units have no history; using cold-start estimates",
                discovery.cold_start,
                discovery.units.len()
            );
        }
        info!(
            "Discovered {} test units ({} skipped)",
            discovery.units.len(),
            discovery.skipped.len()
        );

        discovery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    fn discoverer() -> Discoverer {
        Discoverer::from_config(&Config::default()).unwrap()
    }

    #[test]
    fn test_discover_from_memory_source() {
        let files = vec![
            Ok(SourceFile::new("a.test.js", "test('a', () => {});\ntest('b', () => {});\n")),
            Ok(SourceFile::new("b.test.js", "test('c', async () => { await x(); });\n")),
        ];
        let discovery = discoverer().discover(files, &HistorySnapshot::default());

        assert_eq!(discovery.units.len(), 2);
        assert_eq!(discovery.units[0].path, "a.test.js");
        assert_eq!(discovery.units[0].test_count, 2);
        assert_eq!(discovery.cold_start, 2);
        assert!(discovery.units.iter().all(|u| u.estimated_duration > 0.0));
    }

    #[test]
    fn test_discover_skips_failures_and_continues() {
        let files = vec![
            Err(DiscoveryError::Unreadable {
                path: "locked.test.js".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            }),
            Ok(SourceFile::new("binary.test.js", "\0\0")),
            Ok(SourceFile::new("ok.test.js", "test('x', () => {});")),
        ];
        let discovery = discoverer().discover(files, &HistorySnapshot::default());

        assert_eq!(discovery.units.len(), 1);
        assert_eq!(discovery.units[0].path, "ok.test.js");
        let skipped: Vec<_> = discovery.skipped.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(skipped, vec!["locked.test.js", "binary.test.js"]);
    }

    #[test]
    fn test_discover_skips_duplicate_paths() {
        let files = vec![
            Ok(SourceFile::new("a.test.js", "test('a', () => {});")),
            Ok(SourceFile::new("a.test.js", "test('a', () => {});")),
        ];
        let discovery = discoverer().discover(files, &HistorySnapshot::default());
        assert_eq!(discovery.units.len(), 1);
        assert_eq!(discovery.skipped.len(), 1);
    }

    #[test]
    fn test_discover_uses_history() {
        let mut history = HistorySnapshot::default();
        history.record_unit("a.test.js", 4.0, true, chrono::Utc::now());
        history.record_unit("a.test.js", 4.0, false, chrono::Utc::now());

        let files = vec![Ok(SourceFile::new("a.test.js", "test('a', () => {});"))];
        let discovery = discoverer().discover(files, &history);

        let unit = &discovery.units[0];
        assert_eq!(unit.estimate_source, EstimateSource::History);
        assert_eq!(unit.historical_failure_rate, 0.5);
        assert!(unit.estimated_duration >= 4.0);
        assert_eq!(discovery.cold_start, 0);
    }

    #[test]
    fn test_glob_source_walks_patterns() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("tests/nested")).unwrap();
        std::fs::write(root.join("tests/b.test.js"), "test('b', () => {});").unwrap();
        std::fs::write(root.join("tests/nested/a.test.js"), "test('a', () => {});").unwrap();
        std::fs::write(root.join("tests/helper.js"), "module.exports = {};").unwrap();

        let patterns = vec!["**/*.test.js".to_string(), "tests/*.test.js".to_string()];
        let files: Vec<_> = GlobFileSource::new(root, &patterns)
            .map(|r| r.unwrap().path)
            .collect();

        assert_eq!(files, vec!["tests/b.test.js", "tests/nested/a.test.js"]);
    }

    #[test]
    fn test_glob_source_reports_invalid_utf8() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("bad.test.js"), [0xff, 0xfe, 0x00]).unwrap();

        let patterns = vec!["*.test.js".to_string()];
        let results: Vec<_> = GlobFileSource::new(temp_dir.path(), &patterns).collect();

        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(DiscoveryError::Unparseable { ref path, .. }) if path == "bad.test.js"
        ));
    }

    #[test]
    fn test_glob_source_reports_bad_pattern() {
        let temp_dir = TempDir::new().unwrap();
        let patterns = vec!["[".to_string()];
        let results: Vec<_> = GlobFileSource::new(temp_dir.path(), &patterns).collect();
        assert!(matches!(results[0], Err(DiscoveryError::Pattern { .. })));
    }
}
