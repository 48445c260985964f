//! Static analysis of test file contents.
//!
//! The [`StaticAnalyzer`] turns a file's text into structural metrics
//! without executing anything. All framework knowledge lives in the
//! [`AnalyzerConfig`] patterns; the analyzer compiles them once and is
//! otherwise framework-agnostic.
//!
//! # Example
//!
//! ```
//! use shardsmith::config::AnalyzerConfig;
//! use shardsmith::discovery::StaticAnalyzer;
//!
//! let analyzer = StaticAnalyzer::new(&AnalyzerConfig::default()).unwrap();
//! let analysis = analyzer
//!     .analyze("math.test.js", "import { add } from './math';\ntest('adds', () => {});\n")
//!     .unwrap();
//!
//! assert_eq!(analysis.test_count, 1);
//! assert!(analysis.dependencies.contains("./math"));
//! ```

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde::Serialize;

use super::DiscoveryError;
use crate::config::{AnalyzerConfig, ConfigError};

/// Structural metrics of one test file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    /// Number of test-declaration markers found.
    pub test_count: usize,

    /// Weighted sum of indicator matches plus the per-line base term.
    pub complexity_score: f64,

    /// Imported module identifiers, deduplicated.
    pub dependencies: BTreeSet<String>,

    /// Raw match count per indicator category.
    pub indicator_counts: BTreeMap<String, usize>,
}

struct Indicator {
    name: String,
    pattern: Regex,
    weight: f64,
}

/// Compiled analyzer. Construct once per run and share by reference.
pub struct StaticAnalyzer {
    test_markers: Vec<Regex>,
    dependency_patterns: Vec<Regex>,
    indicators: Vec<Indicator>,
    line_weight: f64,
}

impl StaticAnalyzer {
    /// Compiles every pattern in the configuration.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidConfiguration`] if a pattern does not compile
    /// or a weight is negative.
    pub fn new(config: &AnalyzerConfig) -> Result<Self, ConfigError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| {
                ConfigError::InvalidConfiguration(format!(
                    "invalid analyzer pattern '{}': {}",
                    pattern, e
                ))
            })
        };

        let test_markers = config
            .test_markers
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>, _>>()?;
        let dependency_patterns = config
            .dependency_patterns
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>, _>>()?;

        let mut indicators = Vec::with_capacity(config.indicators.len());
        for (name, indicator) in &config.indicators {
            if !(indicator.weight.is_finite() && indicator.weight >= 0.0) {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "weight for indicator '{}' must be non-negative, got {}",
                    name, indicator.weight
                )));
            }
            indicators.push(Indicator {
                name: name.clone(),
                pattern: compile(&indicator.pattern)?,
                weight: indicator.weight,
            });
        }

        Ok(Self {
            test_markers,
            dependency_patterns,
            indicators,
            line_weight: config.line_weight.max(0.0),
        })
    }

    /// Analyzes one file.
    ///
    /// Deterministic for identical input and performs no I/O.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::Unparseable`] if the content looks binary (contains
    /// NUL bytes); the caller skips the file.
    pub fn analyze(&self, path: &str, content: &str) -> Result<Analysis, DiscoveryError> {
        if content.contains('\0') {
            return Err(DiscoveryError::Unparseable {
                path: path.to_string(),
                reason: "content contains NUL bytes".to_string(),
            });
        }

        let test_count = self
            .test_markers
            .iter()
            .map(|marker| marker.find_iter(content).count())
            .sum();

        let non_empty_lines = content.lines().filter(|l| !l.trim().is_empty()).count();
        let mut complexity_score = self.line_weight * non_empty_lines as f64;
        let mut indicator_counts = BTreeMap::new();
        for indicator in &self.indicators {
            let count = indicator.pattern.find_iter(content).count();
            complexity_score += count as f64 * indicator.weight;
            indicator_counts.insert(indicator.name.clone(), count);
        }

        let dependencies = self
            .dependency_patterns
            .iter()
            .flat_map(|pattern| pattern.captures_iter(content))
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .collect();

        Ok(Analysis {
            test_count,
            complexity_score,
            dependencies,
            indicator_counts,
        })
    }
}
