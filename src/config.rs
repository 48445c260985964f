//! Configuration loading and validation for shardsmith.
//!
//! This module provides types and functions for loading shardsmith
//! configuration from TOML files or strings, and for rejecting invalid
//! configurations before any discovery or execution happens.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;

/// Configuration-level errors.
///
/// These are the only errors that abort a whole run. Everything that goes
/// wrong with a single file or a single shard is captured in the report
/// instead.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A setting is out of range or cannot be compiled.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Loads shardsmith configuration from a TOML file.
///
/// Paths inside the configuration have `~` and environment variables
/// expanded. The result is not validated; call [`Config::validate`] before
/// using it for a run.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use shardsmith::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("shardsmith.toml"))?;
/// println!("Shards: {}", config.scheduler.shard_count);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = load_config_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads shardsmith configuration from a TOML string.
///
/// # Example
///
/// ```
/// use shardsmith::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [scheduler]
///     shard_count = 3
///     file_patterns = ["tests/*.test.js"]
/// "#)?;
///
/// assert_eq!(config.scheduler.shard_count, 3);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;

    config.history.path = expand_path(&config.history.path)?;
    config.runner.log_dir = expand_path(&config.runner.log_dir)?;
    config.report.output = expand_path(&config.report.output)?;
    if let Some(dir) = &config.scheduler.working_dir {
        config.scheduler.working_dir = Some(expand_path(dir)?);
    }
    if let Some(dir) = &config.runner.working_dir {
        config.runner.working_dir = Some(expand_path(dir)?);
    }

    Ok(config)
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("Failed to expand path: {}", raw))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

impl Config {
    /// Checks every rule that must hold before a run may start.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidConfiguration`] naming the first offending
    /// setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidConfiguration(msg));

        let scheduler = &self.scheduler;
        if scheduler.shard_count <= 0 {
            return invalid(format!(
                "scheduler.shard_count must be at least 1, got {}",
                scheduler.shard_count
            ));
        }
        if !is_timeout(scheduler.per_shard_timeout_secs) {
            return invalid(format!(
                "scheduler.per_shard_timeout_secs must be positive and at most {}, got {}",
                MAX_TIMEOUT_SECS, scheduler.per_shard_timeout_secs
            ));
        }
        if let Some(global) = scheduler.global_timeout_secs
            && !is_timeout(global)
        {
            return invalid(format!(
                "scheduler.global_timeout_secs must be positive and at most {}, got {}",
                MAX_TIMEOUT_SECS, global
            ));
        }
        if scheduler.file_patterns.is_empty() {
            return invalid("scheduler.file_patterns must not be empty".to_string());
        }
        for pattern in &scheduler.file_patterns {
            if let Err(e) = glob::Pattern::new(pattern) {
                return invalid(format!("invalid file pattern '{}': {}", pattern, e));
            }
        }

        let analyzer = &self.analyzer;
        for pattern in analyzer
            .test_markers
            .iter()
            .chain(&analyzer.dependency_patterns)
        {
            if let Err(e) = Regex::new(pattern) {
                return invalid(format!("invalid analyzer pattern '{}': {}", pattern, e));
            }
        }
        for (category, indicator) in &analyzer.indicators {
            if let Err(e) = Regex::new(&indicator.pattern) {
                return invalid(format!(
                    "invalid pattern for indicator '{}': {}",
                    category, e
                ));
            }
            if !(indicator.weight.is_finite() && indicator.weight >= 0.0) {
                return invalid(format!(
                    "weight for indicator '{}' must be non-negative, got {}",
                    category, indicator.weight
                ));
            }
        }
        if !(analyzer.line_weight.is_finite() && analyzer.line_weight >= 0.0) {
            return invalid(format!(
                "analyzer.line_weight must be non-negative, got {}",
                analyzer.line_weight
            ));
        }

        if !is_positive(self.estimator.min_duration_secs) {
            return invalid(format!(
                "estimator.min_duration_secs must be positive, got {}",
                self.estimator.min_duration_secs
            ));
        }
        if !is_positive(self.estimator.base_time_per_test_secs) {
            return invalid(format!(
                "estimator.base_time_per_test_secs must be positive, got {}",
                self.estimator.base_time_per_test_secs
            ));
        }

        if self.history.per_unit_cap == 0 || self.history.per_run_cap == 0 {
            return invalid("history window caps must be at least 1".to_string());
        }

        if self.runner.command.trim().is_empty() {
            return invalid("runner.command must not be empty".to_string());
        }
        if let Err(e) = shell_words::split(&self.runner.command) {
            return invalid(format!("runner.command cannot be parsed: {}", e));
        }

        if self.report.trend_window < 2 {
            return invalid(format!(
                "report.trend_window must be at least 2, got {}",
                self.report.trend_window
            ));
        }

        Ok(())
    }

    /// The validated shard count.
    ///
    /// Only meaningful after [`validate`](Self::validate) succeeded.
    pub fn shard_count(&self) -> usize {
        usize::try_from(self.scheduler.shard_count).unwrap_or(0)
    }
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn is_timeout(secs: f64) -> bool {
    is_positive(secs) && secs <= MAX_TIMEOUT_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = load_config_str("").unwrap();
        assert_eq!(config.scheduler.shard_count, 4);
        assert_eq!(config.history.per_unit_cap, 100);
        assert_eq!(config.history.per_run_cap, 50);
        assert_eq!(config.estimator.base_time_per_test_secs, 0.5);
        assert_eq!(config.analyzer.indicators.len(), 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_shards_rejected() {
        let config = load_config_str("[scheduler]\nshard_count = 0").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_negative_shards_rejected() {
        let config = load_config_str("[scheduler]\nshard_count = -3").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("shard_count"));
    }

    #[test]
    fn test_empty_file_patterns_rejected() {
        let config = load_config_str("[scheduler]\nfile_patterns = []").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_indicator_weight_rejected() {
        let config = load_config_str(
            r#"
            [analyzer.indicators.network]
            pattern = "fetch"
            weight = -1.0
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("network"));
    }

    #[test]
    fn test_bad_indicator_regex_rejected() {
        let config = load_config_str(
            r#"
            [analyzer.indicators.broken]
            pattern = "("
            weight = 1.0
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_positive_timeout_rejected() {
        let config = load_config_str("[scheduler]\nper_shard_timeout_secs = 0").unwrap();
        assert!(config.validate().is_err());

        let config = load_config_str("[scheduler]\nglobal_timeout_secs = -5.0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unrepresentable_timeouts_rejected() {
        let config = load_config_str("[scheduler]\nper_shard_timeout_secs = 1e20").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("per_shard_timeout_secs"));

        let config = load_config_str("[scheduler]\nglobal_timeout_secs = 1e19").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("global_timeout_secs"));

        let config = load_config_str(&format!(
            "[scheduler]\nper_shard_timeout_secs = {}",
            MAX_TIMEOUT_SECS
        ))
        .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_oversized_timeout_saturates_instead_of_zeroing() {
        let mut config = Config::default();
        config.scheduler.per_shard_timeout_secs = 1e20;
        config.scheduler.global_timeout_secs = Some(1e19);

        let max = std::time::Duration::from_secs_f64(MAX_TIMEOUT_SECS);
        assert_eq!(config.scheduler.per_shard_timeout(), max);
        assert_eq!(config.scheduler.global_timeout(), Some(max));
    }

    #[test]
    fn test_timeouts_as_durations() {
        let config = load_config_str(
            "[scheduler]\nper_shard_timeout_secs = 2.5\nglobal_timeout_secs = 10",
        )
        .unwrap();
        assert_eq!(
            config.scheduler.per_shard_timeout(),
            std::time::Duration::from_millis(2500)
        );
        assert_eq!(
            config.scheduler.global_timeout(),
            Some(std::time::Duration::from_secs(10))
        );
    }

    #[test]
    fn test_indicator_table_replaces_defaults() {
        let config = load_config_str(
            r#"
            [analyzer.indicators.io]
            pattern = "open\\("
            weight = 2.0
            "#,
        )
        .unwrap();
        assert_eq!(config.analyzer.indicators.len(), 1);
        assert_eq!(
            config.analyzer.indicators["io"],
            IndicatorConfig::new(r"open\(", 2.0)
        );
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config(Path::new("/nonexistent/shardsmith.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("shardsmith.toml");
        std::fs::write(&path, "[scheduler]\nshard_count = 6\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.shard_count(), 6);
    }
}
