//! Test-runner boundary.
//!
//! A [`TestRunner`] runs one shard's file list through an external test
//! framework and reports how it went. How the framework is invoked is the
//! runner's business; the executor only sees the [`RunOutput`].
//!
//! [`CommandRunner`] is the stock implementation: it spawns a configured
//! command line, substitutes the shard's files for the `{files}`
//! placeholder and writes the child's output to per-shard log files.
//!
//! ```text
//! runner.command = "npx jest --ci {files}"
//!
//! shard 2, files [a.test.js, b.test.js]
//!   └─► npx jest --ci a.test.js b.test.js
//!         stdout ─► <log_dir>/shard-2.stdout.log
//!         stderr ─► <log_dir>/shard-2.stderr.log
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{ConfigError, RunnerConfig};

/// Placeholder replaced by the shard's file list.
pub const FILES_PLACEHOLDER: &str = "{files}";

/// Placeholder replaced by the shard id.
pub const SHARD_PLACEHOLDER: &str = "{shard}";

/// Errors raised when the external runner cannot be driven at all.
///
/// A runner that starts and exits non-zero is not an error; that is a
/// [`RunOutput`] with a non-zero exit code.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to prepare log file {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Runner failed: {0}")]
    Failed(String),
}

/// What the external runner reported for one shard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    pub exit_code: i32,

    /// Wall-clock seconds as measured by the runner.
    pub duration: f64,

    /// Where the shard's stdout can be found.
    pub stdout_ref: Option<String>,

    /// Where the shard's stderr can be found.
    pub stderr_ref: Option<String>,

    /// Measured per-unit seconds, when the runner can attribute them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_durations: Option<BTreeMap<String, f64>>,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs the files of one shard.
///
/// Implementations must be safe to call concurrently for different shards.
/// The executor may drop the returned future at any time (timeout or
/// abort); implementations should release their resources on drop.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_shard(&self, shard_id: usize, paths: &[String]) -> Result<RunOutput, RunnerError>;
}

#[async_trait]
impl<'a, T> TestRunner for &'a T
where
    T: TestRunner + ?Sized,
{
    async fn run_shard(&self, shard_id: usize, paths: &[String]) -> Result<RunOutput, RunnerError> {
        (**self).run_shard(shard_id, paths).await
    }
}

/// Runs shards by spawning a command line.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    argv: Vec<String>,
    working_dir: Option<PathBuf>,
    env: HashMap<String, String>,
    log_dir: PathBuf,
}

impl CommandRunner {
    /// Parses the configured command template.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidConfiguration`] if the command is empty or has
    /// unbalanced quotes.
    pub fn new(config: &RunnerConfig) -> Result<Self, ConfigError> {
        let argv = shell_words::split(&config.command).map_err(|e| {
            ConfigError::InvalidConfiguration(format!("runner.command cannot be parsed: {}", e))
        })?;
        if argv.is_empty() {
            return Err(ConfigError::InvalidConfiguration(
                "runner.command must not be empty".to_string(),
            ));
        }

        Ok(Self {
            argv,
            working_dir: config.working_dir.clone(),
            env: config.env.clone(),
            log_dir: config.log_dir.clone(),
        })
    }

    /// Expands the template for one shard.
    ///
    /// A bare `{files}` argument becomes one argument per file; `{files}`
    /// inside a larger argument (typically a `sh -c` script) is replaced by
    /// the shell-quoted, space-joined list. With no placeholder the files
    /// are appended.
    pub fn command_line(&self, shard_id: usize, paths: &[String]) -> Vec<String> {
        let shard = shard_id.to_string();
        let mut args = Vec::with_capacity(self.argv.len() + paths.len());
        let mut substituted = false;

        for arg in &self.argv {
            if arg == FILES_PLACEHOLDER {
                args.extend(paths.iter().cloned());
                substituted = true;
            } else if arg.contains(FILES_PLACEHOLDER) {
                args.push(
                    arg.replace(FILES_PLACEHOLDER, &shell_words::join(paths))
                        .replace(SHARD_PLACEHOLDER, &shard),
                );
                substituted = true;
            } else {
                args.push(arg.replace(SHARD_PLACEHOLDER, &shard));
            }
        }

        if !substituted {
            args.extend(paths.iter().cloned());
        }
        args
    }

    fn log_file(
        &self,
        shard_id: usize,
        stream: &str,
    ) -> Result<(PathBuf, std::fs::File), RunnerError> {
        let path = self.log_dir.join(format!("shard-{}.{}.log", shard_id, stream));
        let file = std::fs::File::create(&path).map_err(|source| RunnerError::Log {
            path: path.clone(),
            source,
        })?;
        Ok((path, file))
    }
}

#[async_trait]
impl TestRunner for CommandRunner {
    async fn run_shard(&self, shard_id: usize, paths: &[String]) -> Result<RunOutput, RunnerError> {
        let args = self.command_line(shard_id, paths);
        let Some((program, rest)) = args.split_first() else {
            return Err(RunnerError::Failed(format!(
                "empty command line for shard {}",
                shard_id
            )));
        };

        std::fs::create_dir_all(&self.log_dir).map_err(|source| RunnerError::Log {
            path: self.log_dir.clone(),
            source,
        })?;
        let (stdout_path, stdout_file) = self.log_file(shard_id, "stdout")?;
        let (stderr_path, stderr_file) = self.log_file(shard_id, "stderr")?;

        debug!("Shard {}: running {:?}", shard_id, args);

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(rest)
            .envs(&self.env)
            .env("SHARDSMITH_SHARD_ID", shard_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let start = std::time::Instant::now();
        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            command: program.clone(),
            source,
        })?;
        let status = child.wait().await.map_err(|e| {
            RunnerError::Failed(format!("failed to wait for shard {}: {}", shard_id, e))
        })?;
        let duration = start.elapsed().as_secs_f64();

        let exit_code = status.code().unwrap_or_else(|| {
            warn!("Shard {} terminated by signal", shard_id);
            -1
        });

        Ok(RunOutput {
            exit_code,
            duration,
            stdout_ref: Some(stdout_path.to_string_lossy().into_owned()),
            stderr_ref: Some(stderr_path.to_string_lossy().into_owned()),
            unit_durations: None,
        })
    }
}
