//! Concurrent shard execution.
//!
//! The [`ParallelExecutor`] drives one future per shard and joins them all.
//! Each shard races three things:
//!
//! ```text
//!            ┌─ cancellation token ──► Aborted (elapsed)
//!  shard ────┼─ global deadline ─────► Aborted (elapsed)
//!            └─ per-shard timeout ───► TimedOut (timeout value)
//!                   └─ runner ───────► Passed | Failed | Crashed
//! ```
//!
//! Losing a race drops the runner future, which is how a runner's child
//! process gets killed. A runner that panics is recorded as `Crashed`. A
//! shard never affects another shard's outcome.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::partitioner::ShardAssignment;
use crate::runner::{RunOutput, TestRunner};

/// Outcome of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    /// Runner exited zero.
    Passed,
    /// Runner exited non-zero.
    Failed,
    /// Per-shard timeout expired.
    TimedOut,
    /// Stopped by the global timeout or cancellation.
    Aborted,
    /// Runner could not be driven.
    Crashed,
    /// No units assigned; nothing ran.
    Skipped,
}

impl ShardStatus {
    pub fn is_passed(self) -> bool {
        self == ShardStatus::Passed
    }

    /// Whether the shard counts toward run-level statistics.
    pub fn was_executed(self) -> bool {
        self != ShardStatus::Skipped
    }

    /// Whether the runner finished and reported an outcome for its units.
    pub fn has_unit_outcome(self) -> bool {
        matches!(
            self,
            ShardStatus::Passed | ShardStatus::Failed | ShardStatus::Crashed
        )
    }
}

impl std::fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShardStatus::Passed => "passed",
            ShardStatus::Failed => "failed",
            ShardStatus::TimedOut => "timed out",
            ShardStatus::Aborted => "aborted",
            ShardStatus::Crashed => "crashed",
            ShardStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Everything recorded about one shard's execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardResult {
    pub shard_id: usize,
    pub status: ShardStatus,

    /// Seconds. The timeout value for timed-out shards, the elapsed time at
    /// abort for aborted ones.
    pub duration: f64,

    /// `None` unless the runner reported one.
    pub exit_code: Option<i32>,

    pub stdout_ref: Option<String>,
    pub stderr_ref: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_durations: Option<BTreeMap<String, f64>>,

    /// Human-readable reason for a non-passing shard.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ShardResult {
    fn bare(shard_id: usize, status: ShardStatus, duration: f64, error: Option<String>) -> Self {
        Self {
            shard_id,
            status,
            duration,
            exit_code: None,
            stdout_ref: None,
            stderr_ref: None,
            unit_durations: None,
            error,
        }
    }

    fn from_output(shard_id: usize, output: RunOutput) -> Self {
        let status = if output.success() {
            ShardStatus::Passed
        } else {
            ShardStatus::Failed
        };
        let error = (!output.success()).then(|| format!("exit code {}", output.exit_code));
        Self {
            shard_id,
            status,
            duration: output.duration.max(0.0),
            exit_code: Some(output.exit_code),
            stdout_ref: output.stdout_ref,
            stderr_ref: output.stderr_ref,
            unit_durations: output.unit_durations,
            error,
        }
    }
}

/// Called as each shard finishes, from the executing task.
pub type ShardCallback = Arc<dyn Fn(&ShardResult) + Send + Sync>;

/// Runs shards concurrently, one future per shard.
pub struct ParallelExecutor {
    per_shard_timeout: Duration,
    global_timeout: Option<Duration>,
    cancellation_token: CancellationToken,
    on_shard_complete: Option<ShardCallback>,
}

impl ParallelExecutor {
    pub fn new(per_shard_timeout: Duration) -> Self {
        Self {
            per_shard_timeout,
            global_timeout: None,
            cancellation_token: CancellationToken::new(),
            on_shard_complete: None,
        }
    }

    /// Aborts every still-running shard once the run has taken this long.
    pub fn with_global_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.global_timeout = timeout;
        self
    }

    /// Cancelling the token aborts every still-running shard.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn with_shard_callback(mut self, callback: ShardCallback) -> Self {
        self.on_shard_complete = Some(callback);
        self
    }

    /// Runs every shard and waits for all of them.
    ///
    /// At most `shards.len()` runner calls are in flight. Failures of any
    /// kind are captured in the returned map, which has one entry per
    /// shard id.
    pub async fn execute<R>(
        &self,
        shards: &[ShardAssignment],
        runner: &R,
    ) -> BTreeMap<usize, ShardResult>
    where
        R: TestRunner + ?Sized,
    {
        let start = Instant::now();
        // A deadline past the clock's range is no deadline at all.
        let deadline = self.global_timeout.and_then(|t| start.checked_add(t));

        info!(
            "Executing {} shards (timeout {:?} per shard)",
            shards.len(),
            self.per_shard_timeout
        );

        let futures = shards
            .iter()
            .map(|shard| self.run_one(shard, runner, start, deadline));
        let results = join_all(futures).await;

        results.into_iter().map(|r| (r.shard_id, r)).collect()
    }

    async fn run_one<R>(
        &self,
        shard: &ShardAssignment,
        runner: &R,
        start: Instant,
        deadline: Option<Instant>,
    ) -> ShardResult
    where
        R: TestRunner + ?Sized,
    {
        let result = if shard.is_empty() {
            ShardResult::bare(shard.id, ShardStatus::Skipped, 0.0, None)
        } else {
            self.race(shard, runner, start, deadline).await
        };

        match result.status {
            ShardStatus::Passed | ShardStatus::Skipped => {}
            _ => warn!(
                "Shard {} {}: {}",
                result.shard_id,
                result.status,
                result.error.as_deref().unwrap_or("")
            ),
        }
        if let Some(callback) = &self.on_shard_complete {
            callback(&result);
        }
        result
    }

    async fn race<R>(
        &self,
        shard: &ShardAssignment,
        runner: &R,
        start: Instant,
        deadline: Option<Instant>,
    ) -> ShardResult
    where
        R: TestRunner + ?Sized,
    {
        let global = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        let run = tokio::time::timeout(
            self.per_shard_timeout,
            AssertUnwindSafe(runner.run_shard(shard.id, &shard.units)).catch_unwind(),
        );

        tokio::select! {
            biased;

            _ = self.cancellation_token.cancelled() => ShardResult::bare(
                shard.id,
                ShardStatus::Aborted,
                start.elapsed().as_secs_f64(),
                Some("run cancelled".to_string()),
            ),
            outcome = run => match outcome {
                Ok(Ok(Ok(output))) => ShardResult::from_output(shard.id, output),
                Ok(Ok(Err(e))) => ShardResult::bare(
                    shard.id,
                    ShardStatus::Crashed,
                    start.elapsed().as_secs_f64(),
                    Some(e.to_string()),
                ),
                Ok(Err(panic)) => ShardResult::bare(
                    shard.id,
                    ShardStatus::Crashed,
                    start.elapsed().as_secs_f64(),
                    Some(format!("runner panicked: {}", panic_message(panic.as_ref()))),
                ),
                Err(_) => ShardResult::bare(
                    shard.id,
                    ShardStatus::TimedOut,
                    self.per_shard_timeout.as_secs_f64(),
                    Some(format!("exceeded {:?}", self.per_shard_timeout)),
                ),
            },
            _ = global => ShardResult::bare(
                shard.id,
                ShardStatus::Aborted,
                start.elapsed().as_secs_f64(),
                Some("global timeout reached".to_string()),
            ),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
