//! shardsmith: adaptive test-shard scheduling.
//!
//! Splits a test suite into a fixed number of shards whose predicted
//! durations are as even as possible, runs the shards in parallel and
//! learns from the outcome so the next split is better.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Discovery**: Find test files, analyze them statically and estimate
//!   their duration ([`discovery`])
//! - **History**: Rolling per-unit and per-run windows ([`history`])
//! - **Orchestrator**: Partition, execute, track accuracy ([`orchestrator`])
//! - **Runner**: The boundary to the external test framework ([`runner`])
//! - **Report**: Summary, recommendations and trend ([`report`])
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
//!     let store = JsonFileStore::new(
//!         &config.history.path,
//!         config.history.per_unit_cap,
//!         config.history.per_run_cap,
//!     );
//!     let runner = CommandRunner::new(&config.runner)?;
//!     let source = file_source(&config);
//!
//!     let report = Orchestrator::new(config, runner, store)?.run(source).await;
//!     println!("makespan: {:.1}s", report.summary.total_duration);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod history;
pub mod orchestrator;
pub mod report;
pub mod runner;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use discovery::{Discoverer, TestUnit};
pub use history::{HistorySnapshot, HistoryStore, JsonFileStore};
pub use orchestrator::{Orchestrator, Plan, ShardAssignment, ShardResult, ShardStatus};
pub use report::{OptimizationReport, ReportGenerator};
pub use runner::{CommandRunner, RunOutput, TestRunner};
