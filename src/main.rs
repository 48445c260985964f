//! shardsmith CLI - adaptive test-shard scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use shardsmith::config::{self, Config};
use shardsmith::history::{HistoryStore, JsonFileStore};
use shardsmith::orchestrator::{Orchestrator, ShardCallback, ShardResult, file_source};
use shardsmith::report::{self, ReportGenerator};
use shardsmith::runner::CommandRunner;

#[derive(Parser)]
#[command(name = "shardsmith")]
#[command(about = "Adaptive test-shard scheduler", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "shardsmith.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover, partition and run the test suite
    Run {
        /// Override the shard count
        #[arg(short, long)]
        shards: Option<i64>,

        /// Report output path
        #[arg(long)]
        report: Option<PathBuf>,

        /// Disable the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Show the shard plan without running anything
    Plan {
        /// Override the shard count
        #[arg(short, long)]
        shards: Option<i64>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Validate configuration file
    Validate,

    /// Show recorded run history
    History {
        /// Number of recent runs to show
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("SHARDSMITH_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("shardsmith={}", default_level)));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            shards,
            report,
            no_progress,
        } => run(&cli.config, shards, report, no_progress).await,
        Commands::Plan { shards, format } => plan(&cli.config, shards, format),
        Commands::Validate => validate_config(&cli.config),
        Commands::History { limit } => show_history(&cli.config, limit),
    }
}

fn load(config_path: &Path, shards_override: Option<i64>) -> Result<Config> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if let Some(shards) = shards_override {
        config.scheduler.shard_count = shards;
    }

    info!("Loaded configuration from {}", config_path.display());
    Ok(config)
}

fn history_store(config: &Config) -> JsonFileStore {
    JsonFileStore::new(
        &config.history.path,
        config.history.per_unit_cap,
        config.history.per_run_cap,
    )
}

fn progress_callback(shard_count: usize) -> Result<(indicatif::ProgressBar, ShardCallback)> {
    let pb = indicatif::ProgressBar::new(shard_count as u64);
    pb.set_style(
        indicatif::ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} shards",
        )?
        .progress_chars("#>-"),
    );

    let bar = pb.clone();
    let callback: ShardCallback = Arc::new(move |result: &ShardResult| {
        bar.inc(1);
        if !result.status.is_passed() && result.status.was_executed() {
            bar.println(format!(
                "{} shard {} ({:.1}s)",
                console::style(result.status.to_string().to_uppercase()).red(),
                result.shard_id,
                result.duration
            ));
        }
    });
    Ok((pb, callback))
}

async fn run(
    config_path: &Path,
    shards_override: Option<i64>,
    report_override: Option<PathBuf>,
    no_progress: bool,
) -> Result<()> {
    let config = load(config_path, shards_override)?;
    config.validate()?;

    let report_path = report_override.unwrap_or_else(|| config.report.output.clone());
    let runner = CommandRunner::new(&config.runner)?;
    let store = history_store(&config);
    let source = file_source(&config);

    let token = CancellationToken::new();
    let ctrl_c = {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, aborting outstanding shards");
                token.cancel();
            }
        })
    };

    let shard_count = config.shard_count();
    let mut orchestrator =
        Orchestrator::new(config, runner, store)?.with_cancellation_token(token);
    let progress = if no_progress {
        None
    } else {
        let (pb, callback) = progress_callback(shard_count)?;
        orchestrator = orchestrator.with_shard_callback(callback);
        Some(pb)
    };

    let report = orchestrator.run(source).await;
    ctrl_c.abort();
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    report::write_json(&report, &report_path)?;
    info!("Report written to {}", report_path.display());
    report::print_summary(&report);

    std::process::exit(report.exit_code());
}

fn plan(config_path: &Path, shards_override: Option<i64>, format: Format) -> Result<()> {
    let config = load(config_path, shards_override)?;
    let store = history_store(&config);
    let source = file_source(&config);

    // Nothing is executed, so the runner is never called.
    let runner = CommandRunner::new(&config.runner)?;
    let orchestrator = Orchestrator::new(config, runner, store)?;
    let plan = orchestrator.plan(source);

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
        Format::Text => report::print_plan(&plan),
    }
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = match config::load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Shards: {}", config.scheduler.shard_count);
    println!(
        "  Per-shard timeout: {}s",
        config.scheduler.per_shard_timeout_secs
    );
    match config.scheduler.global_timeout_secs {
        Some(secs) => println!("  Global timeout: {}s", secs),
        None => println!("  Global timeout: none"),
    }
    println!("  File patterns: {}", config.scheduler.file_patterns.join(", "));
    let indicators: Vec<&str> = config.analyzer.indicators.keys().map(String::as_str).collect();
    println!("  Indicators: {}", indicators.join(", "));
    println!("  Runner: {}", config.runner.command);
    println!("  History: {}", config.history.path.display());

    Ok(())
}

fn show_history(config_path: &Path, limit: usize) -> Result<()> {
    let config = load(config_path, None)?;
    let history = history_store(&config)
        .load()
        .with_context(|| format!("Failed to load history from {}", config.history.path.display()))?;

    println!(
        "History v{}: {} units, {} runs",
        history.version,
        history.units().count(),
        history.runs().len()
    );

    let runs = history.recent_runs(limit);
    if !runs.is_empty() {
        println!();
        for run in &runs {
            let accuracy = run.avg_accuracy.map_or_else(
                || "n/a".to_string(),
                |e| format!("{:.1}%", (1.0 - e).max(0.0) * 100.0),
            );
            println!(
                "  {}  {:>3} shards  makespan {:>8.2}s  accuracy {:>6}  success {:>5.1}%",
                run.timestamp.format("%Y-%m-%d %H:%M:%S"),
                run.shard_count,
                run.total_duration,
                accuracy,
                run.success_rate * 100.0
            );
        }
    }

    let trend = ReportGenerator::new(config.report.clone()).trend(&history);
    println!();
    println!("Trend: {:?} over {} runs", trend.trend, trend.runs_considered);

    Ok(())
}
