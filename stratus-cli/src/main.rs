//! Stratus CLI: operator entry point and scheduler daemon for the ingestion pipeline.
//!
//! Runs yesterday's ingestion, backfills explicit dates, or keeps the scheduler alive
//! until interrupted.

mod commands;

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Stratus: scheduled, fault-isolated time-series ingestion
#[derive(Parser, Debug)]
#[command(name = "stratus", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "stratus.toml")]
    config: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors to stderr
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the pipeline once (defaults to yesterday, UTC)
    Run {
        /// Target date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<String>,
    },
    /// Re-process an explicit date or an inclusive date range
    Backfill {
        /// Single target date (YYYY-MM-DD)
        #[arg(long, conflicts_with_all = ["from", "to"], required_unless_present = "from")]
        date: Option<String>,
        /// First date of the range (YYYY-MM-DD)
        #[arg(long, requires = "to")]
        from: Option<String>,
        /// Last date of the range, inclusive (YYYY-MM-DD)
        #[arg(long, requires = "from")]
        to: Option<String>,
    },
    /// Start the scheduler and run until Ctrl-C
    Schedule,
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Load and validate the configuration, reporting every problem
    Validate,
    /// Print the fully resolved configuration as TOML
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Logging needs the configured log dir, so load before anything else and report
    // a load failure only once tracing is up.
    let loaded = stratus_core::load_config(&cli.config, None);
    let log_dir = loaded
        .as_ref()
        .ok()
        .and_then(|c| c.logging.log_dir.clone());
    let _guard = init_tracing(cli.verbose, cli.quiet, log_dir.as_deref());

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Configuration error");
            return Err(anyhow::anyhow!("Configuration error: {}", e));
        }
    };

    commands::handle_command(cli.command, config).await
}

/// Human-readable stderr plus daily-rotated JSON files.
fn init_tracing(
    verbose: u8,
    quiet: bool,
    log_dir: Option<&Path>,
) -> tracing_appender::non_blocking::WorkerGuard {
    let filter = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter(filter, std::env::var(EnvFilter::DEFAULT_ENV).ok()));

    let log_dir = log_dir.map(Path::to_path_buf).unwrap_or_else(|| {
        directories::ProjectDirs::from("dev", "stratus", "stratus")
            .map(|d| d.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("logs"))
    });
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "stratus.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    guard
}

/// `RUST_LOG` wins over the verbosity flags when it parses.
fn stderr_filter(default: &str, rust_log: Option<String>) -> EnvFilter {
    rust_log
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new(default))
}
