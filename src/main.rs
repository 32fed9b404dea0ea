//! media-relay CLI - main entry point

use clap::{Args, Parser, Subcommand};
use media_relay::logging::{LogConfig, LogFormat, LogLevel, init_logging};
use media_relay::upload::destination_from_config;
use media_relay::{Config, Manifest, Pipeline, ScratchDir, cancel_on_signal};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tracing::{error, info};

/// Exit code when configuration, manifest or startup fails
const EXIT_SETUP_ERROR: i32 = 2;

/// Fetch remote media, process it and upload the results
#[derive(Debug, Parser)]
#[command(name = "media-relay", version, about)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); overrides LOG_LEVEL
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format (text, json); overrides LOG_FORMAT
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Process every entry of a manifest
    Run(RunArgs),

    /// Remove orphaned files from the scratch directory
    Sweep {
        /// Configuration file (.toml or .json)
        #[arg(long, env = "MEDIA_RELAY_CONFIG")]
        config: Option<PathBuf>,

        /// Scratch directory
        #[arg(long)]
        scratch_dir: Option<PathBuf>,
    },

    /// Verify the destination is reachable with the configured credentials
    Check {
        /// Configuration file (.toml or .json)
        #[arg(long, env = "MEDIA_RELAY_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Manifest file (.json or .csv)
    #[arg(long)]
    manifest: PathBuf,

    /// Configuration file (.toml or .json)
    #[arg(long, env = "MEDIA_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Items processed concurrently
    #[arg(long)]
    workers: Option<usize>,

    /// Concurrent fetches
    #[arg(long)]
    fetch_concurrency: Option<usize>,

    /// Concurrent processing jobs
    #[arg(long)]
    process_concurrency: Option<usize>,

    /// Concurrent uploads
    #[arg(long)]
    upload_concurrency: Option<usize>,

    /// Processing timeout per item, in seconds
    #[arg(long, value_name = "SECS")]
    process_timeout: Option<u64>,

    /// Fetch timeout per attempt, in seconds
    #[arg(long, value_name = "SECS")]
    fetch_timeout: Option<u64>,

    /// Scratch directory
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Write the JSON run report to this path
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(n) = self.workers {
            config.concurrency.workers = n;
        }
        if let Some(n) = self.fetch_concurrency {
            config.concurrency.fetch = n;
        }
        if let Some(n) = self.process_concurrency {
            config.concurrency.process = n;
        }
        if let Some(n) = self.upload_concurrency {
            config.concurrency.upload = n;
        }
        if let Some(secs) = self.process_timeout {
            config.processing.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.fetch_timeout {
            config.fetch.timeout = Duration::from_secs(secs);
        }
        if let Some(dir) = &self.scratch_dir {
            config.scratch.dir = dir.clone();
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // .env is optional
    dotenvy::dotenv().ok();

    let mut log_config = match LogConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(EXIT_SETUP_ERROR);
        }
    };
    if let Some(level) = cli.log_level {
        log_config.level = level;
    }
    if let Some(format) = cli.log_format {
        log_config.format = format;
    }
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Error: {e}");
        process::exit(EXIT_SETUP_ERROR);
    }

    let code = match execute(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("Error: {e}");
            EXIT_SETUP_ERROR
        }
    };
    process::exit(code);
}

fn load_config(path: Option<&Path>) -> media_relay::Result<Config> {
    let config = Config::load(path)?;
    info!(config = ?path, "configuration loaded");
    Ok(config)
}

/// Run a subcommand; `Err` means a setup failure (exit 2)
async fn execute(command: Command) -> media_relay::Result<i32> {
    match command {
        Command::Run(args) => run(args).await,
        Command::Sweep {
            config,
            scratch_dir,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(dir) = scratch_dir {
                config.scratch.dir = dir;
            }
            let scratch = ScratchDir::open(&config.scratch.dir).await?;
            let stats = scratch.sweep().await?;
            println!(
                "removed {} file(s), {} bytes reclaimed from {}",
                stats.files_removed,
                stats.bytes_reclaimed,
                scratch.path().display()
            );
            Ok(0)
        }
        Command::Check { config } => {
            let config = load_config(config.as_deref())?;
            config.validate()?;
            let destination = destination_from_config(&config).await?;
            match destination.check_access().await {
                Ok(()) => {
                    println!("{} destination reachable", destination.name());
                    Ok(0)
                }
                Err(e) => {
                    error!(error = %e, kind = ?e.kind(), "destination check failed");
                    println!("{} destination check failed: {e}", destination.name());
                    Ok(1)
                }
            }
        }
    }
}

async fn run(args: RunArgs) -> media_relay::Result<i32> {
    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    let items = Manifest::load(&args.manifest)?.into_work_items(&config.processing)?;
    info!(manifest = ?args.manifest, items = items.len(), "manifest loaded");

    let pipeline = Pipeline::from_config(&config).await?;
    let signals = tokio::spawn(cancel_on_signal(pipeline.cancellation_token()));

    let report = pipeline.run(items).await;
    signals.abort();

    let mut code = report.exit_code();
    if let Some(path) = &args.report {
        match report.write_json(path) {
            Ok(()) => info!(path = ?path, "report written"),
            Err(e) => {
                error!(path = ?path, error = %e, "failed to write report");
                code = code.max(1);
            }
        }
    }

    print!("{report}");
    Ok(code)
}
