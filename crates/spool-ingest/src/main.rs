//! Spool Ingest - watch-folder record processor

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use spool_common::logging::{init_logging, LogConfig, LogLevel};
use spool_ingest::config::SpoolConfig;
use spool_ingest::orchestrator::JobState;
use spool_ingest::repository::{FileJobRepository, InMemoryJobRepository, JobRepository};
use spool_ingest::service::SpoolService;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "spool-ingest")]
#[command(author, version, about = "Watch a directory and process delimited record files")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the input directory and process files until interrupted
    Watch {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Process a single file now
    Run {
        /// File to process
        file: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Print the recorded job history
    History {
        /// Job history file (defaults to SPOOL_JOB_HISTORY)
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

/// Command-line values taking precedence over `SPOOL_*` variables
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Watched directory
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Output directory
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Archive directory for processed inputs
    #[arg(long)]
    processed_dir: Option<PathBuf>,

    /// Records per committed chunk
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Concurrent jobs
    #[arg(long)]
    workers: Option<usize>,

    /// JSON-lines job history file
    #[arg(long)]
    history: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, mut config: SpoolConfig) -> Result<SpoolConfig> {
        if let Some(dir) = self.input_dir {
            config.input_dir = dir;
        }
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if let Some(dir) = self.processed_dir {
            config.processed_dir = dir;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(history) = self.history {
            config.job_history = Some(history);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("spool-ingest")
        .build()
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    match cli.command {
        Command::Watch { overrides } => {
            let config = overrides.apply(SpoolConfig::from_env()?)?;
            let service = SpoolService::from_config(&config, open_repository(&config).await?)?;

            let cancel = CancellationToken::new();
            tokio::spawn(shutdown_signal(cancel.clone()));

            service.run(cancel).await?;
        },
        Command::Run { file, overrides } => {
            let config = overrides.apply(SpoolConfig::from_env()?)?;
            let service = SpoolService::from_config(&config, open_repository(&config).await?)?;

            let execution = service.run_file(&file).await?;
            if execution.state() != JobState::Completed {
                match execution.error {
                    Some(e) => return Err(e).context(format!("Job for {} failed", file.display())),
                    None => anyhow::bail!("Job for {} failed", file.display()),
                }
            }
            info!(output = %execution.descriptor.output_path.display(), "Done");
        },
        Command::History { path } => {
            let path = match path {
                Some(path) => path,
                None => SpoolConfig::from_env()?
                    .job_history
                    .context("No job history configured; set SPOOL_JOB_HISTORY or pass --path")?,
            };
            let repository = FileJobRepository::open(&path).await?;

            for record in repository.records().await {
                println!(
                    "{}\t{}\t{}",
                    record.key,
                    record.state,
                    record.recorded_at.to_rfc3339()
                );
            }
        },
    }

    Ok(())
}

async fn open_repository(config: &SpoolConfig) -> Result<Arc<dyn JobRepository>> {
    let repository: Arc<dyn JobRepository> = match &config.job_history {
        Some(path) => {
            info!(path = %path.display(), "Using file job history");
            Arc::new(FileJobRepository::open(path).await?)
        },
        None => Arc::new(InMemoryJobRepository::new()),
    };
    Ok(repository)
}

/// Cancel `token` on Ctrl+C or SIGTERM
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing running jobs");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing running jobs");
        },
    }

    token.cancel();
    warn!("Shutdown requested; no new files will be picked up");
}
