//! Chromoplex pipeline entry point.
//!
//! `chromoplex run <config.json>` drives the A/M pipeline to termination.
//! `chromoplex worker` is invoked by the batch controller on remote nodes
//! to execute one serialized batch of tasks.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use chromoplex_common::Error;
use chromoplex_config::Config;
use chromoplex_parallel::{run_batch_index, BatchPayload};
use chromoplex_steps::registry::lookup_task;

/// Exit status for a run that exhausted its iteration budget without
/// converging; distinct from generic failures for supervising scripts.
const EXIT_NO_CONVERGENCE: u8 = 3;

const PID_FILE: &str = ".chromoplex-pid.txt";

#[derive(Parser)]
#[command(name = "chromoplex")]
#[command(about = "Population-based 3D genome structure optimization", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline from a configuration file until termination.
    Run {
        /// Path to the JSON configuration file
        config: PathBuf,
        /// Ignore prior step records and recompute everything
        #[arg(long)]
        clean_restart: bool,
    },
    /// Execute one batch of a parallel map (invoked by the batch
    /// scheduler's job scripts).
    Worker {
        /// Path to the serialized batch payload
        #[arg(long)]
        payload: PathBuf,
        /// Batch index within the payload
        #[arg(long)]
        index: usize,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

struct PidSentinel {
    path: PathBuf,
}

impl PidSentinel {
    fn write(workdir: &std::path::Path) -> std::io::Result<Self> {
        let path = workdir.join(PID_FILE);
        std::fs::create_dir_all(workdir)?;
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(Self { path })
    }
}

impl Drop for PidSentinel {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn run_pipeline(config_path: PathBuf, clean_restart: bool) -> Result<(), Error> {
    let mut cfg = Config::load(&config_path)?;
    if clean_restart {
        cfg.optimization.clean_restart = true;
        if cfg.parameters.step_db.is_file() {
            std::fs::remove_file(&cfg.parameters.step_db)?;
        }
    }
    info!(config = %config_path.display(), "starting pipeline");

    let _pid = PidSentinel::write(&cfg.parameters.workdir)?;
    chromoplex_steps::pipeline::run(cfg).await
}

fn run_worker(payload_path: PathBuf, index: usize) -> Result<(), Error> {
    let text = std::fs::read(&payload_path)?;
    let payload: BatchPayload = serde_json::from_slice(&text)?;
    let func = lookup_task(&payload.task_key)
        .ok_or_else(|| Error::Config(format!("unknown task key '{}'", payload.task_key)))?;
    run_batch_index(&payload, index, func)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Command::Run { config, clean_restart } => run_pipeline(config, clean_restart).await,
        Command::Worker { payload, index } => run_worker(payload, index),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Convergence { iterations, score }) => {
            error!(iterations, score, "did not converge");
            ExitCode::from(EXIT_NO_CONVERGENCE)
        }
        Err(e) => {
            error!("fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}
