//! Cadence: run shell commands on a schedule
//!
//! Main binary with subcommands:
//! - `run`: Schedule every job in a job file until Ctrl-C
//! - `check`: Validate a job file and print what would be scheduled

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadence::jobs::JobFile;
use cadence::runner::{self, RunOptions};

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Run shell commands on a schedule", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run {
        /// JSON job file
        #[arg(long, env = "CADENCE_JOBS")]
        jobs: PathBuf,

        /// Append execution records to this JSON-lines file
        #[arg(long, env = "CADENCE_REPORT")]
        report: Option<PathBuf>,

        /// JSON scheduler config (worker count, timeouts, retry curve)
        #[arg(long, env = "CADENCE_CONFIG")]
        config: Option<PathBuf>,

        /// Worker pool size
        #[arg(long, env = "CADENCE_WORKERS")]
        workers: Option<usize>,

        /// Delay before a job skipped for a busy key is retried, in milliseconds
        #[arg(long)]
        skip_retry_ms: Option<u64>,
    },

    /// Validate a job file without running anything
    Check {
        /// JSON job file
        #[arg(long, env = "CADENCE_JOBS")]
        jobs: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "cadence=info,cadence_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            jobs,
            report,
            config,
            workers,
            skip_retry_ms,
        } => {
            let opts = RunOptions {
                jobs,
                report,
                config,
                workers,
                skip_retry_ms,
            };
            runner::run(&opts, async {
                tokio::signal::ctrl_c().await.ok();
                info!("received shutdown signal");
            })
            .await
        }

        Commands::Check { jobs } => {
            let file = JobFile::load(&jobs).map_err(|e| miette::miette!("{}", e))?;
            for job in &file.jobs {
                let when = match job.interval_secs {
                    Some(secs) => format!("every {secs}s"),
                    None => "once".to_string(),
                };
                println!("{:<24} {:<12} {} {}", job.key, when, job.command, job.args.join(" "));
            }
            println!("{} job(s) OK", file.len());
            Ok(())
        }
    }
}
