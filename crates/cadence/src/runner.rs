//! The `run` command: load jobs, schedule them, wait for shutdown.

use std::fs::OpenOptions;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tracing::info;

use cadence_scheduler::{
    ExecutionReport, JsonLinesReport, LogReport, Scheduler, SchedulerConfig, Tee,
};

use crate::jobs::JobFile;

/// Everything the `run` command needs.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// JSON job file.
    pub jobs: PathBuf,
    /// JSON-lines file execution records are appended to.
    pub report: Option<PathBuf>,
    /// JSON scheduler config; flags below override it.
    pub config: Option<PathBuf>,
    pub workers: Option<usize>,
    pub skip_retry_ms: Option<u64>,
}

impl RunOptions {
    /// Resolve the scheduler config from file, flags and defaults.
    pub fn scheduler_config(&self) -> Result<SchedulerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| miette::miette!("failed to read {}: {}", path.display(), e))?;
                serde_json::from_str(&raw)
                    .map_err(|e| miette::miette!("failed to parse {}: {}", path.display(), e))?
            }
            None => SchedulerConfig::default(),
        };

        if let Some(workers) = self.workers {
            config.max_workers = workers;
        }
        if let Some(ms) = self.skip_retry_ms {
            config.skip_retry_interval = Duration::from_millis(ms);
        }

        config
            .validate()
            .map_err(|e| miette::miette!("invalid scheduler config: {}", e))?;
        Ok(config)
    }

    fn report_sink(&self) -> Result<Arc<dyn ExecutionReport>> {
        let Some(path) = &self.report else {
            return Ok(Arc::new(LogReport));
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| miette::miette!("failed to open report {}: {}", path.display(), e))?;

        let tee = Tee::new()
            .with(Arc::new(JsonLinesReport::new(file)))
            .with(Arc::new(LogReport));
        Ok(Arc::new(tee))
    }
}

/// Build a scheduler with every job from the job file registered.
pub async fn prepare(opts: &RunOptions) -> Result<Scheduler> {
    let config = opts.scheduler_config()?;
    let jobs = JobFile::load(&opts.jobs).map_err(|e| miette::miette!("{}", e))?;
    let scheduler = Scheduler::new(config, opts.report_sink()?)
        .map_err(|e| miette::miette!("{}", e))?;

    for job in &jobs.jobs {
        scheduler
            .register(job.to_spec())
            .await
            .map_err(|e| miette::miette!("failed to register {}: {}", job.key, e))?;
    }

    info!(jobs = jobs.len(), path = %opts.jobs.display(), "loaded job file");
    Ok(scheduler)
}

/// Run until `shutdown` resolves.
pub async fn run(opts: &RunOptions, shutdown: impl Future<Output = ()>) -> Result<()> {
    let scheduler = prepare(opts).await?;
    scheduler
        .start()
        .map_err(|e| miette::miette!("{}", e))?;

    shutdown.await;
    info!(running = scheduler.running_len(), "stopping scheduler");
    scheduler.stop().await;
    Ok(())
}
