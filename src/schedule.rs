//! Recurring trigger for the pipeline.
//!
//! Uses a cron expression and an IANA time zone from `[schedule]`. Every
//! trigger calls [`trigger`], which runs the whole chain once. A trigger
//! that fires while the previous run is still going is skipped rather than
//! queued, since two concurrent enrichment passes would race on the same
//! candidates.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::ScheduleConfig;
use crate::pipeline::{Pipeline, PipelineError, RunSummary};

/// Run the pipeline once, logging the outcome. `None` if the trigger was skipped.
pub async fn trigger(pipeline: &Pipeline) -> Option<RunSummary> {
    if pipeline.is_cancelled() {
        info!("shutdown in progress, ignoring trigger");
        return None;
    }

    match pipeline.run_once().await {
        Ok(summary) => {
            for report in &summary.reports {
                info!(run_id = %summary.run_id, "{}", report.to_string().trim_end());
            }
            Some(summary)
        }
        Err(PipelineError::AlreadyRunning) => {
            warn!("previous pipeline run still in progress, skipping trigger");
            None
        }
        Err(e) => {
            error!(error = %e, "pipeline trigger failed");
            None
        }
    }
}

/// Start the scheduler and block until Ctrl-C.
///
/// On shutdown no new stage is started; an in-flight stage is allowed to
/// finish before the scheduler stops.
pub async fn run_scheduler(config: &ScheduleConfig, pipeline: Arc<Pipeline>) -> Result<()> {
    let tz = config.tz()?;
    let mut sched = JobScheduler::new().await.context("creating scheduler")?;

    let job_pipeline = pipeline.clone();
    let job = Job::new_async_tz(config.cron.as_str(), tz, move |_uuid, _lock| {
        let pipeline = job_pipeline.clone();
        Box::pin(async move {
            trigger(&pipeline).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.cron))?;

    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.cron, timezone = %config.timezone, "scheduler started");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("shutdown requested");
    pipeline.request_cancel();
    if pipeline.is_running() {
        info!("waiting for the in-flight run to stop");
    }
    pipeline.wait_idle().await;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}
