//! Job graph runner.
//!
//! A run is a fixed, linear chain of stages (ingest, then transform, then
//! enrich) executed one after the other:
//!
//! ```text
//! PENDING ─▶ RUNNING(ingest) ─▶ RUNNING(transform) ─▶ RUNNING(enrich) ─▶ SUCCEEDED
//!                 │                    │                     │
//!                 └────────────────────┴─────────────────────┴──▶ FAILED
//! ```
//!
//! The first stage error ends the run; later stages never start. There is no
//! resume: the next trigger starts again from the first stage, which is safe
//! because every stage is idempotent. Only one run may be active per
//! [`Pipeline`] at a time ([`PipelineError::AlreadyRunning`]), and a
//! cancellation request is honoured before the next stage starts, never in
//! the middle of one.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{Config, IngestConfig};
use crate::detect::{self, Detector};
use crate::enrich::{self, EnrichReport};
use crate::ingest::{self, IngestReport};
use crate::models::RunStatus;
use crate::resolve::ImageResolver;
use crate::store::Store;
use crate::transform::{self, ExternalStep, StepOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error("run cancelled before stage '{stage}'")]
    Cancelled { stage: String },

    #[error("a pipeline run is already in progress")]
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running(String),
    Succeeded,
    Failed(PipelineError),
}

/// Structured result of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageReport {
    Ingest { date: NaiveDate, report: IngestReport },
    Transform { step: String },
    Enrich(EnrichReport),
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageReport::Ingest { date, report } => {
                writeln!(f, "ingest {}", date)?;
                writeln!(f, "  files found: {}", report.files_found)?;
                writeln!(f, "  files processed: {}", report.files_processed)?;
                writeln!(f, "  records parsed: {}", report.records_parsed)?;
                writeln!(f, "  records inserted: {}", report.records_inserted)?;
                for line in &report.skipped {
                    writeln!(f, "  skipped: {}", line)?;
                }
            }
            StageReport::Transform { step } => {
                writeln!(f, "transform {}", step)?;
            }
            StageReport::Enrich(report) => {
                writeln!(f, "enrich")?;
                writeln!(f, "  candidates: {}", report.candidates)?;
                writeln!(f, "  processed: {}", report.processed)?;
                writeln!(f, "  unresolved: {}", report.unresolved)?;
                writeln!(f, "  failed: {}", report.failed)?;
                writeln!(f, "  detections inserted: {}", report.detections_inserted)?;
                for line in &report.skipped {
                    writeln!(f, "  skipped: {}", line)?;
                }
            }
        }
        Ok(())
    }
}

/// One unit of the job graph.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<StageReport>;
}

pub struct IngestStage {
    store: Arc<Store>,
    config: IngestConfig,
    date: Option<NaiveDate>,
    tz: Tz,
}

impl IngestStage {
    /// With `date = None` each run loads the current date in `tz`.
    pub fn new(store: Arc<Store>, config: IngestConfig, date: Option<NaiveDate>, tz: Tz) -> Self {
        Self {
            store,
            config,
            date,
            tz,
        }
    }
}

#[async_trait]
impl Stage for IngestStage {
    fn name(&self) -> &str {
        "ingest"
    }

    async fn run(&self) -> Result<StageReport> {
        let date = self
            .date
            .unwrap_or_else(|| Utc::now().with_timezone(&self.tz).date_naive());
        let report = ingest::run_ingest(&self.store, &self.config, date).await?;
        Ok(StageReport::Ingest { date, report })
    }
}

pub struct TransformStage {
    step: Box<dyn ExternalStep>,
}

impl TransformStage {
    pub fn new(step: Box<dyn ExternalStep>) -> Self {
        Self { step }
    }
}

#[async_trait]
impl Stage for TransformStage {
    fn name(&self) -> &str {
        "transform"
    }

    async fn run(&self) -> Result<StageReport> {
        match self.step.run().await? {
            StepOutcome::Succeeded => Ok(StageReport::Transform {
                step: self.step.name().to_string(),
            }),
            StepOutcome::Failed(reason) => anyhow::bail!(reason),
        }
    }
}

pub struct EnrichStage {
    store: Arc<Store>,
    resolver: ImageResolver,
    detector: Box<dyn Detector>,
    limit: Option<usize>,
}

impl EnrichStage {
    pub fn new(
        store: Arc<Store>,
        resolver: ImageResolver,
        detector: Box<dyn Detector>,
        limit: Option<usize>,
    ) -> Self {
        Self {
            store,
            resolver,
            detector,
            limit,
        }
    }
}

#[async_trait]
impl Stage for EnrichStage {
    fn name(&self) -> &str {
        "enrich"
    }

    async fn run(&self) -> Result<StageReport> {
        let report =
            enrich::run_enrich(&self.store, &self.resolver, self.detector.as_ref(), self.limit)
                .await?;
        Ok(StageReport::Enrich(report))
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub state: RunState,
    /// Reports of the stages that completed, in order.
    pub reports: Vec<StageReport>,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }

    pub fn into_result(self) -> Result<Vec<StageReport>, PipelineError> {
        match self.state {
            RunState::Succeeded => Ok(self.reports),
            RunState::Failed(e) => Err(e),
            RunState::Pending | RunState::Running(_) => Err(PipelineError::StageFailed {
                stage: "runner".to_string(),
                message: "run did not finish".to_string(),
            }),
        }
    }
}

pub struct Pipeline {
    store: Arc<Store>,
    stages: Vec<Box<dyn Stage>>,
    run_lock: Mutex<()>,
    cancel: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(store: Arc<Store>, stages: Vec<Box<dyn Stage>>) -> Self {
        Self {
            store,
            stages,
            run_lock: Mutex::new(()),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The standard ingest → transform → enrich chain.
    ///
    /// Fails when the detector is not configured.
    pub fn from_config(config: &Config, store: Arc<Store>, date: Option<NaiveDate>) -> Result<Self> {
        let detector = detect::create_detector(&config.detector)?;
        let tz = config.schedule.tz()?;
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(IngestStage::new(
                store.clone(),
                config.ingest.clone(),
                date,
                tz,
            )),
            Box::new(TransformStage::new(transform::create_step(&config.transform))),
            Box::new(EnrichStage::new(
                store.clone(),
                ImageResolver::from_config(&config.images),
                detector,
                None,
            )),
        ];
        Ok(Self::new(store, stages))
    }

    /// Share a cancellation flag, e.g. with a signal handler.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Ask the current (and every later) run to stop before its next stage.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Wait until no run is in progress.
    pub async fn wait_idle(&self) {
        let _guard = self.run_lock.lock().await;
    }

    /// Run every stage once, in order.
    ///
    /// Returns [`PipelineError::AlreadyRunning`] without doing anything if
    /// another run holds this pipeline. Stage failures are reported in the
    /// returned summary, not as `Err`.
    pub async fn run_once(&self) -> Result<RunSummary, PipelineError> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| PipelineError::AlreadyRunning)?;

        let run_id = Uuid::new_v4().to_string();
        let mut summary = RunSummary {
            run_id: run_id.clone(),
            state: RunState::Pending,
            reports: Vec::new(),
        };

        if let Err(e) = self.store.begin_run(&run_id).await {
            // Without run history the database is unusable for the stages too
            let err = PipelineError::StageFailed {
                stage: "bootstrap".to_string(),
                message: format!("{:#}", e),
            };
            error!(run_id = %run_id, error = %err, "pipeline run failed to start");
            summary.state = RunState::Failed(err);
            return Ok(summary);
        }
        info!(run_id = %run_id, stages = ?self.stage_names(), "pipeline run started");

        for stage in &self.stages {
            let name = stage.name().to_string();

            if self.is_cancelled() {
                summary.state = RunState::Failed(PipelineError::Cancelled { stage: name });
                break;
            }

            summary.state = RunState::Running(name.clone());
            info!(run_id = %run_id, stage = %name, "stage started");

            match stage.run().await {
                Ok(report) => {
                    info!(run_id = %run_id, stage = %name, "stage finished");
                    summary.reports.push(report);
                }
                Err(e) => {
                    summary.state = RunState::Failed(PipelineError::StageFailed {
                        stage: name,
                        message: format!("{:#}", e),
                    });
                    break;
                }
            }
        }

        if !matches!(summary.state, RunState::Failed(_)) {
            summary.state = RunState::Succeeded;
        }

        let recorded = match &summary.state {
            RunState::Failed(err) => {
                error!(run_id = %run_id, error = %err, "pipeline run failed");
                let stage = match err {
                    PipelineError::StageFailed { stage, .. }
                    | PipelineError::Cancelled { stage } => Some(stage.as_str()),
                    PipelineError::AlreadyRunning => None,
                };
                self.store
                    .finish_run(&run_id, RunStatus::Failed, stage, Some(&err.to_string()))
                    .await
            }
            _ => {
                info!(run_id = %run_id, "pipeline run succeeded");
                self.store
                    .finish_run(&run_id, RunStatus::Succeeded, None, None)
                    .await
            }
        };
        if let Err(e) = recorded {
            warn!(run_id = %run_id, error = %format!("{:#}", e), "could not record run outcome");
        }

        Ok(summary)
    }
}
