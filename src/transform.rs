//! The external transformation step.
//!
//! Between ingestion and enrichment the pipeline runs an opaque, idempotent
//! step (typically a SQL transformation tool building models on top of the
//! raw tables). The runner only needs to know whether it succeeded, so the
//! step is modeled as [`ExternalStep`]: anything with a name and a `run()`
//! returning a [`StepOutcome`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tracing::info;

use crate::config::TransformConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed(String),
}

#[async_trait]
pub trait ExternalStep: Send + Sync {
    fn name(&self) -> &str;

    /// `Err` means the step could not be run at all; `Ok(Failed)` means it ran and reported failure.
    async fn run(&self) -> Result<StepOutcome>;
}

/// Build the step described by `[transform]`; no command means [`NoopStep`].
pub fn create_step(config: &TransformConfig) -> Box<dyn ExternalStep> {
    match &config.command {
        Some(command) => Box::new(CommandStep {
            command: command.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
        }),
        None => Box::new(NoopStep),
    }
}

/// Runs a program; success is exit status 0. Output is inherited.
pub struct CommandStep {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

#[async_trait]
impl ExternalStep for CommandStep {
    fn name(&self) -> &str {
        &self.command
    }

    async fn run(&self) -> Result<StepOutcome> {
        info!(command = %self.command, args = ?self.args, "running transform step");

        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let status = cmd
            .status()
            .await
            .with_context(|| format!("Failed to start transform command '{}'", self.command))?;

        if status.success() {
            Ok(StepOutcome::Succeeded)
        } else {
            Ok(StepOutcome::Failed(format!(
                "'{}' exited with {}",
                self.command, status
            )))
        }
    }
}

pub struct NoopStep;

#[async_trait]
impl ExternalStep for NoopStep {
    fn name(&self) -> &str {
        "noop"
    }

    async fn run(&self) -> Result<StepOutcome> {
        info!("no transform configured, skipping");
        Ok(StepOutcome::Succeeded)
    }
}
