//! Object detection backends.
//!
//! The pipeline treats the detection model as a black box: one image path
//! in, zero or more `(label, confidence)` pairs out, in no particular order.
//! [`Detector`] is that boundary. The built-in [`CommandDetector`] runs an
//! external program (for example a small wrapper around a YOLO model) that
//! prints its detections as JSON on stdout.
//!
//! # Command protocol
//!
//! The configured program is run as `<command> <args...> <image path>` and
//! must exit 0 and print either
//!
//! ```json
//! [{"label": "bottle", "confidence": 0.91}, {"label": "person", "confidence": 0.42}]
//! ```
//!
//! or the same list wrapped as `{"detections": [...]}`. `class`/`name` are
//! accepted for `label` and `score` for `confidence`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use crate::config::DetectorConfig;

/// One object found in an image.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DetectedObject {
    #[serde(alias = "class", alias = "name")]
    pub label: String,
    #[serde(alias = "score")]
    pub confidence: f64,
}

#[async_trait]
pub trait Detector: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Run the model against one image.
    async fn detect(&self, image: &Path) -> Result<Vec<DetectedObject>>;
}

/// Build the detector selected by `[detector] provider`.
///
/// A disabled detector is a configuration error for any command that needs one.
pub fn create_detector(config: &DetectorConfig) -> Result<Box<dyn Detector>> {
    match config.provider.as_str() {
        "command" => Ok(Box::new(CommandDetector::from_config(config)?)),
        "disabled" => bail!("Detector is disabled. Set [detector] provider in config."),
        other => bail!("Unknown detector provider: {}", other),
    }
}

pub struct CommandDetector {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandDetector {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Result<Self> {
        let command = config
            .command
            .clone()
            .ok_or_else(|| anyhow::anyhow!("detector.command is not configured"))?;
        Ok(Self::new(
            command,
            config.args.clone(),
            Duration::from_secs(config.timeout_secs),
        ))
    }
}

#[async_trait]
impl Detector for CommandDetector {
    fn name(&self) -> &str {
        &self.command
    }

    async fn detect(&self, image: &Path) -> Result<Vec<DetectedObject>> {
        let child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .arg(image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start detector '{}'", self.command))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "detector timed out after {}s on {}",
                    self.timeout.as_secs(),
                    image.display()
                )
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "detector exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        parse_detections(&String::from_utf8_lossy(&output.stdout))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DetectorOutput {
    List(Vec<DetectedObject>),
    Wrapped { detections: Vec<DetectedObject> },
}

/// Parse detector stdout and check every confidence is within `[0, 1]`.
pub fn parse_detections(stdout: &str) -> Result<Vec<DetectedObject>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let parsed: DetectorOutput =
        serde_json::from_str(trimmed).with_context(|| "Malformed detector output")?;
    let objects = match parsed {
        DetectorOutput::List(objects) => objects,
        DetectorOutput::Wrapped { detections } => detections,
    };

    for obj in &objects {
        if !obj.confidence.is_finite() || !(0.0..=1.0).contains(&obj.confidence) {
            bail!(
                "detector returned confidence {} for '{}' outside [0, 1]",
                obj.confidence,
                obj.label
            );
        }
    }

    Ok(objects)
}
