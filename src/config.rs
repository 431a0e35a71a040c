//! TOML configuration for the pipeline.
//!
//! All paths, batch sizes, the detector, the external transform step and
//! the schedule are read from a single file (default
//! `./config/pipeline.toml`). [`load_config`] parses and validates it;
//! validation failures are fatal for the whole run.

use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio_cron_scheduler::Job;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub ingest: IngestConfig,
    pub images: ImagesConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Directory holding one `<YYYY-MM-DD>/` sub-directory per scrape date.
    pub raw_root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_include_globs() -> Vec<String> {
    vec!["*.json".to_string()]
}
fn default_batch_size() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImagesConfig {
    /// Canonical image root. Relative image references fall back to this directory.
    pub root: PathBuf,
    #[serde(default = "default_image_extensions")]
    pub extensions: Vec<String>,
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "webp", "bmp", "tif", "tiff"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            command: None,
            args: Vec::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}

impl DetectorConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// External transformation step run between ingestion and enrichment.
///
/// When `command` is unset the step is a no-op that always succeeds.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TransformConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    /// Six-field cron expression with a leading seconds field, e.g. `0 0 2 * * *`.
    #[serde(default = "default_cron")]
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: default_cron(),
            timezone: default_timezone(),
        }
    }
}

fn default_cron() -> String {
    "0 0 2 * * *".to_string()
}
fn default_timezone() -> String {
    "UTC".to_string()
}

impl ScheduleConfig {
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("schedule.timezone '{}' is invalid: {}", self.timezone, e))
    }

    /// Check the cron expression with the same parser the scheduler uses.
    pub fn validate(&self) -> Result<()> {
        let fields = self.cron.split_whitespace().count();
        if fields != 6 {
            bail!(
                "schedule.cron must have 6 fields (seconds first), got {}: '{}'",
                fields,
                self.cron
            );
        }
        let tz = self.tz()?;
        Job::new_async_tz(self.cron.as_str(), tz, |_uuid, _lock| Box::pin(async {}))
            .map_err(|e| anyhow::anyhow!("schedule.cron '{}' is invalid: {:?}", self.cron, e))?;
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.ingest.batch_size == 0 {
        bail!("ingest.batch_size must be > 0");
    }

    if config.images.extensions.is_empty() {
        bail!("images.extensions must not be empty");
    }
    config.images.extensions = config
        .images
        .extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .collect();

    match config.detector.provider.as_str() {
        "disabled" => {}
        "command" => {
            if config.detector.command.is_none() {
                bail!("detector.command must be specified when provider is 'command'");
            }
            if config.detector.timeout_secs == 0 {
                bail!("detector.timeout_secs must be > 0");
            }
        }
        other => bail!(
            "Unknown detector provider: '{}'. Must be disabled or command.",
            other
        ),
    }

    config.schedule.validate()?;

    Ok(config)
}
