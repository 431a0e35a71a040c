//! # Channel Pipeline CLI (`chanpipe`)
//!
//! The `chanpipe` binary drives the daily pipeline: loading channel exports,
//! running the external transformation step, enriching media records with
//! object detections, and scheduling all of it.
//!
//! ## Usage
//!
//! ```bash
//! chanpipe --config ./config/pipeline.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chanpipe init` | Create the SQLite database and schema |
//! | `chanpipe ingest [--date]` | Load one day's export files |
//! | `chanpipe transform` | Run the external transformation step |
//! | `chanpipe enrich [--limit]` | Detect objects in images not yet processed |
//! | `chanpipe run [--date]` | Run ingest, transform and enrich once |
//! | `chanpipe schedule` | Run the chain on the configured cron schedule |
//! | `chanpipe resolve <id>` | Show how a record's image is located |
//! | `chanpipe stats` | Show store totals and recent runs |
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default `info`).

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use channel_pipeline::config::{self, Config};
use channel_pipeline::detect;
use channel_pipeline::enrich;
use channel_pipeline::ingest;
use channel_pipeline::models::EnrichmentCandidate;
use channel_pipeline::pipeline::{Pipeline, RunState, StageReport};
use channel_pipeline::resolve::{ImageResolver, Resolution};
use channel_pipeline::schedule;
use channel_pipeline::stats;
use channel_pipeline::store::Store;
use channel_pipeline::transform::{self, ExternalStep, StepOutcome};

/// Daily batch pipeline for scraped channel exports.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/pipeline.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "chanpipe",
    about = "Load channel exports, transform them and enrich media posts with object detections",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pipeline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the records, detections and
    /// pipeline_runs tables. Safe to run repeatedly.
    Init,

    /// Load the export files for one day.
    ///
    /// Reads `<raw_root>/<date>/*.json`. Records already stored are left
    /// untouched.
    Ingest {
        /// Day to load (YYYY-MM-DD). Defaults to today in the schedule timezone.
        #[arg(long)]
        date: Option<String>,
    },

    /// Run the external transformation step once.
    Transform,

    /// Run object detection on media records that have no detections yet.
    Enrich {
        /// Maximum number of records to process.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Run the whole chain (ingest, transform, enrich) once.
    Run {
        /// Day to ingest (YYYY-MM-DD). Defaults to today in the schedule timezone.
        #[arg(long)]
        date: Option<String>,
    },

    /// Run the chain on the `[schedule]` cron expression until Ctrl-C.
    Schedule,

    /// Show how the image for one record is located.
    Resolve {
        /// Record id.
        id: i64,
    },

    /// Show store totals, per-channel counts and recent runs.
    Stats,
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", s))
}

fn today(cfg: &Config) -> Result<NaiveDate> {
    let tz = cfg.schedule.tz()?;
    Ok(chrono::Utc::now().with_timezone(&tz).date_naive())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = Store::open(&cfg).await?;
            store.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { date } => {
            let date = match date {
                Some(d) => parse_date(&d)?,
                None => today(&cfg)?,
            };
            let store = Store::open(&cfg).await?;
            let report = ingest::run_ingest(&store, &cfg.ingest, date).await?;
            store.close().await;

            print!("{}", StageReport::Ingest { date, report });
            println!("ok");
        }
        Commands::Transform => {
            let step = transform::create_step(&cfg.transform);
            match step.run().await? {
                StepOutcome::Succeeded => {
                    println!("transform {}", step.name());
                    println!("ok");
                }
                StepOutcome::Failed(reason) => {
                    bail!("transform step '{}' failed: {}", step.name(), reason);
                }
            }
        }
        Commands::Enrich { limit } => {
            let detector = detect::create_detector(&cfg.detector)?;
            let resolver = ImageResolver::from_config(&cfg.images);
            let store = Store::open(&cfg).await?;
            let report = enrich::run_enrich(&store, &resolver, detector.as_ref(), limit).await?;
            store.close().await;

            print!("{}", StageReport::Enrich(report));
            println!("ok");
        }
        Commands::Run { date } => {
            let date = date.as_deref().map(parse_date).transpose()?;
            let store = Arc::new(Store::open(&cfg).await?);
            let pipeline = Pipeline::from_config(&cfg, store.clone(), date)?;
            let summary = pipeline.run_once().await?;
            store.close().await;

            println!("run {}", summary.run_id);
            for report in &summary.reports {
                print!("{}", report);
            }
            match summary.state {
                RunState::Succeeded => println!("ok"),
                RunState::Failed(e) => bail!(e),
                other => bail!("run ended in unexpected state {:?}", other),
            }
        }
        Commands::Schedule => {
            let store = Arc::new(Store::open(&cfg).await?);
            let pipeline = Arc::new(Pipeline::from_config(&cfg, store.clone(), None)?);
            schedule::run_scheduler(&cfg.schedule, pipeline).await?;
            store.close().await;
        }
        Commands::Resolve { id } => {
            let store = Store::open(&cfg).await?;
            let record = store.get_record(id).await?;
            let Some(record) = record else {
                store.close().await;
                bail!("record {} not found", id);
            };
            let detections = store.detections_for(id).await?;
            store.close().await;

            let resolver = ImageResolver::from_config(&cfg.images);
            println!("record: {}", record.id);
            println!("channel: {}", record.channel);
            println!("date: {}", record.date.to_rfc3339());
            println!("media: {}", record.media);
            println!(
                "hint: {}",
                record.file_path.as_deref().unwrap_or("(none)")
            );
            match resolver.resolve(record.id, record.file_path.as_deref()) {
                Resolution::Found { path, strategy } => {
                    println!("image: {}", path.display());
                    println!("strategy: {:?}", strategy);
                }
                Resolution::NotFound => {
                    let candidate = EnrichmentCandidate {
                        record_id: record.id,
                        channel: record.channel.clone(),
                        date: record.date,
                        file_path: record.file_path.clone(),
                    };
                    match enrich::find_by_channel_timestamp(
                        &resolver,
                        &candidate.channel,
                        &candidate.timestamp_slug(),
                    ) {
                        Some(path) => {
                            println!("image: {}", path.display());
                            println!("strategy: ChannelTimestampGlob");
                        }
                        None => println!("image: not found"),
                    }
                }
            }
            println!("detections: {}", detections.len());
            for d in &detections {
                println!("  {} {:.3}", d.object_class, d.confidence);
            }
            println!("ok");
        }
        Commands::Stats => {
            let store = Store::open(&cfg).await?;
            stats::run_stats(&cfg, &store).await?;
            store.close().await;
        }
    }

    Ok(())
}
