//! # Channel Pipeline
//!
//! A daily batch pipeline for scraped social-media channel exports.
//!
//! Each run loads the day's export files into SQLite, hands over to an
//! external transformation step, then finds the image behind every media
//! post and stores what an object-detection model sees in it. Every stage
//! is idempotent, so a failed run is simply retried by the next trigger.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────┐   ┌───────────┐   ┌──────────────────┐
//! │ Export files │──▶│  Ingest  │──▶│ Transform │──▶│      Enrich      │
//! │ <date>/*.json│   │          │   │ (external)│   │ resolve + detect │
//! └──────────────┘   └────┬─────┘   └───────────┘   └────────┬─────────┘
//!                         │                                  │
//!                         ▼                                  ▼
//!                    ┌─────────────────────────────────────────────┐
//!                    │  Store (SQLite): records, detections, runs  │
//!                    └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! chanpipe init                  # create database
//! chanpipe ingest                # load today's exports
//! chanpipe enrich                # detect objects in new images
//! chanpipe run                   # the whole chain once
//! chanpipe schedule              # run on the configured cron schedule
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema bootstrap |
//! | [`store`] | Storage gateway and conflict policy |
//! | [`export_files`] | Export file discovery and parsing |
//! | [`ingest`] | Ingestion stage |
//! | [`resolve`] | Image resolution |
//! | [`detect`] | Detection model abstraction |
//! | [`enrich`] | Enrichment stage |
//! | [`transform`] | External transformation step |
//! | [`pipeline`] | Job graph runner |
//! | [`schedule`] | Cron trigger |
//! | [`stats`] | Store statistics |

pub mod config;
pub mod db;
pub mod detect;
pub mod enrich;
pub mod export_files;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod resolve;
pub mod schedule;
pub mod stats;
pub mod store;
pub mod transform;
