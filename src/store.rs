//! Storage gateway: the only component that reads or writes the database.
//!
//! Both stages go through [`Store`], which owns the connection pool and
//! centralizes the conflict policy:
//!
//! - records are first-write-wins on `id`;
//! - detections are discarded on a `(record_id, object_class, confidence)`
//!   collision.
//!
//! Writes are split into batches of at most `batch_size` rows, each batch in
//! its own transaction. A failed batch rolls back completely, so replaying
//! the same input is always safe.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::{Detection, EnrichmentCandidate, Record, RunStatus};

pub struct Store {
    pool: SqlitePool,
    batch_size: usize,
}

/// Totals shown by `chanpipe stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub records: i64,
    pub media_records: i64,
    pub enriched_records: i64,
    pub detections: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCounts {
    pub channel: String,
    pub records: i64,
    pub media_records: i64,
    pub detections: i64,
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub status: String,
    pub failed_stage: Option<String>,
    pub error: Option<String>,
}

impl Store {
    pub fn new(pool: SqlitePool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }

    /// Open the configured database and bootstrap the schema.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        let store = Self::new(pool, config.ingest.batch_size);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        migrate::run_migrations(&self.pool)
            .await
            .context("Schema bootstrap failed")
    }

    /// Insert records, skipping ids that already exist. Returns rows actually inserted.
    pub async fn upsert_records(&self, records: &[Record]) -> Result<u64> {
        let loaded_at = Utc::now().timestamp();
        let mut inserted = 0u64;

        for batch in records.chunks(self.batch_size) {
            let mut tx = self.pool.begin().await?;
            for record in batch {
                let result = sqlx::query(
                    r#"
                    INSERT INTO records (id, date, message, from_id, chat_id, media, channel, file_path, loaded_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO NOTHING
                    "#,
                )
                .bind(record.id)
                .bind(record.date.timestamp())
                .bind(&record.message)
                .bind(record.from_id)
                .bind(record.chat_id)
                .bind(record.media)
                .bind(&record.channel)
                .bind(&record.file_path)
                .bind(loaded_at)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to insert record {}", record.id))?;
                inserted += result.rows_affected();
            }
            tx.commit().await?;
        }

        Ok(inserted)
    }

    /// Insert detections, discarding exact `(record, class, confidence)` duplicates.
    pub async fn upsert_detections(&self, detections: &[Detection]) -> Result<u64> {
        let detected_at = Utc::now().timestamp();
        let mut inserted = 0u64;

        for batch in detections.chunks(self.batch_size) {
            let mut tx = self.pool.begin().await?;
            for det in batch {
                let result = sqlx::query(
                    r#"
                    INSERT INTO detections (record_id, object_class, confidence, detected_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(record_id, object_class, confidence) DO NOTHING
                    "#,
                )
                .bind(det.record_id)
                .bind(&det.object_class)
                .bind(det.confidence)
                .bind(detected_at)
                .execute(&mut *tx)
                .await
                .with_context(|| {
                    format!(
                        "Failed to insert detection ({}, {}, {})",
                        det.record_id, det.object_class, det.confidence
                    )
                })?;
                inserted += result.rows_affected();
            }
            tx.commit().await?;
        }

        Ok(inserted)
    }

    /// Media records that have no detection rows yet, oldest id first.
    pub async fn fetch_records_needing_enrichment(&self) -> Result<Vec<EnrichmentCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.channel, r.date, r.file_path
            FROM records r
            WHERE r.media = 1
              AND NOT EXISTS (SELECT 1 FROM detections d WHERE d.record_id = r.id)
            ORDER BY r.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let record_id: i64 = row.get("id");
                Ok(EnrichmentCandidate {
                    record_id,
                    channel: row.get("channel"),
                    date: from_unix(row.get("date"))
                        .with_context(|| format!("Record {} has an invalid date", record_id))?,
                    file_path: row.get("file_path"),
                })
            })
            .collect()
    }

    pub async fn get_record(&self, id: i64) -> Result<Option<Record>> {
        let row = sqlx::query(
            "SELECT id, date, message, from_id, chat_id, media, channel, file_path FROM records WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Record {
                id: row.get("id"),
                date: from_unix(row.get("date"))
                    .with_context(|| format!("Record {} has an invalid date", id))?,
                message: row.get("message"),
                from_id: row.get("from_id"),
                chat_id: row.get("chat_id"),
                media: row.get("media"),
                channel: row.get("channel"),
                file_path: row.get("file_path"),
            })
        })
        .transpose()
    }

    pub async fn detections_for(&self, record_id: i64) -> Result<Vec<Detection>> {
        let rows = sqlx::query(
            "SELECT record_id, object_class, confidence FROM detections WHERE record_id = ? ORDER BY object_class, confidence",
        )
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Detection {
                record_id: row.get("record_id"),
                object_class: row.get("object_class"),
                confidence: row.get("confidence"),
            })
            .collect())
    }

    pub async fn begin_run(&self, run_id: &str) -> Result<()> {
        sqlx::query("INSERT INTO pipeline_runs (id, started_at, status) VALUES (?, ?, ?)")
            .bind(run_id)
            .bind(Utc::now().timestamp())
            .bind(RunStatus::Running.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        failed_stage: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE pipeline_runs SET finished_at = ?, status = ?, failed_stage = ?, error = ? WHERE id = ?",
        )
        .bind(Utc::now().timestamp())
        .bind(status.as_str())
        .bind(failed_stage)
        .bind(error)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<RunRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, started_at, finished_at, status, failed_stage, error
            FROM pipeline_runs
            ORDER BY started_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| RunRow {
                id: row.get("id"),
                started_at: row.get("started_at"),
                finished_at: row.get("finished_at"),
                status: row.get("status"),
                failed_stage: row.get("failed_stage"),
                error: row.get("error"),
            })
            .collect())
    }

    pub async fn counts(&self) -> Result<StoreCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM records) AS records,
                (SELECT COUNT(*) FROM records WHERE media = 1) AS media_records,
                (SELECT COUNT(DISTINCT record_id) FROM detections) AS enriched_records,
                (SELECT COUNT(*) FROM detections) AS detections
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreCounts {
            records: row.get("records"),
            media_records: row.get("media_records"),
            enriched_records: row.get("enriched_records"),
            detections: row.get("detections"),
        })
    }

    pub async fn channel_counts(&self) -> Result<Vec<ChannelCounts>> {
        let rows = sqlx::query(
            r#"
            SELECT
                r.channel,
                COUNT(DISTINCT r.id) AS records,
                COUNT(DISTINCT CASE WHEN r.media = 1 THEN r.id END) AS media_records,
                COUNT(d.record_id) AS detections
            FROM records r
            LEFT JOIN detections d ON d.record_id = r.id
            GROUP BY r.channel
            ORDER BY records DESC, r.channel
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ChannelCounts {
                channel: row.get("channel"),
                records: row.get("records"),
                media_records: row.get("media_records"),
                detections: row.get("detections"),
            })
            .collect())
    }
}

fn from_unix(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0).ok_or_else(|| anyhow::anyhow!("timestamp out of range: {}", ts))
}
