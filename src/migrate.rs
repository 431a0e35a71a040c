use anyhow::{Context, Result};
use sqlx::SqlitePool;

/// Create every table and index the pipeline uses. Safe to run on each startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Raw ingested messages, keyed by the source-assigned id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id INTEGER PRIMARY KEY,
            date INTEGER NOT NULL,
            message TEXT,
            from_id INTEGER,
            chat_id INTEGER,
            media INTEGER NOT NULL DEFAULT 0,
            channel TEXT NOT NULL,
            file_path TEXT,
            loaded_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create records table")?;

    // Confidence is part of the key: a rerun yielding a different score adds a row
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS detections (
            record_id INTEGER NOT NULL,
            object_class TEXT NOT NULL,
            confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
            detected_at INTEGER NOT NULL,
            PRIMARY KEY (record_id, object_class, confidence),
            FOREIGN KEY (record_id) REFERENCES records(id)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create detections table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_runs (
            id TEXT PRIMARY KEY,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            status TEXT NOT NULL,
            failed_stage TEXT,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create pipeline_runs table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_media ON records(media)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_channel ON records(channel)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pipeline_runs_started_at ON pipeline_runs(started_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
