//! Ingestion stage.
//!
//! Loads every export file of one scrape date into the `records` table.
//! Files are parsed independently: a file that cannot be read or parsed is
//! logged and skipped, and the rest of the run carries on. Records go
//! through [`Store::upsert_records`], so rerunning the same date inserts
//! nothing new. A storage error aborts the stage; batches committed before
//! it stay committed.

use anyhow::Result;
use chrono::NaiveDate;
use tracing::{info, warn};

use crate::config::IngestConfig;
use crate::export_files;
use crate::store::Store;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub files_found: u64,
    pub files_processed: u64,
    pub records_parsed: u64,
    pub records_inserted: u64,
    /// One line per skipped file.
    pub skipped: Vec<String>,
}

pub async fn run_ingest(
    store: &Store,
    config: &IngestConfig,
    date: NaiveDate,
) -> Result<IngestReport> {
    let dir = export_files::date_dir(&config.raw_root, date);
    let files = export_files::discover(&dir, &config.include_globs)?;

    let mut report = IngestReport {
        files_found: files.len() as u64,
        ..Default::default()
    };

    if files.is_empty() {
        warn!(dir = %dir.display(), "no export files found, nothing to load");
        return Ok(report);
    }

    for path in &files {
        let records = match export_files::load_file(path) {
            Ok(records) => records,
            Err(e) => {
                warn!(file = %path.display(), error = %format!("{:#}", e), "skipping export file");
                report
                    .skipped
                    .push(format!("{}: {:#}", path.display(), e));
                continue;
            }
        };

        let inserted = store.upsert_records(&records).await?;
        info!(
            file = %path.display(),
            parsed = records.len(),
            inserted,
            "loaded export file"
        );

        report.files_processed += 1;
        report.records_parsed += records.len() as u64;
        report.records_inserted += inserted;
    }

    info!(
        files = report.files_processed,
        inserted = report.records_inserted,
        "ingestion finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn ingest_config(raw_root: &Path) -> IngestConfig {
        IngestConfig {
            raw_root: raw_root.to_path_buf(),
            include_globs: vec!["*.json".to_string()],
            batch_size: 2,
        }
    }

    async fn store_in(tmp: &TempDir) -> Store {
        let pool = db::connect_path(&tmp.path().join("db.sqlite")).await.unwrap();
        let store = Store::new(pool, 2);
        store.ensure_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn missing_date_dir_is_nothing_to_do() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp).await;
        let report = run_ingest(
            &store,
            &ingest_config(&tmp.path().join("raw")),
            NaiveDate::from_ymd_opt(2025, 7, 20).unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(report, IngestReport::default());
    }

    #[tokio::test]
    async fn counts_parsed_and_inserted() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp).await;
        let date = NaiveDate::from_ymd_opt(2025, 7, 20).unwrap();
        let dir = tmp.path().join("raw").join("2025-07-20");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("a.json"),
            r#"[{"id": 1, "date": "2025-07-20T00:00:00Z"},
                {"id": 2, "date": "2025-07-20T00:00:00Z"},
                {"id": 3, "date": "2025-07-20T00:00:00Z"}]"#,
        )
        .unwrap();
        // Overlaps with a.json on id 3
        fs::write(
            dir.join("b.json"),
            r#"{"messages": [{"id": 3, "date": "2025-07-20T00:00:00Z"}, {"id": 4, "date": "2025-07-20T00:00:00Z"}]}"#,
        )
        .unwrap();

        let config = ingest_config(&tmp.path().join("raw"));
        let report = run_ingest(&store, &config, date).await.unwrap();
        assert_eq!(report.files_found, 2);
        assert_eq!(report.files_processed, 2);
        assert_eq!(report.records_parsed, 5);
        assert_eq!(report.records_inserted, 4);

        // First write wins: record 3 keeps the channel of a.json
        assert_eq!(store.get_record(3).await.unwrap().unwrap().channel, "a");
    }
}
