//! Enrichment stage.
//!
//! Runs the detector over every media record that has no detections yet
//! and stores what it finds. Per-record problems (no image found, detector
//! failure) are logged and skipped; since nothing was written for such a
//! record it stays a candidate for the next run. Detections are written
//! right after each record so progress survives a crash mid-run.

use anyhow::Result;
use globset::Glob;
use std::path::PathBuf;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::detect::Detector;
use crate::models::{Detection, EnrichmentCandidate};
use crate::resolve::{ImageResolver, Resolution};
use crate::store::Store;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichReport {
    pub candidates: u64,
    pub processed: u64,
    pub unresolved: u64,
    pub failed: u64,
    pub detections_inserted: u64,
    /// One line per skipped record.
    pub skipped: Vec<String>,
}

pub async fn run_enrich(
    store: &Store,
    resolver: &ImageResolver,
    detector: &dyn Detector,
    limit: Option<usize>,
) -> Result<EnrichReport> {
    let mut candidates = store.fetch_records_needing_enrichment().await?;
    if let Some(lim) = limit {
        candidates.truncate(lim);
    }

    let mut report = EnrichReport {
        candidates: candidates.len() as u64,
        ..Default::default()
    };

    if candidates.is_empty() {
        info!("no new images to process");
        return Ok(report);
    }

    for candidate in &candidates {
        let Some(image) = locate_image(resolver, candidate) else {
            warn!(
                record_id = candidate.record_id,
                channel = %candidate.channel,
                ts = %candidate.timestamp_slug(),
                "image not found"
            );
            report.unresolved += 1;
            report
                .skipped
                .push(format!("record {}: image not found", candidate.record_id));
            continue;
        };

        let objects = match detector.detect(&image).await {
            Ok(objects) => objects,
            Err(e) => {
                warn!(
                    record_id = candidate.record_id,
                    image = %image.display(),
                    detector = detector.name(),
                    error = %format!("{:#}", e),
                    "detector failed"
                );
                report.failed += 1;
                report.skipped.push(format!(
                    "record {}: detector failed on {}: {:#}",
                    candidate.record_id,
                    image.display(),
                    e
                ));
                continue;
            }
        };

        let detections: Vec<Detection> = objects
            .into_iter()
            .map(|obj| Detection {
                record_id: candidate.record_id,
                object_class: obj.label,
                confidence: obj.confidence,
            })
            .collect();

        let inserted = store.upsert_detections(&detections).await?;
        info!(
            record_id = candidate.record_id,
            image = %image.display(),
            inserted,
            "detections saved"
        );

        report.processed += 1;
        report.detections_inserted += inserted;
    }

    info!(
        processed = report.processed,
        skipped = report.unresolved + report.failed,
        inserted = report.detections_inserted,
        "enrichment finished"
    );
    Ok(report)
}

/// The resolver's answer, else a search by channel and timestamp under the image root.
pub fn locate_image(resolver: &ImageResolver, candidate: &EnrichmentCandidate) -> Option<PathBuf> {
    match resolver.resolve(candidate.record_id, candidate.file_path.as_deref()) {
        Resolution::Found { path, .. } => Some(path),
        Resolution::NotFound => find_by_channel_timestamp(
            resolver,
            &candidate.channel,
            &candidate.timestamp_slug(),
        ),
    }
}

/// First match (by path order) of `**/<channel>/photo_<ts>.<image ext>` under the image root.
pub fn find_by_channel_timestamp(
    resolver: &ImageResolver,
    channel: &str,
    ts_slug: &str,
) -> Option<PathBuf> {
    let root = resolver.root();
    if channel.is_empty() || !root.is_dir() {
        return None;
    }

    let pattern = format!(
        "**/{}/photo_{}.*",
        globset::escape(channel),
        globset::escape(ts_slug)
    );
    let matcher = Glob::new(&pattern)
        .ok()?
        .compile_matcher();

    let mut matches: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            let relative = path.strip_prefix(root).unwrap_or(path);
            matcher.is_match(relative) && resolver.is_image_path(path)
        })
        .collect();

    matches.sort();
    matches.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::detect::DetectedObject;
    use crate::models::Record;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Returns fixed detections, failing for images whose name contains "bad".
    struct FakeDetector {
        objects: Vec<(String, f64)>,
        calls: Mutex<Vec<PathBuf>>,
    }

    impl FakeDetector {
        fn new(objects: &[(&str, f64)]) -> Self {
            Self {
                objects: objects.iter().map(|(l, c)| (l.to_string(), *c)).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Detector for FakeDetector {
        fn name(&self) -> &str {
            "fake"
        }

        async fn detect(&self, image: &Path) -> Result<Vec<DetectedObject>> {
            self.calls.lock().unwrap().push(image.to_path_buf());
            let name = image.file_name().unwrap_or_default().to_string_lossy();
            if name.contains("bad") {
                anyhow::bail!("model crashed");
            }
            Ok(self
                .objects
                .iter()
                .map(|(label, confidence)| DetectedObject {
                    label: label.clone(),
                    confidence: *confidence,
                })
                .collect())
        }
    }

    fn record(id: i64, channel: &str, hint: Option<&str>) -> Record {
        Record {
            id,
            date: Utc.with_ymd_and_hms(2025, 7, 20, 8, 30, 0).unwrap(),
            message: None,
            from_id: None,
            chat_id: None,
            media: true,
            channel: channel.to_string(),
            file_path: hint.map(str::to_string),
        }
    }

    async fn setup() -> (TempDir, Store, ImageResolver) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("db.sqlite")).await.unwrap();
        let store = Store::new(pool, 100);
        store.ensure_schema().await.unwrap();
        let images = tmp.path().join("images");
        fs::create_dir_all(&images).unwrap();
        let resolver = ImageResolver::new(images, vec!["jpg".to_string()]);
        (tmp, store, resolver)
    }

    #[tokio::test]
    async fn glob_fallback_by_channel_and_timestamp() {
        let (tmp, _store, resolver) = setup().await;
        let dir = tmp.path().join("images").join("2025-07-20").join("tikvahpharma");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("photo_2025-07-20_08-30-00.jpg"), "x").unwrap();
        fs::write(dir.join("photo_2025-07-20_08-30-00.txt"), "x").unwrap();

        let found = find_by_channel_timestamp(&resolver, "tikvahpharma", "2025-07-20_08-30-00");
        assert_eq!(found, Some(dir.join("photo_2025-07-20_08-30-00.jpg")));
        assert_eq!(
            find_by_channel_timestamp(&resolver, "other", "2025-07-20_08-30-00"),
            None
        );
    }

    #[tokio::test]
    async fn glob_metacharacters_in_channel_are_literal() {
        let (tmp, _store, resolver) = setup().await;
        let images = tmp.path().join("images").join("2025-07-20");
        let literal = images.join("news[1]");
        let lookalike = images.join("news1");
        fs::create_dir_all(&literal).unwrap();
        fs::create_dir_all(&lookalike).unwrap();
        fs::write(lookalike.join("photo_2025-07-20_08-30-00.jpg"), "x").unwrap();

        // The character class must not match the "news1" directory
        assert_eq!(
            find_by_channel_timestamp(&resolver, "news[1]", "2025-07-20_08-30-00"),
            None
        );

        fs::write(literal.join("photo_2025-07-20_08-30-00.jpg"), "x").unwrap();
        assert_eq!(
            find_by_channel_timestamp(&resolver, "news[1]", "2025-07-20_08-30-00"),
            Some(literal.join("photo_2025-07-20_08-30-00.jpg"))
        );
        assert_eq!(
            find_by_channel_timestamp(&resolver, "*", "2025-07-20_08-30-00"),
            None
        );
    }

    #[tokio::test]
    async fn skips_unresolved_and_failed_records() {
        let (tmp, store, resolver) = setup().await;
        let images = tmp.path().join("images");
        fs::write(images.join("good.jpg"), "x").unwrap();
        fs::write(images.join("bad.jpg"), "x").unwrap();

        store
            .upsert_records(&[
                record(1, "chan", Some(images.join("good.jpg").to_str().unwrap())),
                record(2, "chan", Some(images.join("bad.jpg").to_str().unwrap())),
                record(3, "chan", Some("/nowhere/missing.jpg")),
            ])
            .await
            .unwrap();

        let detector = FakeDetector::new(&[("box", 0.9), ("cup", 0.4)]);
        let report = run_enrich(&store, &resolver, &detector, None).await.unwrap();

        assert_eq!(report.candidates, 3);
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.unresolved, 1);
        assert_eq!(report.detections_inserted, 2);
        assert_eq!(report.skipped.len(), 2);

        // Skipped records remain candidates
        let pending: Vec<i64> = store
            .fetch_records_needing_enrichment()
            .await
            .unwrap()
            .iter()
            .map(|c| c.record_id)
            .collect();
        assert_eq!(pending, vec![2, 3]);
    }

    #[tokio::test]
    async fn second_run_is_noop_for_processed_records() {
        let (tmp, store, resolver) = setup().await;
        let images = tmp.path().join("images");
        fs::write(images.join("a.jpg"), "x").unwrap();
        store
            .upsert_records(&[record(1, "chan", Some(images.join("a.jpg").to_str().unwrap()))])
            .await
            .unwrap();

        let detector = FakeDetector::new(&[("box", 0.9)]);
        let first = run_enrich(&store, &resolver, &detector, None).await.unwrap();
        assert_eq!(first.detections_inserted, 1);

        let second = run_enrich(&store, &resolver, &detector, None).await.unwrap();
        assert_eq!(second.candidates, 0);
        assert_eq!(second.detections_inserted, 0);
        assert_eq!(detector.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn limit_caps_candidates() {
        let (tmp, store, resolver) = setup().await;
        let images = tmp.path().join("images");
        fs::write(images.join("a.jpg"), "x").unwrap();
        let hint = images.join("a.jpg");
        store
            .upsert_records(&[
                record(1, "chan", hint.to_str()),
                record(2, "chan", hint.to_str()),
            ])
            .await
            .unwrap();

        let detector = FakeDetector::new(&[("box", 0.9)]);
        let report = run_enrich(&store, &resolver, &detector, Some(1)).await.unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(report.processed, 1);
    }
}
