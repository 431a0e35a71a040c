//! Core data models that flow through the pipeline.
//!
//! [`Record`]s are produced by ingestion and never mutated afterwards.
//! [`Detection`]s are produced by enrichment. [`EnrichmentCandidate`] is
//! the projection of a record the enrichment stage needs.

use chrono::{DateTime, Utc};

/// One ingested message from a channel export.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Source-assigned id, unique across the store.
    pub id: i64,
    pub date: DateTime<Utc>,
    pub message: Option<String>,
    pub from_id: Option<i64>,
    pub chat_id: Option<i64>,
    pub media: bool,
    /// Channel label, derived from the export file name.
    pub channel: String,
    /// Where to start looking for the record's image.
    pub file_path: Option<String>,
}

/// One object class found in a record's image.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub record_id: i64,
    pub object_class: String,
    pub confidence: f64,
}

/// A media record with no detections yet.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentCandidate {
    pub record_id: i64,
    pub channel: String,
    pub date: DateTime<Utc>,
    pub file_path: Option<String>,
}

impl EnrichmentCandidate {
    /// Timestamp in the form the scraper uses for photo file names.
    pub fn timestamp_slug(&self) -> String {
        self.date.format("%Y-%m-%d_%H-%M-%S").to_string()
    }
}

/// Terminal state of a pipeline run, as persisted in `pipeline_runs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamp_slug_matches_photo_names() {
        let c = EnrichmentCandidate {
            record_id: 7,
            channel: "lobelia4cosmetics".to_string(),
            date: Utc.with_ymd_and_hms(2025, 7, 20, 9, 5, 3).unwrap(),
            file_path: None,
        };
        assert_eq!(c.timestamp_slug(), "2025-07-20_09-05-03");
    }
}
