//! Channel export files: discovery and parsing.
//!
//! The scraper writes one JSON file per channel into a directory named after
//! the scrape date, e.g. `data/raw/telegram_messages/2025-07-20/tikvahpharma.json`.
//! A file holds either a bare list of message entries or an object with a
//! `messages` list. The same shape is read back by the image resolver when a
//! record's path hint points at an export file.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::models::Record;

/// Directory holding the exports of one scrape date.
pub fn date_dir(raw_root: &Path, date: NaiveDate) -> PathBuf {
    raw_root.join(date.format("%Y-%m-%d").to_string())
}

/// List export files directly under `dir` matching `include_globs`, sorted by name.
///
/// A missing directory yields an empty list.
pub fn discover(dir: &Path, include_globs: &[String]) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let include_set = build_globset(include_globs)?;
    let mut files = Vec::new();

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if include_set.is_match(&name) {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

/// Channel label of an export file: its file stem.
pub fn channel_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Parse a container document into its list of entries.
///
/// Accepts a top-level array or an object with a `messages` array. Any
/// other JSON value is a container with no entries.
pub fn parse_container(content: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(content)?;
    Ok(match value {
        Value::Array(entries) => entries,
        Value::Object(mut map) => match map.remove("messages") {
            Some(Value::Array(entries)) => entries,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    })
}

/// Read and parse one export file into records.
///
/// Fails only if the file cannot be read or is not valid JSON. Individual
/// entries lacking an id or a usable date are skipped with a warning.
pub fn load_file(path: &Path) -> Result<Vec<Record>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read export file: {}", path.display()))?;
    let entries = parse_container(&content)
        .with_context(|| format!("Malformed export file: {}", path.display()))?;

    let channel = channel_name(path);
    let hint = path.to_string_lossy().to_string();
    let mut records = Vec::with_capacity(entries.len());

    for (index, entry) in entries.iter().enumerate() {
        match entry_to_record(entry, &channel, &hint) {
            Some(record) => records.push(record),
            None => warn!(
                file = %path.display(),
                index,
                "skipping export entry without a usable id or date"
            ),
        }
    }

    Ok(records)
}

fn entry_to_record(entry: &Value, channel: &str, hint: &str) -> Option<Record> {
    let obj = entry.as_object()?;
    let id = obj.get("id").and_then(as_id)?;
    let date = obj.get("date").and_then(Value::as_str).and_then(parse_date)?;

    let media = match obj.get("media") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Null) | None => false,
        // A media object (or any other non-null value) means media is attached
        Some(_) => true,
    };

    Some(Record {
        id,
        date,
        message: obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        from_id: obj.get("from_id").and_then(as_id),
        chat_id: obj.get("chat_id").and_then(as_id),
        media,
        channel: channel.to_string(),
        file_path: Some(hint.to_string()),
    })
}

/// An integer id, a numeric string, or an object carrying exactly one integer
/// (such as `{"_": "PeerUser", "user_id": 42}`).
fn as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(map) => {
            let mut ids = map.values().filter_map(Value::as_i64);
            match (ids.next(), ids.next()) {
                (Some(id), None) => Some(id),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Parse RFC 3339 or `YYYY-MM-DD HH:MM:SS[+HH:MM]`. Naive times are taken as UTC.
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn parse_container_accepts_both_shapes() {
        assert_eq!(parse_container(r#"[{"id": 1}, {"id": 2}]"#).unwrap().len(), 2);
        assert_eq!(
            parse_container(r#"{"messages": [{"id": 1}]}"#).unwrap().len(),
            1
        );
        assert!(parse_container(r#"{"other": []}"#).unwrap().is_empty());
        assert!(parse_container("42").unwrap().is_empty());
        assert!(parse_container("[{").is_err());
    }

    #[test]
    fn parse_date_formats() {
        let expected = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_date("2025-01-01T00:00:00Z"), Some(expected));
        assert_eq!(parse_date("2025-01-01T03:00:00+03:00"), Some(expected));
        assert_eq!(parse_date("2025-01-01 00:00:00+00:00"), Some(expected));
        assert_eq!(parse_date("2025-01-01 00:00:00"), Some(expected));
        assert_eq!(parse_date("yesterday"), None);
    }

    #[test]
    fn ids_from_numbers_strings_and_peers() {
        assert_eq!(as_id(&serde_json::json!(42)), Some(42));
        assert_eq!(as_id(&serde_json::json!("42")), Some(42));
        assert_eq!(
            as_id(&serde_json::json!({"_": "PeerUser", "user_id": 7})),
            Some(7)
        );
        assert_eq!(as_id(&serde_json::json!({"a": 1, "b": 2})), None);
        assert_eq!(as_id(&serde_json::json!(null)), None);
    }

    #[test]
    fn load_file_maps_entries() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("CheMed123.json");
        fs::write(
            &path,
            r#"[
                {"id": 1, "date": "2025-07-20T10:00:00+00:00", "message": "hello", "from_id": null, "chat_id": -1001, "media": true},
                {"id": 2, "date": "2025-07-20T11:00:00+00:00"},
                {"date": "2025-07-20T12:00:00+00:00", "message": "no id"},
                {"id": 4, "date": "2025-07-20T13:00:00+00:00", "media": {"file": "photo.jpg"}}
            ]"#,
        )
        .unwrap();

        let records = load_file(&path).unwrap();
        assert_eq!(records.len(), 3);

        let first = &records[0];
        assert_eq!(first.id, 1);
        assert_eq!(first.channel, "CheMed123");
        assert_eq!(first.message.as_deref(), Some("hello"));
        assert_eq!(first.chat_id, Some(-1001));
        assert_eq!(first.from_id, None);
        assert!(first.media);
        assert_eq!(first.file_path.as_deref(), Some(path.to_str().unwrap()));

        let second = &records[1];
        assert_eq!(second.message, None);
        assert!(!second.media);

        assert!(records[2].media);
    }

    #[test]
    fn discover_filters_and_sorts() {
        let tmp = TempDir::new().unwrap();
        let dir = date_dir(tmp.path(), NaiveDate::from_ymd_opt(2025, 7, 20).unwrap());
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("b.json"), "[]").unwrap();
        fs::write(dir.join("a.json"), "[]").unwrap();
        fs::write(dir.join("notes.txt"), "").unwrap();
        fs::write(dir.join("nested").join("c.json"), "[]").unwrap();

        let files = discover(&dir, &["*.json".to_string()]).unwrap();
        let names: Vec<String> = files.iter().map(|p| channel_name(p)).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn discover_missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let files = discover(&tmp.path().join("2031-01-01"), &["*.json".to_string()]).unwrap();
        assert!(files.is_empty());
    }
}
