//! Store statistics and run history.
//!
//! Gives operators a quick view of what has been loaded and enriched:
//! record and detection totals, how many media records are still waiting
//! for detections, a per-channel breakdown and the most recent pipeline
//! runs (including the error of a failed run). Used by `chanpipe stats`.

use anyhow::Result;

use crate::config::Config;
use crate::store::Store;

const RECENT_RUNS: i64 = 5;

pub async fn run_stats(config: &Config, store: &Store) -> Result<()> {
    let counts = store.counts().await?;
    let channels = store.channel_counts().await?;
    let runs = store.recent_runs(RECENT_RUNS).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Channel Pipeline: Store Stats");
    println!("==============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Records:     {}", counts.records);
    println!(
        "  With media:  {} ({} enriched, {} pending)",
        counts.media_records,
        counts.enriched_records,
        (counts.media_records - counts.enriched_records).max(0)
    );
    println!("  Detections:  {}", counts.detections);

    if !channels.is_empty() {
        println!();
        println!(
            "  {:<24} {:>8} {:>8} {:>10}",
            "CHANNEL", "RECORDS", "MEDIA", "DETECTIONS"
        );
        for c in &channels {
            println!(
                "  {:<24} {:>8} {:>8} {:>10}",
                c.channel, c.records, c.media_records, c.detections
            );
        }
    }

    if !runs.is_empty() {
        println!();
        println!("  Recent runs:");
        for run in &runs {
            let finished = run
                .finished_at
                .map(format_ts_relative)
                .unwrap_or_else(|| "in progress".to_string());
            println!(
                "  {}  {:<10} started {}  finished {}",
                &run.id[..8.min(run.id.len())],
                run.status,
                format_ts_relative(run.started_at),
                finished
            );
            if let Some(err) = &run.error {
                println!("      {}", err);
            }
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        format_ts_iso(ts)
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_human_readable() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn relative_times() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 3 * 3600), "3 hours ago");
        assert_eq!(format_ts_relative(now - 86400), "1 day ago");
        assert_eq!(format_ts_relative(0), "1970-01-01 00:00");
    }
}
