//! Coverage overview of the derived layer.
//!
//! `rapport stats` shows how far each job has got: how many contacts carry a
//! comms summary, embeddings, an intelligence profile, an overlap analysis
//! and a closeness label, plus the tier and closeness distributions.

use anyhow::Result;

use crate::config::Config;
use crate::store::{CoverageStats, SqliteStore, Store};

fn percent(part: i64, whole: i64) -> i64 {
    if whole > 0 {
        (part * 100) / whole
    } else {
        0
    }
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

/// Render the coverage table. Separate from printing so tests can check it.
pub fn render(stats: &CoverageStats) -> String {
    let mut out = Vec::new();
    let total = stats.contacts;
    out.push(format!("  Contacts:            {}", total));
    out.push(format!("  Threads:             {}", stats.threads));
    out.push(String::new());
    for (label, count) in [
        ("Comms summary", stats.with_comms_summary),
        ("Profile embedding", stats.with_profile_embedding),
        ("Interests embedding", stats.with_interests_embedding),
        ("Intelligence tags", stats.tagged),
        ("Overlap analysis", stats.with_shared_institutions),
        ("Closeness", stats.with_closeness),
    ] {
        out.push(format!(
            "  {:<20} {} / {} ({}%)",
            format!("{}:", label),
            count,
            total,
            percent(count, total)
        ));
    }

    for (heading, rows) in [
        ("By proximity tier:", &stats.proximity_tiers),
        ("By closeness:", &stats.closeness_labels),
    ] {
        if rows.is_empty() {
            continue;
        }
        out.push(String::new());
        out.push(format!("  {}", heading));
        for (label, count) in rows {
            out.push(format!("    {:<22} {:>6}", label, count));
        }
    }
    out.join("\n")
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let stats = store.coverage().await?;
    store.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("rapport: coverage");
    println!("=================");
    println!();
    println!("  Database:            {}", config.db.path.display());
    println!("  Size:                {}", format_bytes(db_size));
    println!();
    println!("{}", render(&stats));
    println!();
    Ok(())
}
