//! Communication aggregator: reduce a contact's threads to one
//! [`CommsSummary`].
//!
//! Summaries are recomputed wholesale from the thread rows on every run,
//! never merged, so a rerun over unchanged threads writes byte-identical
//! JSON.

use anyhow::Result;
use chrono::{Datelike, NaiveDate};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::info;

use crate::config::Config;
use crate::job::{JobOptions, RunReport, RunStats};
use crate::models::{Channel, ChannelStats, CommsSummary, CommunicationThread, Direction};
use crate::progress::ProgressEvent;
use crate::store::{SqliteStore, Store};

const JOB: &str = "comms summarize";

/// Months of activity in the latest year up to which the narrative keeps
/// month granularity.
const MAX_MONTHS_DETAILED: usize = 3;

fn pct(numerator: u32, denominator: u32) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    let raw = numerator as f64 * 100.0 / denominator as f64;
    (raw * 10.0).round() / 10.0
}

fn min_date(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Option<NaiveDate> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

fn max_date(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Option<NaiveDate> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    }
}

/// Build the summary for one contact's threads.
pub fn summarize(threads: &[CommunicationThread]) -> CommsSummary {
    let mut per_channel: BTreeMap<Channel, ChannelStats> = BTreeMap::new();
    let mut bidirectional = 0u32;

    for t in threads {
        let stats = per_channel.entry(t.channel).or_default();
        stats.threads += 1;
        stats.messages += t.message_count;

        let first = t.first_message_at.map(|d| d.date_naive());
        let last = t.last_message_at.map(|d| d.date_naive());
        stats.first_date = min_date(stats.first_date, min_date(first, last));
        stats.last_date = max_date(stats.last_date, max_date(first, last));

        match t.direction {
            Direction::Inbound => stats.inbound += 1,
            Direction::Outbound => stats.outbound += 1,
            Direction::Bidirectional => {
                stats.bidirectional += 1;
                bidirectional += 1;
            }
            Direction::Unknown => {}
        }
        if t.channel == Channel::Email {
            *stats.group_threads.get_or_insert(0) += t.is_group as u32;
        }
    }

    let total_threads: u32 = per_channel.values().map(|s| s.threads).sum();
    let total_messages: u32 = per_channel.values().map(|s| s.messages).sum();

    let (email_threads, email_groups) = per_channel
        .get(&Channel::Email)
        .map(|s| (s.threads, s.group_threads.unwrap_or(0)))
        .unwrap_or((0, 0));

    let mut first_contact_date = None;
    let mut last_contact_date = None;
    let mut most_recent: Option<(Channel, NaiveDate)> = None;
    for channel in Channel::ALL {
        let Some(stats) = per_channel.get(&channel) else {
            continue;
        };
        first_contact_date = min_date(first_contact_date, stats.first_date);
        last_contact_date = max_date(last_contact_date, stats.last_date);
        if let Some(last) = stats.last_date {
            // strict comparison: ties keep the earlier channel
            if most_recent.map(|(_, d)| last > d).unwrap_or(true) {
                most_recent = Some((channel, last));
            }
        }
    }

    CommsSummary {
        total_threads,
        total_messages,
        channels: per_channel
            .into_iter()
            .map(|(channel, stats)| (channel.key().to_string(), stats))
            .collect(),
        first_contact_date,
        last_contact_date,
        bidirectional_pct: pct(bidirectional, total_threads),
        group_thread_pct: pct(email_groups, email_threads),
        most_recent_channel: most_recent.map(|(c, _)| c.key().to_string()),
        chronological_summary: narrative(threads),
    }
}

/// Human-readable activity history, oldest period first, e.g.
/// `"3 emails in 2024, 1 LinkedIn DM in Jan 2025"`.
///
/// Threads are placed by their last-message date; undated threads are left
/// out. The most recent year is broken down by month when it spans at most
/// three distinct months; every other year is a single yearly count.
pub fn narrative(threads: &[CommunicationThread]) -> String {
    let dated: Vec<(NaiveDate, Channel)> = threads
        .iter()
        .filter_map(|t| t.last_message_at.map(|d| (d.date_naive(), t.channel)))
        .collect();

    let Some(latest_year) = dated.iter().map(|(d, _)| d.year()).max() else {
        return "No dated communication".to_string();
    };

    let latest_months: BTreeSet<u32> = dated
        .iter()
        .filter(|(d, _)| d.year() == latest_year)
        .map(|(d, _)| d.month())
        .collect();
    let monthly = latest_months.len() <= MAX_MONTHS_DETAILED;

    // (year, month) with month 0 meaning "whole year"
    let mut periods: BTreeMap<(i32, u32), BTreeMap<Channel, usize>> = BTreeMap::new();
    for (date, channel) in &dated {
        let month = if monthly && date.year() == latest_year {
            date.month()
        } else {
            0
        };
        *periods
            .entry((date.year(), month))
            .or_default()
            .entry(*channel)
            .or_default() += 1;
    }

    let mut parts = Vec::new();
    for ((year, month), counts) in &periods {
        let period = match NaiveDate::from_ymd_opt(*year, *month, 1) {
            Some(first_of_month) => first_of_month.format("%b %Y").to_string(),
            None => year.to_string(),
        };
        for (channel, count) in counts {
            parts.push(format!("{} {} in {}", count, channel.label(*count), period));
        }
    }
    parts.join(", ")
}

/// `rapport comms summarize`: open the database, run, print the summary.
pub async fn cmd_summarize(config: &Config, opts: &JobOptions) -> Result<RunReport> {
    let store = SqliteStore::open(config).await?;
    let report = run_summarize(&store, opts, config.tagger.max_error_rate).await?;
    report.print();
    store.close().await;
    Ok(report)
}

/// Summarize every contact that owns threads (or just `opts.contact_id`).
pub async fn run_summarize(
    store: &dyn Store,
    opts: &JobOptions,
    max_error_rate: f64,
) -> Result<RunReport> {
    let started = Instant::now();
    let stats = RunStats::new();
    let reporter = opts.progress.reporter();
    let mut remaining = opts.limit.unwrap_or(usize::MAX);

    let mut cursor = opts.initial_cursor();
    let mut exhausted = false;
    while !exhausted && remaining > 0 {
        let ids = match opts.contact_id {
            Some(id) => {
                exhausted = true;
                vec![id]
            }
            None => store.contacts_with_threads(cursor, opts.page_size).await?,
        };
        let Some(&last) = ids.last() else {
            break;
        };
        cursor = last;

        for id in ids {
            if remaining == 0 {
                break;
            }
            remaining -= 1;
            summarize_one(store, id, &stats).await;
        }

        let t = stats.snapshot();
        reporter.report(ProgressEvent {
            job: JOB.to_string(),
            done: t.processed,
            total: None,
            errors: t.errors,
        });
    }

    let report = RunReport::finish(JOB, &stats, started, max_error_rate);
    info!(
        processed = report.tally.processed,
        errors = report.tally.errors,
        "comms summaries written"
    );
    Ok(report)
}

async fn summarize_one(store: &dyn Store, contact_id: i64, stats: &RunStats) {
    let threads = match store.threads_for_contact(contact_id).await {
        Ok(t) => t,
        Err(e) => {
            stats.record_error(contact_id, &format!("read threads: {:#}", e));
            return;
        }
    };
    let summary = summarize(&threads);
    match store.write_comms_summary(contact_id, &summary).await {
        Ok(()) => {
            let channel = summary
                .most_recent_channel
                .clone()
                .unwrap_or_else(|| "undated".to_string());
            stats.record_success(&[("most_recent_channel", channel)]);
        }
        Err(e) => {
            stats.record_error(contact_id, &format!("write summary: {:#}", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_timestamp;
    use crate::store::InMemoryStore;
    use crate::models::Contact;

    fn thread(channel: &str, direction: &str, last: Option<&str>, messages: u32) -> CommunicationThread {
        CommunicationThread {
            contact_id: 1,
            channel: Channel::parse(channel),
            direction: Direction::parse(direction),
            is_group: false,
            message_count: messages,
            first_message_at: None,
            last_message_at: last.and_then(parse_timestamp),
        }
    }

    fn example_threads() -> Vec<CommunicationThread> {
        vec![
            thread("email", "outbound", Some("2024-03-01"), 2),
            thread("email", "bidirectional", Some("2024-07-10"), 5),
            thread("email", "inbound", Some("2024-11-02"), 1),
            thread("linkedin", "bidirectional", Some("2025-01-15"), 4),
        ]
    }

    #[test]
    fn narrative_collapses_old_years_and_details_latest() {
        assert_eq!(
            narrative(&example_threads()),
            "3 emails in 2024, 1 LinkedIn DM in Jan 2025"
        );
    }

    #[test]
    fn narrative_collapses_busy_latest_year() {
        let threads = vec![
            thread("sms", "outbound", Some("2025-01-02"), 1),
            thread("sms", "outbound", Some("2025-02-02"), 1),
            thread("sms", "outbound", Some("2025-03-02"), 1),
            thread("email", "outbound", Some("2025-04-02"), 1),
        ];
        assert_eq!(narrative(&threads), "1 email in 2025, 3 SMS in 2025");
    }

    #[test]
    fn narrative_month_order_and_channel_order() {
        let threads = vec![
            thread("sms", "outbound", Some("2025-03-09"), 1),
            thread("email", "outbound", Some("2025-01-20"), 1),
            thread("email", "outbound", Some("2025-01-05"), 1),
            thread("linkedin", "outbound", Some("2025-03-01"), 1),
        ];
        assert_eq!(
            narrative(&threads),
            "2 emails in Jan 2025, 1 LinkedIn DM in Mar 2025, 1 SMS in Mar 2025"
        );
    }

    #[test]
    fn narrative_without_dates() {
        let threads = vec![thread("email", "inbound", None, 3)];
        assert_eq!(narrative(&threads), "No dated communication");
        assert_eq!(narrative(&[]), "No dated communication");
    }

    #[test]
    fn totals_equal_channel_sums() {
        let mut threads = example_threads();
        threads.push(thread("carrier pigeon", "inbound", None, 7));
        let s = summarize(&threads);
        assert_eq!(s.total_threads, 5);
        assert_eq!(s.total_messages, 19);
        assert_eq!(
            s.total_threads,
            s.channels.values().map(|c| c.threads).sum::<u32>()
        );
        assert_eq!(
            s.total_messages,
            s.channels.values().map(|c| c.messages).sum::<u32>()
        );
        assert_eq!(s.channels["other"].threads, 1);
        // undated thread counted but not narrated
        assert_eq!(s.chronological_summary, "3 emails in 2024, 1 LinkedIn DM in Jan 2025");
    }

    #[test]
    fn percentages_and_recency() {
        let mut threads = example_threads();
        threads[0].is_group = true;
        let s = summarize(&threads);
        assert_eq!(s.bidirectional_pct, 50.0);
        assert_eq!(s.group_thread_pct, 33.3);
        assert_eq!(s.most_recent_channel.as_deref(), Some("linkedin"));
        assert_eq!(s.first_contact_date, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(s.last_contact_date, NaiveDate::from_ymd_opt(2025, 1, 15));
        assert_eq!(s.channels["email"].group_threads, Some(1));
        assert_eq!(s.channels["linkedin"].group_threads, None);
    }

    #[test]
    fn empty_denominators_give_zero() {
        let s = summarize(&[thread("sms", "inbound", Some("2024-01-01"), 1)]);
        assert_eq!(s.group_thread_pct, 0.0);
        assert_eq!(s.bidirectional_pct, 0.0);

        let empty = summarize(&[]);
        assert_eq!(empty.total_threads, 0);
        assert_eq!(empty.bidirectional_pct, 0.0);
        assert!(empty.most_recent_channel.is_none());
    }

    #[test]
    fn summary_is_byte_stable() {
        let a = serde_json::to_string(&summarize(&example_threads())).unwrap();
        let b = serde_json::to_string(&summarize(&example_threads())).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn job_writes_summary_and_mirrors() {
        let store = InMemoryStore::new();
        store
            .upsert_contact(&Contact {
                id: 1,
                first_name: "Lee".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        for t in example_threads() {
            store.insert_thread(&t).await.unwrap();
        }

        let report = run_summarize(&store, &JobOptions::default(), 0.05)
            .await
            .unwrap();
        assert_eq!(report.tally.succeeded, 1);
        assert!(report.succeeded());

        let mirrors = store.mirror_columns(1).await.unwrap();
        assert_eq!(mirrors.comms_thread_count, Some(4));
        assert_eq!(mirrors.comms_last_date.as_deref(), Some("2025-01-15"));
    }

    #[tokio::test]
    async fn threads_for_unknown_contact_count_as_error() {
        let store = InMemoryStore::new();
        let mut orphan = thread("email", "inbound", Some("2024-01-01"), 1);
        orphan.contact_id = 42;
        store.insert_thread(&orphan).await.unwrap();

        let report = run_summarize(&store, &JobOptions::default(), 0.05)
            .await
            .unwrap();
        assert_eq!(report.tally.errors, 1);
        assert!(!report.succeeded());
    }
}
