//! Batch-job plumbing shared by every pipeline stage: CLI options, the
//! mutex-guarded run tally, and the end-of-run report whose
//! [`succeeded`](RunReport::succeeded) drives the process exit code.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::truncate_message;
use crate::models::TokenUsage;
use crate::progress::ProgressMode;

/// Options every batch job understands.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Stop after this many contacts (`--test`).
    pub limit: Option<usize>,
    /// Recompute contacts that already carry the derived field.
    pub force: bool,
    /// Worker pool size; `None` uses the per-job default.
    pub workers: Option<usize>,
    /// Contacts read from the store per page.
    pub page_size: usize,
    /// First contact id to consider (inclusive).
    pub start_from: Option<i64>,
    /// Process exactly one contact.
    pub contact_id: Option<i64>,
    pub progress: ProgressMode,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            limit: None,
            force: false,
            workers: None,
            page_size: 1000,
            start_from: None,
            contact_id: None,
            progress: ProgressMode::Off,
        }
    }
}

impl JobOptions {
    /// Exclusive keyset cursor for the first page.
    pub fn initial_cursor(&self) -> i64 {
        self.start_from.map(|id| id - 1).unwrap_or(i64::MIN)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunTally {
    pub processed: u64,
    pub succeeded: u64,
    pub skipped: u64,
    pub errors: u64,
    /// dimension -> label -> count (e.g. `closeness -> dormant -> 12`).
    pub distributions: BTreeMap<String, BTreeMap<String, u64>>,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    /// Most recent failures, `(contact id, message)`.
    pub recent_errors: Vec<(i64, String)>,
}

const MAX_RECENT_ERRORS: usize = 20;

/// Counters shared by all workers of a run. Used only for reporting; no
/// worker reads it to decide what to do next.
#[derive(Debug, Default)]
pub struct RunStats {
    tally: Mutex<RunTally>,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut RunTally) -> R) -> R {
        let mut guard = match self.tally.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Record a successful contact and the labels it produced.
    pub fn record_success(&self, labels: &[(&str, String)]) -> u64 {
        self.with(|t| {
            t.processed += 1;
            t.succeeded += 1;
            for (dimension, value) in labels {
                *t.distributions
                    .entry(dimension.to_string())
                    .or_default()
                    .entry(value.clone())
                    .or_default() += 1;
            }
            t.processed
        })
    }

    pub fn record_skip(&self) {
        self.with(|t| t.skipped += 1);
    }

    pub fn record_error(&self, contact_id: i64, message: &str) -> u64 {
        let short = truncate_message(message, 200);
        warn!(contact_id, error = %short, "contact failed");
        self.with(|t| {
            t.processed += 1;
            t.errors += 1;
            if t.recent_errors.len() >= MAX_RECENT_ERRORS {
                t.recent_errors.remove(0);
            }
            t.recent_errors.push((contact_id, short));
            t.processed
        })
    }

    pub fn add_usage(&self, usage: TokenUsage, cost_usd: f64) {
        self.with(|t| {
            t.usage.add(usage);
            t.cost_usd += cost_usd;
        });
    }

    pub fn snapshot(&self) -> RunTally {
        self.with(|t| t.clone())
    }
}

/// True when the error count stays under `max_error_rate` of processed
/// contacts, with a floor of one contact for small runs.
pub fn within_error_budget(errors: u64, processed: u64, max_error_rate: f64) -> bool {
    let budget = (processed as f64 * max_error_rate).max(1.0);
    (errors as f64) < budget
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub job: String,
    #[serde(flatten)]
    pub tally: RunTally,
    #[serde(skip)]
    pub elapsed: Duration,
    pub max_error_rate: f64,
    /// Set when the run stopped early on Ctrl-C.
    pub interrupted: bool,
}

impl RunReport {
    pub fn finish(job: &str, stats: &RunStats, started: Instant, max_error_rate: f64) -> Self {
        Self {
            job: job.to_string(),
            tally: stats.snapshot(),
            elapsed: started.elapsed(),
            max_error_rate,
            interrupted: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        within_error_budget(self.tally.errors, self.tally.processed, self.max_error_rate)
    }

    pub fn print(&self) {
        print!("{}", self.render());
    }

    /// The end-of-run summary printed by [`print`](Self::print).
    pub fn render(&self) -> String {
        let t = &self.tally;
        let mut out = Vec::new();
        out.push(self.job.clone());
        out.push(format!("  processed: {}", t.processed));
        out.push(format!("  succeeded: {}", t.succeeded));
        out.push(format!("  skipped: {}", t.skipped));
        out.push(format!("  errors: {}", t.errors));
        if t.usage.total() > 0 {
            out.push(format!(
                "  tokens: {} ({} prompt, {} completion)",
                t.usage.total(),
                t.usage.prompt_tokens,
                t.usage.completion_tokens
            ));
            out.push(format!("  est. cost: ${:.4}", t.cost_usd));
        }
        for (dimension, counts) in &t.distributions {
            out.push(format!("  {}:", dimension));
            let mut sorted: Vec<(&String, &u64)> = counts.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
            for (label, count) in sorted {
                out.push(format!("    {:<24} {:>6}", label, count));
            }
        }
        if !t.recent_errors.is_empty() {
            out.push("  recent errors:".to_string());
            for (id, msg) in &t.recent_errors {
                out.push(format!("    contact {}: {}", id, msg));
            }
        }
        out.push(format!("  elapsed: {:.1}s", self.elapsed.as_secs_f64()));
        if self.interrupted {
            out.push("  interrupted: yes (in-flight contacts were allowed to finish)".to_string());
        }
        out.push(format!(
            "  status: {}",
            if self.succeeded() { "ok" } else { "FAILED" }
        ));
        let mut text = out.join("\n");
        text.push('\n');
        text
    }
}
