//! Structured intelligence tagging.
//!
//! Three variants share one shape: build a context document for a
//! contact, ask the completion service for JSON matching a strict schema,
//! decode it into closed Rust types, and persist the result.
//!
//! | Variant | Module | Writes |
//! |---------|--------|--------|
//! | A: profile | [`profile`] | `ai_tags` + denormalized mirrors |
//! | B: overlap | [`overlap`] | `shared_institutions` |
//! | C: closeness | [`closeness`] | `comms_closeness`, `comms_momentum`, `comms_reasoning` |
//!
//! [`run_variant`] drives any [`Variant`] through a bounded worker pool:
//! one task per contact, at most `workers` in flight, a shared
//! [`RunStats`] for reporting only. Ctrl-C stops dispatch; tasks already
//! running finish normally and their results are kept.

pub mod anchor;
pub mod closeness;
pub mod overlap;
pub mod profile;
pub mod schema;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::completion::{self, CompletionRequest, CompletionService};
use crate::config::{CompletionConfig, Config};
use crate::error::ServiceError;
use crate::job::{JobOptions, RunReport, RunStats};
use crate::models::{Contact, TokenUsage};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::retry::RetryPolicy;
use crate::store::{SqliteStore, Store};

/// What a variant wants done with a contact it was offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Process,
    /// Already tagged, or filtered out by the variant's precondition.
    Skip,
}

/// Result of one processed contact.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    /// `(dimension, label)` pairs tallied into the run distributions.
    pub labels: Vec<(&'static str, String)>,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait Variant: Send + Sync + 'static {
    /// Job name used in progress lines and the summary header.
    fn job(&self) -> &'static str;

    fn select(&self, contact: &Contact, force: bool) -> Selection;

    /// Tag one contact and persist the result.
    async fn process(&self, contact: Contact) -> Result<Outcome>;
}

/// Shared dependencies of every variant.
#[derive(Clone)]
pub struct TaggerDeps {
    pub store: Arc<dyn Store>,
    pub service: Arc<dyn CompletionService>,
    pub retry: RetryPolicy,
}

/// Pool settings for one run.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub progress_every: u64,
    pub max_error_rate: f64,
    pub pricing: CompletionConfig,
}

impl PoolSettings {
    pub fn from_config(config: &Config, default_workers: usize, opts: &JobOptions) -> Self {
        Self {
            workers: opts.workers.unwrap_or(default_workers).max(1),
            progress_every: config.tagger.progress_every.max(1),
            max_error_rate: config.tagger.max_error_rate,
            pricing: config.completion.clone(),
        }
    }
}

/// Call the service with retries, then decode the content as `T`.
///
/// Only the call is retried. Content that fails to decode is a
/// [`ServiceError::Schema`] and is returned at once.
pub async fn structured_call<T: DeserializeOwned>(
    service: &dyn CompletionService,
    retry: &RetryPolicy,
    request: &CompletionRequest<'_>,
) -> Result<(T, TokenUsage), ServiceError> {
    let completion = retry
        .run(request.schema_name, || service.complete(request))
        .await?;
    let value = serde_json::from_str::<T>(&completion.content)
        .map_err(|e| ServiceError::Schema(e.to_string()))?;
    Ok((value, completion.usage))
}

fn spawn_interrupt_watcher(flag: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight contacts");
            flag.store(true, Ordering::SeqCst);
        }
    })
}

fn report_progress(
    reporter: &dyn ProgressReporter,
    job: &str,
    stats: &RunStats,
) {
    let t = stats.snapshot();
    reporter.report(ProgressEvent {
        job: job.to_string(),
        done: t.processed,
        total: None,
        errors: t.errors,
    });
}

/// Drive `variant` over the contacts selected by `opts`.
pub async fn run_variant<V: Variant>(
    variant: Arc<V>,
    store: Arc<dyn Store>,
    settings: &PoolSettings,
    opts: &JobOptions,
) -> Result<RunReport> {
    let job = variant.job();
    let started = Instant::now();
    let stats = Arc::new(RunStats::new());
    let reporter: Arc<dyn ProgressReporter> = Arc::from(opts.progress.reporter());
    let semaphore = Arc::new(Semaphore::new(settings.workers));
    let interrupted = Arc::new(AtomicBool::new(false));
    let watcher = spawn_interrupt_watcher(interrupted.clone());
    let force = opts.force || opts.contact_id.is_some();
    let mut remaining = opts.limit.unwrap_or(usize::MAX);
    let mut tasks: JoinSet<()> = JoinSet::new();

    info!(job, workers = settings.workers, "starting tagging run");

    let mut cursor = opts.initial_cursor();
    let mut exhausted = false;
    'pages: while !exhausted && remaining > 0 {
        let page = match opts.contact_id {
            Some(id) => {
                exhausted = true;
                match store.get_contact(id).await? {
                    Some(c) => vec![c],
                    None => anyhow::bail!("contact {} not found", id),
                }
            }
            None => store.list_contacts(cursor, opts.page_size).await?,
        };
        let Some(last) = page.last() else {
            break;
        };
        cursor = last.id;

        for contact in page {
            if interrupted.load(Ordering::SeqCst) {
                break 'pages;
            }
            if variant.select(&contact, force) == Selection::Skip {
                stats.record_skip();
                continue;
            }
            if remaining == 0 {
                break 'pages;
            }
            remaining -= 1;

            let permit = semaphore.clone().acquire_owned().await?;
            let variant = variant.clone();
            let stats = stats.clone();
            let reporter = reporter.clone();
            let pricing = settings.pricing.clone();
            let every = settings.progress_every;
            tasks.spawn(async move {
                let contact_id = contact.id;
                // inner task so a panic is charged to this contact
                let result = match tokio::spawn(async move { variant.process(contact).await }).await
                {
                    Ok(result) => result,
                    Err(e) => Err(anyhow::anyhow!("worker task failed: {}", e)),
                };
                let done = match result {
                    Ok(outcome) => {
                        stats.add_usage(outcome.usage, completion::cost_usd(&pricing, outcome.usage));
                        stats.record_success(&outcome.labels)
                    }
                    Err(e) => stats.record_error(contact_id, &format!("{:#}", e)),
                };
                if done % every == 0 {
                    report_progress(reporter.as_ref(), job, &stats);
                }
                drop(permit);
            });

            // reap finished tasks so the set does not grow with the run
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(job, error = %e, "worker task failed");
                }
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(job, error = %e, "worker task failed");
        }
    }
    watcher.abort();
    report_progress(reporter.as_ref(), job, &stats);

    let mut report = RunReport::finish(job, &stats, started, settings.max_error_rate);
    report.interrupted = interrupted.load(Ordering::SeqCst);
    info!(
        job,
        processed = report.tally.processed,
        errors = report.tally.errors,
        "tagging run finished"
    );
    Ok(report)
}

/// Which variant `rapport tag` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagJob {
    Profile,
    Overlap,
    Closeness,
}

/// `rapport tag <variant>`: build the variant from config, run it over the
/// SQLite store, print the summary.
pub async fn cmd_tag(config: &Config, which: TagJob, opts: &JobOptions) -> Result<RunReport> {
    if !config.completion.is_enabled() {
        bail!("Completion provider is disabled. Set [completion] provider in config.");
    }
    let service: Arc<dyn CompletionService> =
        Arc::from(completion::create_completion(&config.completion)?);
    let sqlite = Arc::new(SqliteStore::open(config).await?);
    let store: Arc<dyn Store> = sqlite.clone();
    let deps = TaggerDeps {
        store: store.clone(),
        service,
        retry: config.retry.policy(),
    };

    let t = &config.tagger;
    let report = match which {
        TagJob::Profile => {
            let settings = PoolSettings::from_config(config, t.profile_workers, opts);
            let variant = Arc::new(profile::ProfileTagger::new(deps, &config.anchor));
            run_variant(variant, store, &settings, opts).await?
        }
        TagJob::Overlap => {
            let settings = PoolSettings::from_config(config, t.overlap_workers, opts);
            let variant = Arc::new(overlap::OverlapTagger::new(deps, &config.anchor));
            run_variant(variant, store, &settings, opts).await?
        }
        TagJob::Closeness => {
            let settings = PoolSettings::from_config(config, t.closeness_workers, opts);
            let variant = Arc::new(closeness::ClosenessTagger::new(deps));
            run_variant(variant, store, &settings, opts).await?
        }
    };
    report.print();
    sqlite.close().await;
    Ok(report)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted completion service for variant tests.

    use super::*;
    use crate::completion::Completion;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::error::ErrorClass;

    pub struct ScriptedService {
        responses: Mutex<Vec<Result<String, ServiceError>>>,
        fallback: String,
        pub calls: AtomicUsize,
        pub modes: Mutex<Vec<crate::completion::OutputMode>>,
    }

    impl ScriptedService {
        /// Answers every call with `content`.
        pub fn always(content: impl Into<String>) -> Self {
            Self::scripted(Vec::new(), content)
        }

        /// Pops `responses` front to back, then answers with `fallback`.
        pub fn scripted(responses: Vec<Result<String, ServiceError>>, fallback: impl Into<String>) -> Self {
            Self {
                responses: Mutex::new(responses),
                fallback: fallback.into(),
                calls: AtomicUsize::new(0),
                modes: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionService for ScriptedService {
        fn model_name(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.modes.lock().unwrap().push(request.mode);
            let next = {
                let mut responses = self.responses.lock().unwrap();
                if responses.is_empty() {
                    None
                } else {
                    Some(responses.remove(0))
                }
            };
            let content = match next {
                Some(r) => r?,
                None => self.fallback.clone(),
            };
            Ok(Completion {
                content,
                usage: TokenUsage {
                    prompt_tokens: 100,
                    completion_tokens: 10,
                },
            })
        }
    }

    pub fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            flat_delay: Duration::from_millis(1),
            retry_on: vec![ErrorClass::RateLimit, ErrorClass::Transient],
        }
    }

    pub fn pool(workers: usize) -> PoolSettings {
        PoolSettings {
            workers,
            progress_every: 50,
            max_error_rate: 0.05,
            pricing: CompletionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::intel::ClosenessAssessment;
    use crate::completion::OutputMode;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn structured_call_decodes_content() {
        let service = ScriptedService::always(
            r#"{"closeness":"dormant","momentum":"fading","reasoning":"last email 2021"}"#,
        );
        let schema = serde_json::json!({});
        let req = CompletionRequest {
            system: "s",
            user: "u",
            schema_name: "closeness",
            schema: &schema,
            mode: OutputMode::Strict,
        };
        let (a, usage): (ClosenessAssessment, _) =
            structured_call(&service, &fast_retry(), &req).await.unwrap();
        assert_eq!(crate::intel::label(&a.closeness), "dormant");
        assert_eq!(usage.total(), 110);
    }

    #[tokio::test]
    async fn structured_call_does_not_retry_bad_content() {
        let service = ScriptedService::always(r#"{"closeness":"bestie"}"#);
        let schema = serde_json::json!({});
        let req = CompletionRequest {
            system: "s",
            user: "u",
            schema_name: "closeness",
            schema: &schema,
            mode: OutputMode::Strict,
        };
        let err = structured_call::<ClosenessAssessment>(&service, &fast_retry(), &req)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Schema(_)));
        assert_eq!(service.call_count(), 1);
    }

    #[tokio::test]
    async fn structured_call_retries_rate_limits() {
        let service = ScriptedService::scripted(
            vec![Err(ServiceError::RateLimited("429".into()))],
            r#"{"closeness":"occasional","momentum":"stable","reasoning":"r"}"#,
        );
        let schema = serde_json::json!({});
        let req = CompletionRequest {
            system: "s",
            user: "u",
            schema_name: "closeness",
            schema: &schema,
            mode: OutputMode::Strict,
        };
        let result = structured_call::<ClosenessAssessment>(&service, &fast_retry(), &req).await;
        assert!(result.is_ok());
        assert_eq!(service.call_count(), 2);
    }

    /// Fails contacts with even ids, succeeds on odd ones.
    struct EvenFails;

    #[async_trait]
    impl Variant for EvenFails {
        fn job(&self) -> &'static str {
            "test"
        }
        fn select(&self, contact: &Contact, _force: bool) -> Selection {
            if contact.id == 3 {
                Selection::Skip
            } else {
                Selection::Process
            }
        }
        async fn process(&self, contact: Contact) -> Result<Outcome> {
            if contact.id % 2 == 0 {
                anyhow::bail!("even");
            }
            Ok(Outcome {
                labels: vec![("parity", "odd".to_string())],
                usage: TokenUsage::default(),
            })
        }
    }

    async fn seeded(n: i64) -> Arc<dyn Store> {
        let store = InMemoryStore::new();
        for id in 1..=n {
            store
                .upsert_contact(&Contact {
                    id,
                    first_name: format!("C{}", id),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn pool_isolates_per_contact_errors() {
        let store = seeded(6).await;
        let report = run_variant(Arc::new(EvenFails), store, &pool(3), &JobOptions::default())
            .await
            .unwrap();
        assert_eq!(report.tally.processed, 5);
        assert_eq!(report.tally.errors, 3);
        assert_eq!(report.tally.skipped, 1);
        assert_eq!(report.tally.distributions["parity"]["odd"], 2);
        assert!(!report.succeeded());
    }

    struct PanicsOnTwo;

    #[async_trait]
    impl Variant for PanicsOnTwo {
        fn job(&self) -> &'static str {
            "test"
        }
        fn select(&self, _contact: &Contact, _force: bool) -> Selection {
            Selection::Process
        }
        async fn process(&self, contact: Contact) -> Result<Outcome> {
            if contact.id == 2 {
                panic!("bad contact");
            }
            Ok(Outcome::default())
        }
    }

    #[tokio::test]
    async fn panicking_worker_counts_as_error() {
        let store = seeded(3).await;
        let report = run_variant(Arc::new(PanicsOnTwo), store, &pool(2), &JobOptions::default())
            .await
            .unwrap();
        assert_eq!(report.tally.processed, 3);
        assert_eq!(report.tally.succeeded, 2);
        assert_eq!(report.tally.errors, 1);
        assert_eq!(report.tally.recent_errors[0].0, 2);
        assert!(!report.succeeded());
    }

    #[tokio::test]
    async fn pool_respects_test_limit() {
        let store = seeded(10).await;
        let opts = JobOptions {
            limit: Some(4),
            page_size: 3,
            ..Default::default()
        };
        let report = run_variant(Arc::new(EvenFails), store, &pool(2), &opts)
            .await
            .unwrap();
        // contact 3 is skipped, so 1, 2, 4, 5 are processed
        assert_eq!(report.tally.processed, 4);
        assert_eq!(report.tally.errors, 2);
    }
}
