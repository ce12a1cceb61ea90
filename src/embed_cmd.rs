//! `rapport embed`: build profile and interests vectors for contacts.
//!
//! Contacts are read page by page in id order. Each page is split into
//! batches of `embedding.batch_size`; a batch costs at most two service
//! calls (one for profile documents, one for the non-empty interests
//! documents). Requests are issued sequentially.

use anyhow::{bail, Result};
use std::time::Instant;
use tracing::{info, warn};

use crate::config::Config;
use crate::documents::{interests_text, profile_text};
use crate::embedding::{self, EmbeddingProvider};
use crate::error::ServiceError;
use crate::job::{JobOptions, RunReport, RunStats};
use crate::models::{Contact, TokenUsage};
use crate::progress::ProgressEvent;
use crate::retry::RetryPolicy;
use crate::store::{SqliteStore, Store};

const JOB: &str = "embed";

/// Settings the embedding loop needs, lifted out of [`Config`] so tests
/// can tune them directly.
#[derive(Debug, Clone)]
pub struct EmbedSettings {
    pub batch_size: usize,
    pub dims: usize,
    pub cost_per_mtok: f64,
    pub retry: RetryPolicy,
    pub max_error_rate: f64,
}

impl EmbedSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.embedding.batch_size,
            dims: config.embedding.dims,
            cost_per_mtok: config.embedding.cost_per_mtok,
            retry: config.retry.policy(),
            max_error_rate: config.tagger.max_error_rate,
        }
    }
}

/// CLI entry point: validate config, open the store, run, print.
pub async fn cmd_embed(config: &Config, opts: &JobOptions, dry_run: bool) -> Result<RunReport> {
    let store = SqliteStore::open(config).await?;

    if dry_run {
        let (pending, embedded) = count_pending(&store, opts).await?;
        println!("embed (dry-run)");
        println!("  contacts needing embeddings: {}", pending);
        println!("  already embedded: {}", embedded);
        store.close().await;
        return Ok(RunReport::finish(
            JOB,
            &RunStats::new(),
            Instant::now(),
            config.tagger.max_error_rate,
        ));
    }

    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    let provider = embedding::create_provider(&config.embedding)?;

    let report = run_embed(
        &store,
        provider.as_ref(),
        &EmbedSettings::from_config(config),
        opts,
    )
    .await?;
    report.print();
    store.close().await;
    Ok(report)
}

/// Contacts the job would pick up, without calling the service.
pub async fn count_pending(store: &dyn Store, opts: &JobOptions) -> Result<(u64, u64)> {
    let mut pending = 0u64;
    let mut embedded = 0u64;
    for contact in select_contacts(store, opts).await? {
        if needs_embedding(&contact, opts) {
            pending += 1;
        } else {
            embedded += 1;
        }
    }
    Ok((pending, embedded))
}

fn needs_embedding(contact: &Contact, opts: &JobOptions) -> bool {
    opts.force || opts.contact_id.is_some() || !contact.has_profile_embedding
}

/// Every contact in scope for this run, in id order. `--test` is applied
/// later so it counts contacts embedded, not contacts skipped.
async fn select_contacts(store: &dyn Store, opts: &JobOptions) -> Result<Vec<Contact>> {
    if let Some(id) = opts.contact_id {
        return match store.get_contact(id).await? {
            Some(c) => Ok(vec![c]),
            None => bail!("contact {} not found", id),
        };
    }
    let mut all = Vec::new();
    let mut cursor = opts.initial_cursor();
    loop {
        let page = store.list_contacts(cursor, opts.page_size).await?;
        let Some(last) = page.last() else {
            break;
        };
        cursor = last.id;
        all.extend(page);
    }
    Ok(all)
}

/// Run the embedding job against any store and provider.
pub async fn run_embed(
    store: &dyn Store,
    provider: &dyn EmbeddingProvider,
    settings: &EmbedSettings,
    opts: &JobOptions,
) -> Result<RunReport> {
    let started = Instant::now();
    let stats = RunStats::new();
    let reporter = opts.progress.reporter();
    let batch_size = settings.batch_size.max(1);
    let mut remaining = opts.limit.unwrap_or(usize::MAX);

    info!(model = provider.model_name(), dims = settings.dims, "starting embedding run");

    let mut cursor = opts.initial_cursor();
    let mut exhausted = false;
    while !exhausted && remaining > 0 {
        let page = match opts.contact_id {
            Some(_) => {
                exhausted = true;
                select_contacts(store, opts).await?
            }
            None => store.list_contacts(cursor, opts.page_size).await?,
        };
        let Some(last) = page.last() else {
            break;
        };
        cursor = last.id;

        let mut pending = Vec::new();
        for contact in page {
            if !needs_embedding(&contact, opts) {
                stats.record_skip();
                continue;
            }
            if remaining == 0 {
                break;
            }
            remaining -= 1;
            pending.push(contact);
        }

        for batch in pending.chunks(batch_size) {
            embed_batch(store, provider, settings, batch, &stats).await;
        }

        let t = stats.snapshot();
        reporter.report(ProgressEvent {
            job: JOB.to_string(),
            done: t.processed,
            total: None,
            errors: t.errors,
        });
    }

    Ok(RunReport::finish(JOB, &stats, started, settings.max_error_rate))
}

struct BatchVectors {
    profile: Vec<Vec<f32>>,
    interests: Vec<Option<Vec<f32>>>,
    usage: TokenUsage,
}

fn check_dims(vectors: &[Vec<f32>], expected_count: usize, dims: usize) -> Result<(), ServiceError> {
    if vectors.len() != expected_count {
        return Err(ServiceError::Schema(format!(
            "expected {} embeddings, got {}",
            expected_count,
            vectors.len()
        )));
    }
    match vectors.iter().find(|v| v.len() != dims) {
        Some(bad) => Err(ServiceError::Dimension {
            expected: dims,
            got: bad.len(),
        }),
        None => Ok(()),
    }
}

async fn request_vectors(
    provider: &dyn EmbeddingProvider,
    settings: &EmbedSettings,
    batch: &[Contact],
) -> Result<BatchVectors, ServiceError> {
    let profile_texts: Vec<String> = batch.iter().map(profile_text).collect();
    let texts = &profile_texts;
    let profile = settings
        .retry
        .run("embed profile", move || provider.embed(texts))
        .await?;
    check_dims(&profile.vectors, batch.len(), settings.dims)?;
    let mut usage = profile.usage;

    let interest_docs: Vec<(usize, String)> = batch
        .iter()
        .enumerate()
        .map(|(i, c)| (i, interests_text(c)))
        .filter(|(_, text)| !text.is_empty())
        .collect();

    let mut interests = vec![None; batch.len()];
    if !interest_docs.is_empty() {
        let interest_texts: Vec<String> = interest_docs.iter().map(|(_, t)| t.clone()).collect();
        let texts = &interest_texts;
        let result = settings
            .retry
            .run("embed interests", move || provider.embed(texts))
            .await?;
        check_dims(&result.vectors, interest_texts.len(), settings.dims)?;
        usage.add(result.usage);
        for ((index, _), vec) in interest_docs.iter().zip(result.vectors) {
            interests[*index] = Some(vec);
        }
    }

    Ok(BatchVectors {
        profile: profile.vectors,
        interests,
        usage,
    })
}

async fn embed_batch(
    store: &dyn Store,
    provider: &dyn EmbeddingProvider,
    settings: &EmbedSettings,
    batch: &[Contact],
    stats: &RunStats,
) {
    let vectors = match request_vectors(provider, settings, batch).await {
        Ok(v) => v,
        Err(e) => {
            warn!(contacts = batch.len(), error = %e, "embedding batch abandoned");
            for contact in batch {
                stats.record_error(contact.id, &format!("batch failed: {}", e));
            }
            return;
        }
    };

    let cost = vectors.usage.prompt_tokens as f64 * settings.cost_per_mtok / 1_000_000.0;
    stats.add_usage(vectors.usage, cost);

    for ((contact, profile), interests) in batch
        .iter()
        .zip(vectors.profile.iter())
        .zip(vectors.interests.iter())
    {
        match store
            .write_embeddings(contact.id, profile, interests.as_deref())
            .await
        {
            Ok(()) => {
                let state = if interests.is_some() { "embedded" } else { "absent" };
                stats.record_success(&[("interests", state.to_string())]);
            }
            Err(e) => {
                stats.record_error(contact.id, &format!("write failed: {:#}", e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::store::InMemoryStore;
    use crate::embedding::EmbeddingBatch;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Returns constant vectors; optionally fails the first N calls.
    struct FakeProvider {
        dims: usize,
        wrong_dims: bool,
        rate_limited_calls: usize,
        calls: AtomicUsize,
        batch_sizes: Mutex<Vec<usize>>,
    }

    impl FakeProvider {
        fn new(dims: usize) -> Self {
            Self {
                dims,
                wrong_dims: false,
                rate_limited_calls: 0,
                calls: AtomicUsize::new(0),
                batch_sizes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FakeProvider {
        fn model_name(&self) -> &str {
            "fake"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch, ServiceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.rate_limited_calls {
                return Err(ServiceError::RateLimited("429".into()));
            }
            self.batch_sizes.lock().unwrap().push(texts.len());
            let len = if self.wrong_dims { self.dims - 1 } else { self.dims };
            Ok(EmbeddingBatch {
                vectors: texts.iter().map(|_| vec![0.5; len]).collect(),
                usage: TokenUsage {
                    prompt_tokens: 10 * texts.len() as u64,
                    completion_tokens: 0,
                },
            })
        }
    }

    fn settings() -> EmbedSettings {
        EmbedSettings {
            batch_size: 2,
            dims: 8,
            cost_per_mtok: 0.02,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                multiplier: 2.0,
                flat_delay: Duration::from_millis(1),
                retry_on: vec![ErrorClass::RateLimit, ErrorClass::Transient],
            },
            max_error_rate: 0.05,
        }
    }

    async fn seeded(n: i64) -> InMemoryStore {
        let store = InMemoryStore::new();
        for id in 1..=n {
            let contact = Contact {
                id,
                first_name: format!("Person{}", id),
                last_name: "Test".into(),
                headline: (id % 2 == 0).then(|| "Trail builder".to_string()),
                ..Default::default()
            };
            store.upsert_contact(&contact).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn embeds_in_batches_and_skips_empty_interests() {
        let store = seeded(3).await;
        let provider = FakeProvider::new(8);
        let report = run_embed(&store, &provider, &settings(), &JobOptions::default())
            .await
            .unwrap();

        assert_eq!(report.tally.succeeded, 3);
        assert!(report.succeeded());
        // batch [1,2]: profile(2) + interests(1); batch [3]: profile(1)
        assert_eq!(*provider.batch_sizes.lock().unwrap(), vec![2, 1, 1]);

        let e1 = store.embeddings(1).await.unwrap();
        assert_eq!(e1.profile.unwrap().len(), 8);
        assert!(e1.interests.is_none());
        assert_eq!(store.embeddings(2).await.unwrap().interests.unwrap().len(), 8);
        assert_eq!(report.tally.usage.prompt_tokens, 40);
    }

    #[tokio::test]
    async fn existing_vectors_skipped_unless_forced() {
        let store = seeded(2).await;
        let provider = FakeProvider::new(8);
        run_embed(&store, &provider, &settings(), &JobOptions::default())
            .await
            .unwrap();

        let again = run_embed(&store, &provider, &settings(), &JobOptions::default())
            .await
            .unwrap();
        assert_eq!(again.tally.processed, 0);
        assert_eq!(again.tally.skipped, 2);

        let forced = JobOptions {
            force: true,
            ..Default::default()
        };
        let report = run_embed(&store, &provider, &settings(), &forced).await.unwrap();
        assert_eq!(report.tally.succeeded, 2);
    }

    #[tokio::test]
    async fn dimension_mismatch_abandons_batch() {
        let store = seeded(3).await;
        let mut provider = FakeProvider::new(8);
        provider.wrong_dims = true;
        let report = run_embed(&store, &provider, &settings(), &JobOptions::default())
            .await
            .unwrap();
        assert_eq!(report.tally.errors, 3);
        assert!(!report.succeeded());
        assert!(store.embeddings(1).await.unwrap().profile.is_none());
    }

    #[tokio::test]
    async fn rate_limit_retried_then_succeeds() {
        let store = seeded(1).await;
        let mut provider = FakeProvider::new(8);
        provider.rate_limited_calls = 2;
        let report = run_embed(&store, &provider, &settings(), &JobOptions::default())
            .await
            .unwrap();
        assert_eq!(report.tally.succeeded, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_limit_and_start_from() {
        let store = seeded(5).await;
        let provider = FakeProvider::new(8);
        let opts = JobOptions {
            limit: Some(2),
            start_from: Some(3),
            ..Default::default()
        };
        let report = run_embed(&store, &provider, &settings(), &opts).await.unwrap();
        assert_eq!(report.tally.succeeded, 2);
        assert!(store.embeddings(2).await.unwrap().profile.is_none());
        assert!(store.embeddings(3).await.unwrap().profile.is_some());
        assert!(store.embeddings(4).await.unwrap().profile.is_some());
        assert!(store.embeddings(5).await.unwrap().profile.is_none());
    }

    #[tokio::test]
    async fn dry_run_counts_without_calls() {
        let store = seeded(3).await;
        store.write_embeddings(1, &[0.1; 8], None).await.unwrap();
        let (pending, embedded) = count_pending(&store, &JobOptions::default()).await.unwrap();
        assert_eq!((pending, embedded), (2, 1));
    }
}
