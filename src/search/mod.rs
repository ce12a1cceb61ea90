//! Read-side retrieval over the derived layer.
//!
//! Two queries, both side-effect free:
//!
//! - [`match_by_interests`] ranks contacts by cosine similarity between a
//!   query vector and their interests embedding, keeping those at or above
//!   a threshold.
//! - [`hybrid_search`] runs a profile-vector ranking and a full-text
//!   ranking independently, each capped at its own candidate count, and
//!   fuses them with [`rrf::fuse`]. Score pre-filters narrow both lists
//!   before fusion.
//!
//! [`run_search`] is the CLI front end for both.

pub mod rrf;

use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

use crate::config::{Config, RetrievalConfig};
use crate::embedding::{create_provider, embed_query};
use crate::store::{ContactCandidate, ContactFilter, SqliteStore, Store, VectorField};

/// A query the caller must fix. The RPC layer answers these with 400.
#[derive(Debug, Error, PartialEq)]
pub enum QueryError {
    #[error("query_embedding must not be empty")]
    EmptyEmbedding,
    #[error("query_embedding must have a non-zero, finite norm")]
    DegenerateEmbedding,
    #[error("query_embedding has {got} dimensions, stored vectors have {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("{0}")]
    Invalid(&'static str),
}

/// Reject query vectors that cannot rank anything: empty, zero or
/// non-finite, or of a different length than the stored `field` vectors.
pub async fn check_embedding(
    store: &dyn Store,
    field: VectorField,
    query_embedding: &[f32],
) -> Result<()> {
    if query_embedding.is_empty() {
        return Err(QueryError::EmptyEmbedding.into());
    }
    let norm: f32 = query_embedding.iter().map(|x| x * x).sum();
    if !norm.is_finite() || norm == 0.0 {
        return Err(QueryError::DegenerateEmbedding.into());
    }
    if let Some(expected) = store.vector_dims(field).await? {
        if expected != query_embedding.len() {
            return Err(QueryError::DimensionMismatch {
                expected,
                got: query_embedding.len(),
            }
            .into());
        }
    }
    Ok(())
}

/// One `match_by_interests` result.
#[derive(Debug, Clone, Serialize)]
pub struct InterestMatch {
    pub contact_id: i64,
    pub name: String,
    pub headline: Option<String>,
    pub company: Option<String>,
    pub similarity: f64,
    pub proximity_score: Option<i64>,
    pub capacity_score: Option<i64>,
}

impl From<ContactCandidate> for InterestMatch {
    fn from(c: ContactCandidate) -> Self {
        Self {
            contact_id: c.contact_id,
            name: c.name,
            headline: c.headline,
            company: c.company,
            similarity: c.raw_score,
            proximity_score: c.proximity_score,
            capacity_score: c.capacity_score,
        }
    }
}

/// One `hybrid_search` result. Ranks are 1-based positions in the input
/// lists; `None` means the contact was absent from that list.
#[derive(Debug, Clone, Serialize)]
pub struct HybridMatch {
    pub contact_id: i64,
    pub name: String,
    pub headline: Option<String>,
    pub company: Option<String>,
    pub score: f64,
    pub semantic_rank: Option<usize>,
    pub keyword_rank: Option<usize>,
    pub proximity_score: Option<i64>,
    pub capacity_score: Option<i64>,
}

/// Parameters of a hybrid query.
#[derive(Debug, Clone)]
pub struct HybridQuery {
    pub query_text: String,
    /// Without a vector the semantic list is empty.
    pub query_embedding: Option<Vec<f32>>,
    pub proximity_min: Option<i64>,
    pub capacity_min: Option<i64>,
    pub semantic_weight: f64,
    pub keyword_weight: f64,
    pub limit: usize,
    pub rrf_k: f64,
    pub candidate_k_vector: usize,
    pub candidate_k_keyword: usize,
}

impl HybridQuery {
    /// A query with weights, limits and `rrf_k` taken from `[retrieval]`.
    pub fn new(retrieval: &RetrievalConfig, query_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            query_embedding: None,
            proximity_min: None,
            capacity_min: None,
            semantic_weight: retrieval.semantic_weight,
            keyword_weight: retrieval.keyword_weight,
            limit: retrieval.final_limit,
            rrf_k: retrieval.rrf_k,
            candidate_k_vector: retrieval.candidate_k_vector,
            candidate_k_keyword: retrieval.candidate_k_keyword,
        }
    }

    fn check(&self) -> Result<(), QueryError> {
        if self.rrf_k.is_nan() || self.rrf_k <= 0.0 {
            return Err(QueryError::Invalid("rrf_k must be > 0"));
        }
        if self.semantic_weight < 0.0 || self.keyword_weight < 0.0 {
            return Err(QueryError::Invalid("weights must be >= 0"));
        }
        Ok(())
    }
}

pub async fn match_by_interests(
    store: &dyn Store,
    query_embedding: &[f32],
    similarity_threshold: f32,
    limit: usize,
) -> Result<Vec<InterestMatch>> {
    check_embedding(store, VectorField::Interests, query_embedding).await?;
    let candidates = store
        .vector_search(
            VectorField::Interests,
            query_embedding,
            limit,
            &ContactFilter::default(),
        )
        .await?;
    Ok(candidates
        .into_iter()
        .filter(|c| c.raw_score >= similarity_threshold as f64)
        .map(InterestMatch::from)
        .collect())
}

fn ids(list: &[ContactCandidate]) -> Vec<i64> {
    list.iter().map(|c| c.contact_id).collect()
}

/// 1-based rank of each id, first occurrence wins.
fn ranks(list: &[ContactCandidate]) -> HashMap<i64, usize> {
    let mut map = HashMap::new();
    for (i, c) in list.iter().enumerate() {
        map.entry(c.contact_id).or_insert(i + 1);
    }
    map
}

pub async fn hybrid_search(store: &dyn Store, query: &HybridQuery) -> Result<Vec<HybridMatch>> {
    query.check()?;
    let filter = ContactFilter {
        proximity_min: query.proximity_min,
        capacity_min: query.capacity_min,
    };

    let semantic = match &query.query_embedding {
        Some(vec) if query.semantic_weight > 0.0 => {
            check_embedding(store, VectorField::Profile, vec).await?;
            store
                .vector_search(VectorField::Profile, vec, query.candidate_k_vector, &filter)
                .await?
        }
        _ => Vec::new(),
    };
    let keyword = if query.keyword_weight > 0.0 && !query.query_text.trim().is_empty() {
        store
            .keyword_search(&query.query_text, query.candidate_k_keyword, &filter)
            .await?
    } else {
        Vec::new()
    };

    let fused = rrf::fuse(
        &[
            (query.semantic_weight, ids(&semantic)),
            (query.keyword_weight, ids(&keyword)),
        ],
        query.rrf_k,
    );

    let semantic_ranks = ranks(&semantic);
    let keyword_ranks = ranks(&keyword);

    let mut info: HashMap<i64, &ContactCandidate> = HashMap::new();
    for c in semantic.iter().chain(keyword.iter()) {
        info.entry(c.contact_id).or_insert(c);
    }

    Ok(fused
        .into_iter()
        .take(query.limit)
        .filter_map(|(id, score)| {
            let c = info.get(&id)?;
            Some(HybridMatch {
                contact_id: id,
                name: c.name.clone(),
                headline: c.headline.clone(),
                company: c.company.clone(),
                score,
                semantic_rank: semantic_ranks.get(&id).copied(),
                keyword_rank: keyword_ranks.get(&id).copied(),
                proximity_score: c.proximity_score,
                capacity_score: c.capacity_score,
            })
        })
        .collect())
}

fn describe(headline: &Option<String>, company: &Option<String>) -> String {
    headline
        .as_deref()
        .or(company.as_deref())
        .unwrap_or("(no headline)")
        .to_string()
}

fn score_line(proximity: Option<i64>, capacity: Option<i64>) -> String {
    let show = |v: Option<i64>| v.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
    format!("proximity: {}  capacity: {}", show(proximity), show(capacity))
}

/// `rapport search`: embed the query when embeddings are configured, run
/// the selected mode, print ranked contacts.
pub async fn run_search(
    config: &Config,
    query: &str,
    mode: &str,
    limit: Option<usize>,
    proximity_min: Option<i64>,
    capacity_min: Option<i64>,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    match mode {
        "semantic" | "hybrid" => {}
        _ => bail!("Unknown search mode: {}. Use semantic or hybrid.", mode),
    }
    if mode == "semantic" && !config.embedding.is_enabled() {
        bail!("Mode 'semantic' requires embeddings. Set [embedding] provider in config.");
    }

    let query_embedding = if config.embedding.is_enabled() {
        let provider = create_provider(&config.embedding)?;
        Some(embed_query(provider.as_ref(), query).await?)
    } else {
        warn!("embeddings disabled, hybrid search uses the keyword list only");
        None
    };

    let store = SqliteStore::open(config).await?;
    let limit = limit.unwrap_or(config.retrieval.final_limit);

    if mode == "semantic" {
        let embedding = query_embedding.unwrap_or_default();
        let results = match_by_interests(
            &store,
            &embedding,
            config.retrieval.similarity_threshold,
            limit,
        )
        .await?;
        if results.is_empty() {
            println!("No results.");
        }
        for (i, r) in results.iter().enumerate() {
            println!(
                "{}. [{:.4}] {} / {}",
                i + 1,
                r.similarity,
                r.name,
                describe(&r.headline, &r.company)
            );
            println!("    {}", score_line(r.proximity_score, r.capacity_score));
            println!("    id: {}", r.contact_id);
            println!();
        }
    } else {
        let mut q = HybridQuery::new(&config.retrieval, query);
        q.query_embedding = query_embedding;
        q.proximity_min = proximity_min;
        q.capacity_min = capacity_min;
        q.limit = limit;
        let results = hybrid_search(&store, &q).await?;
        if results.is_empty() {
            println!("No results.");
        }
        let rank = |r: Option<usize>| r.map(|n| n.to_string()).unwrap_or_else(|| "-".into());
        for (i, r) in results.iter().enumerate() {
            println!(
                "{}. [{:.4}] {} / {}",
                i + 1,
                r.score,
                r.name,
                describe(&r.headline, &r.company)
            );
            println!(
                "    semantic rank: {}  keyword rank: {}",
                rank(r.semantic_rank),
                rank(r.keyword_rank)
            );
            println!("    {}", score_line(r.proximity_score, r.capacity_score));
            println!("    id: {}", r.contact_id);
            println!();
        }
    }

    store.close().await;
    Ok(())
}
