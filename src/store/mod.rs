//! Storage abstraction.
//!
//! The [`Store`] trait is everything the pipeline needs from the datastore:
//! paged reads of contacts and threads, single-row writes of each derived
//! cache, and the two candidate retrievals (vector and keyword) the search
//! engine fuses. There is no cross-contact transaction; each write touches
//! one contact row.
//!
//! Implementations must be `Send + Sync` so tagger workers can share one
//! store behind an `Arc`.

#[cfg(test)]
pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::intel::{ClosenessAssessment, IntelligenceProfile, SharedInstitution};
use crate::models::{CommsSummary, CommunicationThread, Contact};

#[cfg(test)]
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Which stored vector a similarity search ranks by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorField {
    Profile,
    Interests,
}

/// Score pre-filters applied before any ranking.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContactFilter {
    pub proximity_min: Option<i64>,
    pub capacity_min: Option<i64>,
}

impl ContactFilter {
    /// Contacts without a score never pass a minimum on that score.
    pub fn admits(&self, proximity: Option<i64>, capacity: Option<i64>) -> bool {
        let ok = |min: Option<i64>, value: Option<i64>| match min {
            None => true,
            Some(m) => value.map(|v| v >= m).unwrap_or(false),
        };
        ok(self.proximity_min, proximity) && ok(self.capacity_min, capacity)
    }
}

/// A contact returned from vector or keyword retrieval, in ranked order.
#[derive(Debug, Clone, Serialize)]
pub struct ContactCandidate {
    pub contact_id: i64,
    pub name: String,
    pub headline: Option<String>,
    pub company: Option<String>,
    /// Cosine similarity, or a keyword relevance where higher is better.
    pub raw_score: f64,
    pub proximity_score: Option<i64>,
    pub capacity_score: Option<i64>,
}

/// The stored vectors of one contact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredEmbeddings {
    pub profile: Option<Vec<f32>>,
    pub interests: Option<Vec<f32>>,
}

/// Flat mirror columns of one contact, as persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MirrorColumns {
    pub proximity_score: Option<i64>,
    pub proximity_tier: Option<String>,
    pub capacity_score: Option<i64>,
    pub capacity_tier: Option<String>,
    pub prospect_score: Option<i64>,
    pub prospect_type: Option<String>,
    pub invite_fit: Option<String>,
    pub comms_last_date: Option<String>,
    pub comms_thread_count: Option<i64>,
}

/// Coverage of each derived cache, for `rapport stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoverageStats {
    pub contacts: i64,
    pub threads: i64,
    pub with_comms_summary: i64,
    pub with_profile_embedding: i64,
    pub with_interests_embedding: i64,
    pub tagged: i64,
    pub with_shared_institutions: i64,
    pub with_closeness: i64,
    pub proximity_tiers: Vec<(String, i64)>,
    pub closeness_labels: Vec<(String, i64)>,
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_contact`](Store::upsert_contact) | Insert or update a contact's source facts |
/// | [`insert_thread`](Store::insert_thread) | Record a communication thread (upstream subsystem) |
/// | [`list_contacts`](Store::list_contacts) | Keyset-paged contacts ordered by id |
/// | [`contacts_with_threads`](Store::contacts_with_threads) | Keyset-paged ids that own threads |
/// | `write_*` | Persist one derived cache for one contact |
/// | [`vector_search`](Store::vector_search) | Cosine-ranked candidates |
/// | [`keyword_search`](Store::keyword_search) | Full-text-ranked candidates |
/// | [`vector_dims`](Store::vector_dims) | Dimensionality of stored vectors |
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_contact(&self, contact: &Contact) -> Result<()>;

    async fn insert_thread(&self, thread: &CommunicationThread) -> Result<()>;

    async fn get_contact(&self, id: i64) -> Result<Option<Contact>>;

    /// Contacts with `id > after`, ascending, at most `limit`.
    async fn list_contacts(&self, after: i64, limit: usize) -> Result<Vec<Contact>>;

    /// Distinct ids owning at least one thread, `id > after`, ascending.
    async fn contacts_with_threads(&self, after: i64, limit: usize) -> Result<Vec<i64>>;

    async fn threads_for_contact(&self, contact_id: i64) -> Result<Vec<CommunicationThread>>;

    /// Replace the comms summary and its two mirror columns.
    async fn write_comms_summary(&self, contact_id: i64, summary: &CommsSummary) -> Result<()>;

    /// Replace both vectors. `None` clears the interests vector.
    async fn write_embeddings(
        &self,
        contact_id: i64,
        profile: &[f32],
        interests: Option<&[f32]>,
    ) -> Result<()>;

    async fn embeddings(&self, contact_id: i64) -> Result<StoredEmbeddings>;

    /// Write the nested profile and every mirror column in one statement.
    async fn write_intelligence(
        &self,
        contact_id: i64,
        profile: &IntelligenceProfile,
        model: &str,
        generated_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn mirror_columns(&self, contact_id: i64) -> Result<MirrorColumns>;

    async fn write_shared_institutions(
        &self,
        contact_id: i64,
        institutions: &[SharedInstitution],
    ) -> Result<()>;

    async fn write_closeness(&self, contact_id: i64, assessment: &ClosenessAssessment) -> Result<()>;

    async fn vector_search(
        &self,
        field: VectorField,
        query_vec: &[f32],
        limit: usize,
        filter: &ContactFilter,
    ) -> Result<Vec<ContactCandidate>>;

    async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        filter: &ContactFilter,
    ) -> Result<Vec<ContactCandidate>>;

    /// Length of the stored vectors in `field`, or `None` when none exist.
    async fn vector_dims(&self, field: VectorField) -> Result<Option<usize>>;

    async fn coverage(&self) -> Result<CoverageStats>;
}

/// Split a free-text query into lowercase alphanumeric terms.
pub fn query_terms(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn sort_candidates(candidates: &mut Vec<ContactCandidate>, limit: usize) {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.contact_id.cmp(&b.contact_id))
    });
    candidates.truncate(limit);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_requires_score_when_minimum_set() {
        let f = ContactFilter {
            proximity_min: Some(40),
            capacity_min: None,
        };
        assert!(f.admits(Some(40), None));
        assert!(!f.admits(Some(39), Some(99)));
        assert!(!f.admits(None, None));
        assert!(ContactFilter::default().admits(None, None));
    }

    #[test]
    fn query_terms_strip_punctuation() {
        assert_eq!(
            query_terms("climate-tech, \"outdoor\" equity!"),
            vec!["climate", "tech", "outdoor", "equity"]
        );
    }
}
