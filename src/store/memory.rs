//! In-memory [`Store`] implementation for tests.
//!
//! Uses `BTreeMap` and `Vec` behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity; keyword search counts matched query terms
//! in [`Contact::search_text`].

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::embedding::cosine_similarity;
use crate::intel::{label, ClosenessAssessment, IntelligenceProfile, SharedInstitution};
use crate::models::{CommsSummary, CommunicationThread, Contact};

use super::{
    query_terms, sort_candidates, ContactCandidate, ContactFilter, CoverageStats, MirrorColumns,
    Store, StoredEmbeddings, VectorField,
};

#[derive(Default)]
struct StoredContact {
    contact: Contact,
    embeddings: StoredEmbeddings,
    mirrors: MirrorColumns,
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    contacts: RwLock<BTreeMap<i64, StoredContact>>,
    threads: RwLock<Vec<CommunicationThread>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, contact_id: i64, f: F) -> Result<()>
    where
        F: FnOnce(&mut StoredContact),
    {
        let mut contacts = self.contacts.write().unwrap();
        match contacts.get_mut(&contact_id) {
            Some(stored) => {
                f(stored);
                Ok(())
            }
            None => bail!("contact {} not found", contact_id),
        }
    }
}

fn candidate(stored: &StoredContact, raw_score: f64) -> ContactCandidate {
    ContactCandidate {
        contact_id: stored.contact.id,
        name: stored.contact.full_name(),
        headline: stored.contact.headline.clone(),
        company: stored.contact.company.clone(),
        raw_score,
        proximity_score: stored.mirrors.proximity_score,
        capacity_score: stored.mirrors.capacity_score,
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_contact(&self, contact: &Contact) -> Result<()> {
        let mut contacts = self.contacts.write().unwrap();
        let entry = contacts.entry(contact.id).or_default();
        let derived = std::mem::take(&mut entry.contact);
        entry.contact = Contact {
            comms_summary: derived.comms_summary,
            ai_tags: derived.ai_tags,
            shared_institutions: derived.shared_institutions,
            closeness: derived.closeness,
            has_profile_embedding: derived.has_profile_embedding,
            ..contact.clone()
        };
        Ok(())
    }

    async fn insert_thread(&self, thread: &CommunicationThread) -> Result<()> {
        self.threads.write().unwrap().push(thread.clone());
        Ok(())
    }

    async fn get_contact(&self, id: i64) -> Result<Option<Contact>> {
        let contacts = self.contacts.read().unwrap();
        Ok(contacts.get(&id).map(|s| s.contact.clone()))
    }

    async fn list_contacts(&self, after: i64, limit: usize) -> Result<Vec<Contact>> {
        let contacts = self.contacts.read().unwrap();
        Ok(contacts
            .range(after.saturating_add(1)..)
            .take(limit)
            .map(|(_, s)| s.contact.clone())
            .collect())
    }

    async fn contacts_with_threads(&self, after: i64, limit: usize) -> Result<Vec<i64>> {
        let threads = self.threads.read().unwrap();
        let mut ids: Vec<i64> = threads
            .iter()
            .map(|t| t.contact_id)
            .filter(|id| *id > after)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.truncate(limit);
        Ok(ids)
    }

    async fn threads_for_contact(&self, contact_id: i64) -> Result<Vec<CommunicationThread>> {
        let threads = self.threads.read().unwrap();
        Ok(threads
            .iter()
            .filter(|t| t.contact_id == contact_id)
            .cloned()
            .collect())
    }

    async fn write_comms_summary(&self, contact_id: i64, summary: &CommsSummary) -> Result<()> {
        self.update(contact_id, |s| {
            s.mirrors.comms_last_date = summary.last_contact_date.map(|d| d.to_string());
            s.mirrors.comms_thread_count = Some(summary.total_threads as i64);
            s.contact.comms_summary = Some(summary.clone());
        })
    }

    async fn write_embeddings(
        &self,
        contact_id: i64,
        profile: &[f32],
        interests: Option<&[f32]>,
    ) -> Result<()> {
        self.update(contact_id, |s| {
            s.embeddings = StoredEmbeddings {
                profile: Some(profile.to_vec()),
                interests: interests.map(|v| v.to_vec()),
            };
            s.contact.has_profile_embedding = true;
        })
    }

    async fn embeddings(&self, contact_id: i64) -> Result<StoredEmbeddings> {
        let contacts = self.contacts.read().unwrap();
        Ok(contacts
            .get(&contact_id)
            .map(|s| s.embeddings.clone())
            .unwrap_or_default())
    }

    async fn write_intelligence(
        &self,
        contact_id: i64,
        profile: &IntelligenceProfile,
        _model: &str,
        _generated_at: DateTime<Utc>,
    ) -> Result<()> {
        let m = profile.mirrors();
        self.update(contact_id, |s| {
            s.contact.ai_tags = Some(profile.clone());
            s.mirrors.proximity_score = Some(m.proximity_score);
            s.mirrors.proximity_tier = Some(m.proximity_tier);
            s.mirrors.capacity_score = Some(m.capacity_score);
            s.mirrors.capacity_tier = Some(m.capacity_tier);
            s.mirrors.prospect_score = Some(m.prospect_score);
            s.mirrors.prospect_type = Some(m.prospect_type);
            s.mirrors.invite_fit = Some(m.invite_fit);
        })
    }

    async fn mirror_columns(&self, contact_id: i64) -> Result<MirrorColumns> {
        let contacts = self.contacts.read().unwrap();
        Ok(contacts
            .get(&contact_id)
            .map(|s| s.mirrors.clone())
            .unwrap_or_default())
    }

    async fn write_shared_institutions(
        &self,
        contact_id: i64,
        institutions: &[SharedInstitution],
    ) -> Result<()> {
        self.update(contact_id, |s| {
            s.contact.shared_institutions = Some(institutions.to_vec());
        })
    }

    async fn write_closeness(&self, contact_id: i64, assessment: &ClosenessAssessment) -> Result<()> {
        self.update(contact_id, |s| {
            s.contact.closeness = Some(assessment.clone());
        })
    }

    async fn vector_search(
        &self,
        field: VectorField,
        query_vec: &[f32],
        limit: usize,
        filter: &ContactFilter,
    ) -> Result<Vec<ContactCandidate>> {
        let contacts = self.contacts.read().unwrap();
        let mut candidates: Vec<ContactCandidate> = contacts
            .values()
            .filter(|s| filter.admits(s.mirrors.proximity_score, s.mirrors.capacity_score))
            .filter_map(|s| {
                let vec = match field {
                    VectorField::Profile => s.embeddings.profile.as_ref(),
                    VectorField::Interests => s.embeddings.interests.as_ref(),
                }?;
                if vec.len() != query_vec.len() {
                    return None;
                }
                let sim = cosine_similarity(query_vec, vec) as f64;
                Some(candidate(s, sim))
            })
            .collect();
        sort_candidates(&mut candidates, limit);
        Ok(candidates)
    }

    async fn vector_dims(&self, field: VectorField) -> Result<Option<usize>> {
        let contacts = self.contacts.read().unwrap();
        Ok(contacts.values().find_map(|s| {
            match field {
                VectorField::Profile => s.embeddings.profile.as_ref(),
                VectorField::Interests => s.embeddings.interests.as_ref(),
            }
            .map(|v| v.len())
        }))
    }

    async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        filter: &ContactFilter,
    ) -> Result<Vec<ContactCandidate>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let contacts = self.contacts.read().unwrap();
        let mut candidates: Vec<ContactCandidate> = contacts
            .values()
            .filter(|s| filter.admits(s.mirrors.proximity_score, s.mirrors.capacity_score))
            .filter_map(|s| {
                let text = s.contact.search_text().to_lowercase();
                let matches = terms.iter().filter(|t| text.contains(t.as_str())).count();
                (matches > 0).then(|| candidate(s, matches as f64))
            })
            .collect();
        sort_candidates(&mut candidates, limit);
        Ok(candidates)
    }

    async fn coverage(&self) -> Result<CoverageStats> {
        let contacts = self.contacts.read().unwrap();
        let threads = self.threads.read().unwrap();
        let mut stats = CoverageStats {
            contacts: contacts.len() as i64,
            threads: threads.len() as i64,
            ..Default::default()
        };
        let mut tiers: BTreeMap<String, i64> = BTreeMap::new();
        let mut closeness: BTreeMap<String, i64> = BTreeMap::new();
        for s in contacts.values() {
            let c = &s.contact;
            stats.with_comms_summary += c.comms_summary.is_some() as i64;
            stats.with_profile_embedding += s.embeddings.profile.is_some() as i64;
            stats.with_interests_embedding += s.embeddings.interests.is_some() as i64;
            stats.tagged += c.ai_tags.is_some() as i64;
            stats.with_shared_institutions += c.shared_institutions.is_some() as i64;
            stats.with_closeness += c.closeness.is_some() as i64;
            if let Some(tier) = &s.mirrors.proximity_tier {
                *tiers.entry(tier.clone()).or_default() += 1;
            }
            if let Some(a) = &c.closeness {
                *closeness.entry(label(&a.closeness)).or_default() += 1;
            }
        }
        stats.proximity_tiers = tiers.into_iter().collect();
        stats.closeness_labels = closeness.into_iter().collect();
        Ok(stats)
    }
}
