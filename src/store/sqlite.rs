//! SQLite-backed [`Store`] implementation.
//!
//! JSON documents live in TEXT columns and pass through the
//! [`jsonish`](crate::jsonish) boundary on read. Vectors are stored as
//! little-endian f32 BLOBs and ranked in Rust. Keyword retrieval uses the
//! `contacts_fts` FTS5 table, whose row for a contact is rebuilt whenever
//! its facts or intelligence tags change.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::config::Config;
use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::intel::{label, ClosenessAssessment, IntelligenceProfile, SharedInstitution};
use crate::jsonish;
use crate::migrate;
use crate::models::{
    parse_timestamp, Channel, CommsSummary, CommunicationThread, Contact, Direction,
};

use super::{
    query_terms, sort_candidates, ContactCandidate, ContactFilter, CoverageStats, MirrorColumns,
    Store, StoredEmbeddings, VectorField,
};

const CONTACT_COLUMNS: &str = r#"
    id, first_name, last_name, headline, summary, company, position, city, state,
    enrich_employment, enrich_education, enrich_skills, enrich_volunteering,
    comms_summary, comms_closeness, comms_momentum, comms_reasoning,
    ai_tags, shared_institutions,
    profile_embedding IS NOT NULL AS has_profile_embedding
"#;

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect using `config.db` and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn reindex(&self, contact_id: i64) -> Result<()> {
        let Some(contact) = self.get_contact(contact_id).await? else {
            return Ok(());
        };
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM contacts_fts WHERE contact_id = ?")
            .bind(contact_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO contacts_fts (contact_id, body) VALUES (?, ?)")
            .bind(contact_id)
            .bind(contact.search_text())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Decode a source-fact list column; malformed values degrade to empty.
fn fact_list<T: DeserializeOwned + Default>(row: &SqliteRow, column: &str, id: i64) -> T {
    let raw: Option<String> = row.get(column);
    let Some(text) = raw else {
        return T::default();
    };
    match jsonish::decode(serde_json::Value::String(text)) {
        Ok(v) => v,
        Err(e) => {
            warn!(contact_id = id, column, error = %e, "ignoring malformed enrichment field");
            T::default()
        }
    }
}

/// Decode a derived-document column; malformed values read as "not computed".
fn document<T: DeserializeOwned>(row: &SqliteRow, column: &str, id: i64) -> Option<T> {
    let raw: Option<String> = row.get(column);
    match jsonish::decode_text(raw.as_deref()) {
        Ok(v) => v,
        Err(e) => {
            warn!(contact_id = id, column, error = %e, "ignoring malformed stored document");
            None
        }
    }
}

fn parse_label<T: DeserializeOwned>(raw: Option<String>) -> Option<T> {
    raw.and_then(|s| serde_json::from_value(serde_json::Value::String(s)).ok())
}

fn row_to_contact(row: &SqliteRow) -> Contact {
    let id: i64 = row.get("id");
    let closeness = match (
        parse_label(row.get("comms_closeness")),
        parse_label(row.get("comms_momentum")),
    ) {
        (Some(closeness), Some(momentum)) => Some(ClosenessAssessment {
            closeness,
            momentum,
            reasoning: row
                .get::<Option<String>, _>("comms_reasoning")
                .unwrap_or_default(),
        }),
        _ => None,
    };

    Contact {
        id,
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        headline: row.get("headline"),
        summary: row.get("summary"),
        company: row.get("company"),
        position: row.get("position"),
        city: row.get("city"),
        state: row.get("state"),
        employment: fact_list(row, "enrich_employment", id),
        education: fact_list(row, "enrich_education", id),
        skills: fact_list(row, "enrich_skills", id),
        volunteering: fact_list(row, "enrich_volunteering", id),
        comms_summary: document(row, "comms_summary", id),
        ai_tags: document(row, "ai_tags", id),
        shared_institutions: document(row, "shared_institutions", id),
        closeness,
        has_profile_embedding: row.get::<bool, _>("has_profile_embedding"),
    }
}

fn row_to_candidate(row: &SqliteRow, raw_score: f64) -> ContactCandidate {
    let first: String = row.get("first_name");
    let last: String = row.get("last_name");
    ContactCandidate {
        contact_id: row.get("id"),
        name: format!("{} {}", first.trim(), last.trim()).trim().to_string(),
        headline: row.get("headline"),
        company: row.get("company"),
        raw_score,
        proximity_score: row.get("ai_proximity_score"),
        capacity_score: row.get("ai_capacity_score"),
    }
}

fn ensure_updated(rows: u64, contact_id: i64) -> Result<()> {
    if rows == 0 {
        bail!("contact {} not found", contact_id);
    }
    Ok(())
}

/// Quote each term so FTS5 never sees query syntax from user input.
fn fts_query(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn vector_column(field: VectorField) -> &'static str {
    match field {
        VectorField::Profile => "profile_embedding",
        VectorField::Interests => "interests_embedding",
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_contact(&self, contact: &Contact) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO contacts (id, first_name, last_name, headline, summary, company,
                                  position, city, state, enrich_employment, enrich_education,
                                  enrich_skills, enrich_volunteering)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                headline = excluded.headline,
                summary = excluded.summary,
                company = excluded.company,
                position = excluded.position,
                city = excluded.city,
                state = excluded.state,
                enrich_employment = excluded.enrich_employment,
                enrich_education = excluded.enrich_education,
                enrich_skills = excluded.enrich_skills,
                enrich_volunteering = excluded.enrich_volunteering
            "#,
        )
        .bind(contact.id)
        .bind(&contact.first_name)
        .bind(&contact.last_name)
        .bind(&contact.headline)
        .bind(&contact.summary)
        .bind(&contact.company)
        .bind(&contact.position)
        .bind(&contact.city)
        .bind(&contact.state)
        .bind(serde_json::to_string(&contact.employment)?)
        .bind(serde_json::to_string(&contact.education)?)
        .bind(serde_json::to_string(&contact.skills)?)
        .bind(serde_json::to_string(&contact.volunteering)?)
        .execute(&self.pool)
        .await?;

        self.reindex(contact.id).await
    }

    async fn insert_thread(&self, thread: &CommunicationThread) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO communication_threads (contact_id, channel, direction, is_group,
                                               message_count, first_message_date, last_message_date)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(thread.contact_id)
        .bind(thread.channel.key())
        .bind(thread.direction.key())
        .bind(thread.is_group)
        .bind(thread.message_count as i64)
        .bind(thread.first_message_at.map(|d| d.to_rfc3339()))
        .bind(thread.last_message_at.map(|d| d.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_contact(&self, id: i64) -> Result<Option<Contact>> {
        let row = sqlx::query(&format!("SELECT {} FROM contacts WHERE id = ?", CONTACT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_contact))
    }

    async fn list_contacts(&self, after: i64, limit: usize) -> Result<Vec<Contact>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM contacts WHERE id > ? ORDER BY id LIMIT ?",
            CONTACT_COLUMNS
        ))
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_contact).collect())
    }

    async fn contacts_with_threads(&self, after: i64, limit: usize) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT contact_id FROM communication_threads
            WHERE contact_id > ?
            ORDER BY contact_id
            LIMIT ?
            "#,
        )
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn threads_for_contact(&self, contact_id: i64) -> Result<Vec<CommunicationThread>> {
        let rows = sqlx::query(
            r#"
            SELECT contact_id, channel, direction, is_group, message_count,
                   first_message_date, last_message_date
            FROM communication_threads
            WHERE contact_id = ?
            ORDER BY id
            "#,
        )
        .bind(contact_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let channel: String = row.get("channel");
                let direction: String = row.get("direction");
                let count: i64 = row.get("message_count");
                let first: Option<String> = row.get("first_message_date");
                let last: Option<String> = row.get("last_message_date");
                CommunicationThread {
                    contact_id: row.get("contact_id"),
                    channel: Channel::parse(&channel),
                    direction: Direction::parse(&direction),
                    is_group: row.get::<bool, _>("is_group"),
                    message_count: count.max(0) as u32,
                    first_message_at: first.as_deref().and_then(parse_timestamp),
                    last_message_at: last.as_deref().and_then(parse_timestamp),
                }
            })
            .collect())
    }

    async fn write_comms_summary(&self, contact_id: i64, summary: &CommsSummary) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE contacts
            SET comms_summary = ?, comms_last_date = ?, comms_thread_count = ?
            WHERE id = ?
            "#,
        )
        .bind(serde_json::to_string(summary)?)
        .bind(summary.last_contact_date.map(|d| d.to_string()))
        .bind(summary.total_threads as i64)
        .bind(contact_id)
        .execute(&self.pool)
        .await?;
        ensure_updated(result.rows_affected(), contact_id)
    }

    async fn write_embeddings(
        &self,
        contact_id: i64,
        profile: &[f32],
        interests: Option<&[f32]>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE contacts SET profile_embedding = ?, interests_embedding = ? WHERE id = ?",
        )
        .bind(vec_to_blob(profile))
        .bind(interests.map(vec_to_blob))
        .bind(contact_id)
        .execute(&self.pool)
        .await?;
        ensure_updated(result.rows_affected(), contact_id)
    }

    async fn embeddings(&self, contact_id: i64) -> Result<StoredEmbeddings> {
        let row = sqlx::query(
            "SELECT profile_embedding, interests_embedding FROM contacts WHERE id = ?",
        )
        .bind(contact_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => {
                let profile: Option<Vec<u8>> = row.get("profile_embedding");
                let interests: Option<Vec<u8>> = row.get("interests_embedding");
                StoredEmbeddings {
                    profile: profile.as_deref().map(blob_to_vec),
                    interests: interests.as_deref().map(blob_to_vec),
                }
            }
            None => StoredEmbeddings::default(),
        })
    }

    async fn write_intelligence(
        &self,
        contact_id: i64,
        profile: &IntelligenceProfile,
        model: &str,
        generated_at: DateTime<Utc>,
    ) -> Result<()> {
        let m = profile.mirrors();
        let result = sqlx::query(
            r#"
            UPDATE contacts SET
                ai_tags = ?,
                ai_tags_generated_at = ?,
                ai_tags_model = ?,
                ai_proximity_score = ?,
                ai_proximity_tier = ?,
                ai_capacity_score = ?,
                ai_capacity_tier = ?,
                ai_kindora_prospect_score = ?,
                ai_kindora_prospect_type = ?,
                ai_outdoorithm_fit = ?
            WHERE id = ?
            "#,
        )
        .bind(serde_json::to_string(profile)?)
        .bind(generated_at.to_rfc3339())
        .bind(model)
        .bind(m.proximity_score)
        .bind(&m.proximity_tier)
        .bind(m.capacity_score)
        .bind(&m.capacity_tier)
        .bind(m.prospect_score)
        .bind(&m.prospect_type)
        .bind(&m.invite_fit)
        .bind(contact_id)
        .execute(&self.pool)
        .await?;
        ensure_updated(result.rows_affected(), contact_id)?;

        self.reindex(contact_id).await
    }

    async fn mirror_columns(&self, contact_id: i64) -> Result<MirrorColumns> {
        let row = sqlx::query(
            r#"
            SELECT ai_proximity_score, ai_proximity_tier, ai_capacity_score, ai_capacity_tier,
                   ai_kindora_prospect_score, ai_kindora_prospect_type, ai_outdoorithm_fit,
                   comms_last_date, comms_thread_count
            FROM contacts WHERE id = ?
            "#,
        )
        .bind(contact_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => MirrorColumns {
                proximity_score: row.get("ai_proximity_score"),
                proximity_tier: row.get("ai_proximity_tier"),
                capacity_score: row.get("ai_capacity_score"),
                capacity_tier: row.get("ai_capacity_tier"),
                prospect_score: row.get("ai_kindora_prospect_score"),
                prospect_type: row.get("ai_kindora_prospect_type"),
                invite_fit: row.get("ai_outdoorithm_fit"),
                comms_last_date: row.get("comms_last_date"),
                comms_thread_count: row.get("comms_thread_count"),
            },
            None => MirrorColumns::default(),
        })
    }

    async fn write_shared_institutions(
        &self,
        contact_id: i64,
        institutions: &[SharedInstitution],
    ) -> Result<()> {
        let result = sqlx::query("UPDATE contacts SET shared_institutions = ? WHERE id = ?")
            .bind(serde_json::to_string(institutions)?)
            .bind(contact_id)
            .execute(&self.pool)
            .await?;
        ensure_updated(result.rows_affected(), contact_id)
    }

    async fn write_closeness(&self, contact_id: i64, assessment: &ClosenessAssessment) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE contacts
            SET comms_closeness = ?, comms_momentum = ?, comms_reasoning = ?
            WHERE id = ?
            "#,
        )
        .bind(label(&assessment.closeness))
        .bind(label(&assessment.momentum))
        .bind(&assessment.reasoning)
        .bind(contact_id)
        .execute(&self.pool)
        .await?;
        ensure_updated(result.rows_affected(), contact_id)
    }

    async fn vector_search(
        &self,
        field: VectorField,
        query_vec: &[f32],
        limit: usize,
        filter: &ContactFilter,
    ) -> Result<Vec<ContactCandidate>> {
        let column = vector_column(field);

        // Fetch eligible vectors and compute cosine similarity in Rust
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, first_name, last_name, headline, company,
                   ai_proximity_score, ai_capacity_score, {column} AS embedding
            FROM contacts
            WHERE {column} IS NOT NULL
              AND (? IS NULL OR ai_proximity_score >= ?)
              AND (? IS NULL OR ai_capacity_score >= ?)
            "#
        ))
        .bind(filter.proximity_min)
        .bind(filter.proximity_min)
        .bind(filter.capacity_min)
        .bind(filter.capacity_min)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates: Vec<ContactCandidate> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = blob_to_vec(&blob);
                if vec.len() != query_vec.len() {
                    return None;
                }
                let similarity = cosine_similarity(query_vec, &vec) as f64;
                Some(row_to_candidate(row, similarity))
            })
            .collect();

        sort_candidates(&mut candidates, limit);
        Ok(candidates)
    }

    async fn vector_dims(&self, field: VectorField) -> Result<Option<usize>> {
        let bytes: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT length({column}) FROM contacts WHERE {column} IS NOT NULL LIMIT 1",
            column = vector_column(field)
        ))
        .fetch_optional(&self.pool)
        .await?;
        Ok(bytes.map(|b| b as usize / std::mem::size_of::<f32>()))
    }

    async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        filter: &ContactFilter,
    ) -> Result<Vec<ContactCandidate>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT c.id, c.first_name, c.last_name, c.headline, c.company,
                   c.ai_proximity_score, c.ai_capacity_score, contacts_fts.rank AS rank
            FROM contacts_fts
            JOIN contacts c ON c.id = contacts_fts.contact_id
            WHERE contacts_fts MATCH ?
              AND (? IS NULL OR c.ai_proximity_score >= ?)
              AND (? IS NULL OR c.ai_capacity_score >= ?)
            ORDER BY rank, c.id
            LIMIT ?
            "#,
        )
        .bind(fts)
        .bind(filter.proximity_min)
        .bind(filter.proximity_min)
        .bind(filter.capacity_min)
        .bind(filter.capacity_min)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                row_to_candidate(row, -rank) // negate so higher = better
            })
            .collect())
    }

    async fn coverage(&self) -> Result<CoverageStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS contacts,
                COUNT(comms_summary) AS with_comms_summary,
                COUNT(profile_embedding) AS with_profile_embedding,
                COUNT(interests_embedding) AS with_interests_embedding,
                COUNT(ai_tags) AS tagged,
                COUNT(shared_institutions) AS with_shared_institutions,
                COUNT(comms_closeness) AS with_closeness
            FROM contacts
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let threads: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM communication_threads")
            .fetch_one(&self.pool)
            .await?;

        let proximity_tiers: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT ai_proximity_tier, COUNT(*) FROM contacts
            WHERE ai_proximity_tier IS NOT NULL
            GROUP BY ai_proximity_tier ORDER BY ai_proximity_tier
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let closeness_labels: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT comms_closeness, COUNT(*) FROM contacts
            WHERE comms_closeness IS NOT NULL
            GROUP BY comms_closeness ORDER BY comms_closeness
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(CoverageStats {
            contacts: row.get("contacts"),
            threads,
            with_comms_summary: row.get("with_comms_summary"),
            with_profile_embedding: row.get("with_profile_embedding"),
            with_interests_embedding: row.get("with_interests_embedding"),
            tagged: row.get("tagged"),
            with_shared_institutions: row.get("with_shared_institutions"),
            with_closeness: row.get("with_closeness"),
            proximity_tiers,
            closeness_labels,
        })
    }
}
