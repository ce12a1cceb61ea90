//! Schema creation for the contact database.
//!
//! Idempotent: every table and index is created only if missing, so
//! `rapport init` can run against an existing database.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Contacts: source facts plus every derived cache. JSON documents are
    // TEXT, vectors are little-endian f32 BLOBs.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contacts (
            id INTEGER PRIMARY KEY,
            first_name TEXT NOT NULL DEFAULT '',
            last_name TEXT NOT NULL DEFAULT '',
            headline TEXT,
            summary TEXT,
            company TEXT,
            position TEXT,
            city TEXT,
            state TEXT,
            enrich_employment TEXT,
            enrich_education TEXT,
            enrich_skills TEXT,
            enrich_volunteering TEXT,

            comms_summary TEXT,
            comms_last_date TEXT,
            comms_thread_count INTEGER,
            comms_closeness TEXT,
            comms_momentum TEXT,
            comms_reasoning TEXT,

            ai_tags TEXT,
            ai_tags_generated_at TEXT,
            ai_tags_model TEXT,
            ai_proximity_score INTEGER,
            ai_proximity_tier TEXT,
            ai_capacity_score INTEGER,
            ai_capacity_tier TEXT,
            ai_kindora_prospect_score INTEGER,
            ai_kindora_prospect_type TEXT,
            ai_outdoorithm_fit TEXT,

            shared_institutions TEXT,

            profile_embedding BLOB,
            interests_embedding BLOB
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Owned by the communication subsystem; created here so a fresh
    // database has the full schema.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS communication_threads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            contact_id INTEGER NOT NULL,
            channel TEXT NOT NULL,
            direction TEXT NOT NULL DEFAULT 'inbound',
            is_group INTEGER NOT NULL DEFAULT 0,
            message_count INTEGER NOT NULL DEFAULT 0,
            first_message_date TEXT,
            last_message_date TEXT,
            FOREIGN KEY (contact_id) REFERENCES contacts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='contacts_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE contacts_fts USING fts5(
                contact_id UNINDEXED,
                body
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_threads_contact_id ON communication_threads(contact_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_contacts_proximity ON contacts(ai_proximity_score DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_contacts_capacity ON contacts(ai_capacity_score DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_contacts_closeness ON contacts(comms_closeness)")
        .execute(pool)
        .await?;

    Ok(())
}
