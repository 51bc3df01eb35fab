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

/// Create every table and index on an open pool. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Dossiers; first_source_id is the one-time generation claim
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dossiers (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            generation_status TEXT NOT NULL DEFAULT 'pending',
            icon TEXT NOT NULL,
            color TEXT NOT NULL,
            example_questions_json TEXT NOT NULL DEFAULT '[]',
            sources_uploaded INTEGER NOT NULL DEFAULT 0,
            sources_processed INTEGER NOT NULL DEFAULT 0,
            first_source_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id TEXT PRIMARY KEY,
            dossier_id TEXT NOT NULL,
            title TEXT NOT NULL,
            source_type TEXT NOT NULL,
            document_type TEXT,
            processing_status TEXT NOT NULL DEFAULT 'pending',
            file_path TEXT,
            content TEXT,
            url TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            file_size INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (dossier_id) REFERENCES dossiers(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_checklist (
            id TEXT PRIMARY KEY,
            topic_title TEXT NOT NULL UNIQUE,
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_results (
            id TEXT PRIMARY KEY,
            dossier_id TEXT NOT NULL,
            checklist_id TEXT NOT NULL,
            summary TEXT NOT NULL,
            confidence_score REAL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (dossier_id) REFERENCES dossiers(id) ON DELETE CASCADE,
            FOREIGN KEY (checklist_id) REFERENCES analysis_checklist(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outbox_jobs (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            dossier_id TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one source per (dossier, document_type)
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sources_dossier_document_type
        ON sources(dossier_id, document_type)
        WHERE document_type IS NOT NULL
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sources_dossier_id ON sources(dossier_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sources_status_updated ON sources(processing_status, updated_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_dossiers_owner ON dossiers(owner_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_analysis_results_dossier ON analysis_results(dossier_id, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_outbox_due ON outbox_jobs(state, next_attempt_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
