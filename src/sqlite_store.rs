//! SQLite-backed [`Store`] implementation.
//!
//! Every counter change is arithmetic inside an `UPDATE`. Multi-row
//! operations run in one transaction whose first statement is a write, so
//! SQLite takes the write lock up front instead of upgrading mid-way.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use dossier_core::error::LifecycleError;
use dossier_core::lifecycle::{callback_effect, CallbackEffect};
use dossier_core::models::{
    new_id, now_ts, AnalysisResult, CallbackOutcome, CallbackStatus, DocumentType, Dossier,
    GeneratedContent, GenerationStatus, JobKind, JobState, NewAnalysisResult, NewDossier,
    NewSource, OutboxJob, Source, SourceCreated, SourceStatus, SourceUpdate, DEFAULT_COLOR,
    DEFAULT_ICON,
};
use dossier_core::store::{apply_source_update, with_failure_reason, Store};

const DEFAULT_TITLE: &str = "Untitled dossier";

/// Attempts at an optimistic source update before giving up.
const UPDATE_RETRIES: usize = 5;

const DOSSIER_COLUMNS: &str = "id, owner_id, title, description, generation_status, icon, color, \
     example_questions_json, sources_uploaded, sources_processed, first_source_id, created_at, updated_at";

const SOURCE_COLUMNS: &str = "id, dossier_id, title, source_type, document_type, processing_status, \
     file_path, content, url, metadata_json, file_size, created_at, updated_at";

const JOB_COLUMNS: &str = "id, kind, dossier_id, payload_json, state, attempts, next_attempt_at, \
     last_error, created_at, updated_at";

/// SQLite implementation of the [`Store`] trait.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn dossier_from_row(row: &SqliteRow) -> Result<Dossier> {
    let questions: String = row.try_get("example_questions_json")?;
    Ok(Dossier {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        generation_status: row.try_get::<String, _>("generation_status")?.parse()?,
        icon: row.try_get("icon")?,
        color: row.try_get("color")?,
        example_questions: serde_json::from_str(&questions)
            .context("corrupt example_questions_json")?,
        sources_uploaded: row.try_get("sources_uploaded")?,
        sources_processed: row.try_get("sources_processed")?,
        first_source_id: row.try_get("first_source_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn source_from_row(row: &SqliteRow) -> Result<Source> {
    let metadata: String = row.try_get("metadata_json")?;
    let document_type: Option<String> = row.try_get("document_type")?;
    Ok(Source {
        id: row.try_get("id")?,
        dossier_id: row.try_get("dossier_id")?,
        title: row.try_get("title")?,
        source_type: row.try_get::<String, _>("source_type")?.parse()?,
        document_type: document_type
            .map(|t| t.parse::<DocumentType>())
            .transpose()?,
        processing_status: row.try_get::<String, _>("processing_status")?.parse()?,
        file_path: row.try_get("file_path")?,
        content: row.try_get("content")?,
        url: row.try_get("url")?,
        metadata: serde_json::from_str(&metadata).context("corrupt metadata_json")?,
        file_size: row.try_get("file_size")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<OutboxJob> {
    let payload: String = row.try_get("payload_json")?;
    Ok(OutboxJob {
        id: row.try_get("id")?,
        kind: row.try_get::<String, _>("kind")?.parse()?,
        dossier_id: row.try_get("dossier_id")?,
        payload: serde_json::from_str(&payload).context("corrupt payload_json")?,
        state: row.try_get::<String, _>("state")?.parse()?,
        attempts: row.try_get("attempts")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}

impl SqliteStore {
    async fn job(&self, id: &str) -> Result<OutboxJob> {
        let row = sqlx::query(&format!("SELECT {} FROM outbox_jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| LifecycleError::job_not_found(id))?;
        job_from_row(&row)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_dossier(&self, input: &NewDossier) -> Result<Dossier> {
        let now = now_ts();
        let dossier = Dossier {
            id: new_id(),
            owner_id: input.owner_id.clone(),
            title: input
                .title
                .clone()
                .unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            description: None,
            generation_status: GenerationStatus::Pending,
            icon: DEFAULT_ICON.to_string(),
            color: DEFAULT_COLOR.to_string(),
            example_questions: Vec::new(),
            sources_uploaded: 0,
            sources_processed: 0,
            first_source_id: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO dossiers (id, owner_id, title, description, generation_status, icon, color,
                                  example_questions_json, sources_uploaded, sources_processed,
                                  first_source_id, created_at, updated_at)
            VALUES (?, ?, ?, NULL, ?, ?, ?, '[]', 0, 0, NULL, ?, ?)
            "#,
        )
        .bind(&dossier.id)
        .bind(&dossier.owner_id)
        .bind(&dossier.title)
        .bind(dossier.generation_status.as_str())
        .bind(&dossier.icon)
        .bind(&dossier.color)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(dossier)
    }

    async fn get_dossier(&self, id: &str) -> Result<Option<Dossier>> {
        let row = sqlx::query(&format!("SELECT {} FROM dossiers WHERE id = ?", DOSSIER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(dossier_from_row).transpose()
    }

    async fn list_dossiers(&self, owner_id: Option<&str>) -> Result<Vec<Dossier>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM dossiers WHERE (? IS NULL OR owner_id = ?) \
             ORDER BY created_at DESC, rowid DESC",
            DOSSIER_COLUMNS
        ))
        .bind(owner_id)
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(dossier_from_row).collect()
    }

    async fn delete_dossier(&self, id: &str) -> Result<Vec<Source>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM analysis_results WHERE dossier_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM sources WHERE dossier_id = ? ORDER BY created_at, rowid",
            SOURCE_COLUMNS
        ))
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;
        let removed = rows.iter().map(source_from_row).collect::<Result<Vec<_>>>()?;

        sqlx::query("DELETE FROM sources WHERE dossier_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query("DELETE FROM dossiers WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(LifecycleError::dossier_not_found(id).into());
        }

        tx.commit().await?;
        Ok(removed)
    }

    async fn create_source(&self, input: &NewSource) -> Result<SourceCreated> {
        let now = now_ts();
        let source = Source {
            id: new_id(),
            dossier_id: input.dossier_id.clone(),
            title: input.title.clone(),
            source_type: input.source_type,
            document_type: input.document_type,
            processing_status: SourceStatus::Pending,
            file_path: None,
            content: input.content.clone(),
            url: input.url.clone(),
            metadata: input.metadata.clone(),
            file_size: input.file_size,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO sources (id, dossier_id, title, source_type, document_type,
                                 processing_status, file_path, content, url, metadata_json,
                                 file_size, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&source.id)
        .bind(&source.dossier_id)
        .bind(&source.title)
        .bind(source.source_type.as_str())
        .bind(source.document_type.map(|t| t.as_str()))
        .bind(source.processing_status.as_str())
        .bind(&source.content)
        .bind(&source.url)
        .bind(source.metadata.to_string())
        .bind(source.file_size)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                if let Some(document_type) = input.document_type {
                    return Err(LifecycleError::DuplicateDocumentType {
                        dossier_id: input.dossier_id.clone(),
                        document_type,
                    }
                    .into());
                }
                return Err(e.into());
            }
            Err(e) if is_foreign_key_violation(&e) => {
                return Err(LifecycleError::dossier_not_found(&input.dossier_id).into());
            }
            Err(e) => return Err(e.into()),
        }

        let claimed_first = if input.source_type.is_processable() {
            let claimed = sqlx::query(
                "UPDATE dossiers SET first_source_id = ?, updated_at = ? \
                 WHERE id = ? AND first_source_id IS NULL",
            )
            .bind(&source.id)
            .bind(now)
            .bind(&source.dossier_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            claimed == 1
        } else {
            false
        };

        tx.commit().await?;
        Ok(SourceCreated {
            source,
            claimed_first,
        })
    }

    async fn get_source(&self, id: &str) -> Result<Option<Source>> {
        let row = sqlx::query(&format!("SELECT {} FROM sources WHERE id = ?", SOURCE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn list_sources(&self, dossier_id: &str) -> Result<Vec<Source>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sources WHERE dossier_id = ? ORDER BY created_at, rowid",
            SOURCE_COLUMNS
        ))
        .bind(dossier_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn update_source(&self, id: &str, update: &SourceUpdate) -> Result<Source> {
        // Compare-and-swap on the status read, so a concurrent transition
        // is never overwritten by a stale check.
        for _ in 0..UPDATE_RETRIES {
            let mut source = self
                .get_source(id)
                .await?
                .ok_or_else(|| LifecycleError::source_not_found(id))?;
            let seen = source.processing_status;
            apply_source_update(&mut source, update, now_ts())?;

            let written = sqlx::query(
                r#"
                UPDATE sources
                SET title = ?, processing_status = ?, file_path = ?, content = ?,
                    metadata_json = ?, updated_at = ?
                WHERE id = ? AND processing_status = ?
                "#,
            )
            .bind(&source.title)
            .bind(source.processing_status.as_str())
            .bind(&source.file_path)
            .bind(&source.content)
            .bind(source.metadata.to_string())
            .bind(source.updated_at)
            .bind(id)
            .bind(seen.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();

            if written == 1 {
                return Ok(source);
            }
        }
        anyhow::bail!("source {} kept changing during update", id)
    }

    async fn increment_sources_uploaded(&self, dossier_id: &str, by: i64) -> Result<i64> {
        let row = sqlx::query(
            "UPDATE dossiers SET sources_uploaded = sources_uploaded + ?, updated_at = ? \
             WHERE id = ? RETURNING sources_uploaded",
        )
        .bind(by)
        .bind(now_ts())
        .bind(dossier_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LifecycleError::dossier_not_found(dossier_id))?;
        Ok(row.try_get("sources_uploaded")?)
    }

    async fn set_generation_status(
        &self,
        dossier_id: &str,
        status: GenerationStatus,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE dossiers SET generation_status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(now_ts())
        .bind(dossier_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(LifecycleError::dossier_not_found(dossier_id).into());
        }
        Ok(())
    }

    async fn complete_generation(
        &self,
        dossier_id: &str,
        content: &GeneratedContent,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE dossiers
            SET title = ?, description = ?, icon = ?, color = ?, example_questions_json = ?,
                generation_status = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&content.title)
        .bind(&content.description)
        .bind(&content.icon)
        .bind(&content.color)
        .bind(serde_json::to_string(&content.example_questions)?)
        .bind(GenerationStatus::Completed.as_str())
        .bind(now_ts())
        .bind(dossier_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(LifecycleError::dossier_not_found(dossier_id).into());
        }
        Ok(())
    }

    async fn apply_callback(
        &self,
        dossier_id: &str,
        document_type: DocumentType,
        status: CallbackStatus,
    ) -> Result<CallbackOutcome> {
        let now = now_ts();
        let target = status.source_status();
        let mut tx = self.pool.begin().await?;

        let found = sqlx::query(
            "UPDATE dossiers SET generation_status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.generation_status().as_str())
        .bind(now)
        .bind(dossier_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if found == 0 {
            return Err(LifecycleError::dossier_not_found(dossier_id).into());
        }

        let rows = sqlx::query(
            "SELECT id, processing_status FROM sources \
             WHERE dossier_id = ? AND document_type = ? ORDER BY created_at, rowid",
        )
        .bind(dossier_id)
        .bind(document_type.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let mut outcome = CallbackOutcome::default();
        for row in &rows {
            let id: String = row.try_get("id")?;
            let current: SourceStatus = row.try_get::<String, _>("processing_status")?.parse()?;
            match callback_effect(current, status) {
                CallbackEffect::Update => {
                    sqlx::query(
                        "UPDATE sources SET processing_status = ?, updated_at = ? WHERE id = ?",
                    )
                    .bind(target.as_str())
                    .bind(now)
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
                    outcome.updated.push(id);
                }
                CallbackEffect::Unchanged => outcome.unchanged.push(id),
                CallbackEffect::Skip => outcome.skipped.push(id),
            }
        }

        if target == SourceStatus::Completed && !outcome.updated.is_empty() {
            sqlx::query(
                "UPDATE dossiers SET sources_processed = sources_processed + ? WHERE id = ?",
            )
            .bind(outcome.updated.len() as i64)
            .bind(dossier_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn fail_stale_processing(&self, cutoff: i64, reason: &str) -> Result<Vec<Source>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sources WHERE processing_status = 'processing' AND updated_at < ? \
             ORDER BY updated_at",
            SOURCE_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let now = now_ts();
        let mut failed = Vec::new();
        for row in &rows {
            let mut source = source_from_row(row)?;
            source.metadata = with_failure_reason(&source.metadata, reason);
            source.processing_status = SourceStatus::Failed;
            source.updated_at = now;

            // Skip rows a callback finished in the meantime
            let written = sqlx::query(
                "UPDATE sources SET processing_status = 'failed', metadata_json = ?, updated_at = ? \
                 WHERE id = ? AND processing_status = 'processing'",
            )
            .bind(source.metadata.to_string())
            .bind(now)
            .bind(&source.id)
            .execute(&self.pool)
            .await?
            .rows_affected();
            if written == 1 {
                failed.push(source);
            }
        }
        Ok(failed)
    }

    async fn record_analysis_result(&self, input: &NewAnalysisResult) -> Result<AnalysisResult> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO analysis_checklist (id, topic_title) VALUES (?, ?) \
             ON CONFLICT(topic_title) DO NOTHING",
        )
        .bind(new_id())
        .bind(&input.checklist_topic)
        .execute(&mut *tx)
        .await?;

        let exists = sqlx::query("SELECT 1 FROM dossiers WHERE id = ?")
            .bind(&input.dossier_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(LifecycleError::dossier_not_found(&input.dossier_id).into());
        }

        let checklist_id: String =
            sqlx::query_scalar("SELECT id FROM analysis_checklist WHERE topic_title = ?")
                .bind(&input.checklist_topic)
                .fetch_one(&mut *tx)
                .await?;

        let result = AnalysisResult {
            id: new_id(),
            checklist_topic: input.checklist_topic.clone(),
            summary: input.summary.clone(),
            confidence_score: input.confidence_score,
            created_at: now_ts(),
        };

        sqlx::query(
            "INSERT INTO analysis_results (id, dossier_id, checklist_id, summary, confidence_score, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&result.id)
        .bind(&input.dossier_id)
        .bind(&checklist_id)
        .bind(&result.summary)
        .bind(result.confidence_score)
        .bind(result.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result)
    }

    async fn list_analysis_results(&self, dossier_id: &str) -> Result<Vec<AnalysisResult>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, c.topic_title, r.summary, r.confidence_score, r.created_at
            FROM analysis_results r
            JOIN analysis_checklist c ON c.id = r.checklist_id
            WHERE r.dossier_id = ?
            ORDER BY r.created_at, r.rowid
            "#,
        )
        .bind(dossier_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(AnalysisResult {
                    id: row.try_get("id")?,
                    checklist_topic: row.try_get("topic_title")?,
                    summary: row.try_get("summary")?,
                    confidence_score: row.try_get("confidence_score")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn enqueue_job(
        &self,
        kind: JobKind,
        dossier_id: &str,
        payload: &serde_json::Value,
    ) -> Result<OutboxJob> {
        let now = now_ts();
        let job = OutboxJob {
            id: new_id(),
            kind,
            dossier_id: dossier_id.to_string(),
            payload: payload.clone(),
            state: JobState::Pending,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO outbox_jobs (id, kind, dossier_id, payload_json, state, attempts, \
             next_attempt_at, last_error, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 0, ?, NULL, ?, ?)",
        )
        .bind(&job.id)
        .bind(job.kind.as_str())
        .bind(&job.dossier_id)
        .bind(job.payload.to_string())
        .bind(job.state.as_str())
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(job)
    }

    async fn due_jobs(&self, now: i64, limit: i64) -> Result<Vec<OutboxJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM outbox_jobs WHERE state = 'pending' AND next_attempt_at <= ? \
             ORDER BY next_attempt_at, rowid LIMIT ?",
            JOB_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn mark_job_delivered(&self, id: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE outbox_jobs SET state = 'delivered', attempts = attempts + 1, updated_at = ? \
             WHERE id = ?",
        )
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(LifecycleError::job_not_found(id).into());
        }
        Ok(())
    }

    async fn record_job_failure(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: i64,
        dead: bool,
    ) -> Result<OutboxJob> {
        let updated = sqlx::query(
            r#"
            UPDATE outbox_jobs
            SET attempts = attempts + 1, last_error = ?, next_attempt_at = ?,
                state = CASE WHEN ? THEN 'dead' ELSE state END, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(next_attempt_at)
        .bind(dead)
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(LifecycleError::job_not_found(id).into());
        }
        self.job(id).await
    }

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<OutboxJob>> {
        let state = state.map(|s| s.as_str());
        let rows = sqlx::query(&format!(
            "SELECT {} FROM outbox_jobs WHERE (? IS NULL OR state = ?) ORDER BY created_at, rowid",
            JOB_COLUMNS
        ))
        .bind(state)
        .bind(state)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn requeue_job(&self, id: &str, now: i64) -> Result<OutboxJob> {
        let updated = sqlx::query(
            "UPDATE outbox_jobs SET state = 'pending', attempts = 0, next_attempt_at = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(LifecycleError::job_not_found(id).into());
        }
        self.job(id).await
    }
}
