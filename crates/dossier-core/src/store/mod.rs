//! Storage abstraction for Dossier Intake.
//!
//! The [`Store`] trait covers every persisted mutation of the lifecycle:
//! dossiers, sources, counters, generation fields, callback application,
//! analysis results, and the outbound job queue.
//!
//! Implementations must make each method atomic with respect to other
//! calls on the same store. Two guarantees matter most:
//!
//! - counter mutations are increments computed by the store, never a
//!   value read by the caller and written back;
//! - [`create_source`](Store::create_source) claims the dossier's
//!   first-processable-source slot in the same unit of work that inserts
//!   the source, so exactly one source ever observes `claimed_first`.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::LifecycleError;
use crate::models::{
    AnalysisResult, CallbackOutcome, CallbackStatus, DocumentType, Dossier, GeneratedContent,
    GenerationStatus, JobKind, JobState, NewAnalysisResult, NewDossier, NewSource, OutboxJob,
    Source, SourceCreated, SourceUpdate,
};

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_dossier`](Store::create_dossier) | Insert a dossier in `pending` generation |
/// | [`delete_dossier`](Store::delete_dossier) | Remove a dossier and cascade its sources |
/// | [`create_source`](Store::create_source) | Insert a source, enforce document-type uniqueness, claim first slot |
/// | [`update_source`](Store::update_source) | Partial update with transition check |
/// | [`increment_sources_uploaded`](Store::increment_sources_uploaded) | Atomic counter bump |
/// | [`complete_generation`](Store::complete_generation) | Write generated fields and `completed` together |
/// | [`apply_callback`](Store::apply_callback) | Bulk-update sources by document type and mirror the dossier status |
/// | [`fail_stale_processing`](Store::fail_stale_processing) | Time out sources stuck in `processing` |
/// | [`enqueue_job`](Store::enqueue_job) | Persist an outbound delivery |
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_dossier(&self, input: &NewDossier) -> Result<Dossier>;

    async fn get_dossier(&self, id: &str) -> Result<Option<Dossier>>;

    /// List dossiers, newest first, optionally restricted to one owner.
    async fn list_dossiers(&self, owner_id: Option<&str>) -> Result<Vec<Dossier>>;

    /// Delete a dossier together with its sources and analysis results.
    ///
    /// Returns the removed sources. Errors with `NotFound` for an unknown id.
    async fn delete_dossier(&self, id: &str) -> Result<Vec<Source>>;

    /// Insert a new `pending` source.
    ///
    /// Fails with `NotFound` when the dossier does not exist and with
    /// `DuplicateDocumentType` when the dossier already has a source of the
    /// same document type. For processable source types, atomically claims
    /// the dossier's first-source slot if it is still free.
    async fn create_source(&self, input: &NewSource) -> Result<SourceCreated>;

    async fn get_source(&self, id: &str) -> Result<Option<Source>>;

    /// Sources of a dossier in creation order.
    async fn list_sources(&self, dossier_id: &str) -> Result<Vec<Source>>;

    /// Apply a partial update. A status change must be a legal transition.
    async fn update_source(&self, id: &str, update: &SourceUpdate) -> Result<Source>;

    /// Add `by` to `sources_uploaded` and return the new value.
    async fn increment_sources_uploaded(&self, dossier_id: &str, by: i64) -> Result<i64>;

    async fn set_generation_status(&self, dossier_id: &str, status: GenerationStatus)
        -> Result<()>;

    /// Write generated title, description, icon, color and example questions
    /// and mark generation `completed`, all at once.
    async fn complete_generation(&self, dossier_id: &str, content: &GeneratedContent)
        -> Result<()>;

    /// Apply a pipeline status report.
    ///
    /// Every non-terminal source of `(dossier_id, document_type)` moves to the
    /// reported status; `sources_processed` grows by the number of sources
    /// that became `completed`; the dossier's generation status is set to
    /// the mirrored value.
    async fn apply_callback(
        &self,
        dossier_id: &str,
        document_type: DocumentType,
        status: CallbackStatus,
    ) -> Result<CallbackOutcome>;

    /// Fail every source that has been `processing` since before `cutoff`,
    /// recording `reason` under `metadata.failure_reason`.
    async fn fail_stale_processing(&self, cutoff: i64, reason: &str) -> Result<Vec<Source>>;

    async fn record_analysis_result(&self, input: &NewAnalysisResult) -> Result<AnalysisResult>;

    /// Analysis results of a dossier, oldest first.
    async fn list_analysis_results(&self, dossier_id: &str) -> Result<Vec<AnalysisResult>>;

    async fn enqueue_job(
        &self,
        kind: JobKind,
        dossier_id: &str,
        payload: &serde_json::Value,
    ) -> Result<OutboxJob>;

    /// Pending jobs whose next attempt is due at `now`, earliest first.
    async fn due_jobs(&self, now: i64, limit: i64) -> Result<Vec<OutboxJob>>;

    async fn mark_job_delivered(&self, id: &str) -> Result<()>;

    /// Count a failed attempt. When `dead` is set the job leaves the queue.
    async fn record_job_failure(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: i64,
        dead: bool,
    ) -> Result<OutboxJob>;

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<OutboxJob>>;

    /// Put a job back in the queue with a fresh attempt budget.
    async fn requeue_job(&self, id: &str, now: i64) -> Result<OutboxJob>;
}

/// Apply a [`SourceUpdate`] to an in-hand source.
///
/// The status transition is checked before anything is written, so a
/// rejected update leaves `source` untouched. Shared by store
/// implementations that load the row, update it, and write it back inside
/// one transaction.
pub fn apply_source_update(
    source: &mut Source,
    update: &SourceUpdate,
    now: i64,
) -> Result<(), LifecycleError> {
    if let Some(next) = update.processing_status {
        source.processing_status.check_transition(next)?;
    }

    if let Some(ref title) = update.title {
        source.title = title.clone();
    }
    if let Some(next) = update.processing_status {
        source.processing_status = next;
    }
    if let Some(ref path) = update.file_path {
        source.file_path = Some(path.clone());
    }
    if let Some(ref content) = update.content {
        source.content = Some(content.clone());
    }
    if let Some(ref metadata) = update.metadata {
        source.metadata = metadata.clone();
    }
    source.updated_at = now;
    Ok(())
}

/// Return `metadata` with `failure_reason` set, turning non-objects into one.
pub fn with_failure_reason(metadata: &serde_json::Value, reason: &str) -> serde_json::Value {
    let mut map = match metadata {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    map.insert(
        "failure_reason".to_string(),
        serde_json::Value::String(reason.to_string()),
    );
    serde_json::Value::Object(map)
}
