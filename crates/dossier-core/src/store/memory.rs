//! In-memory [`Store`] implementation for tests and embedding.
//!
//! All state sits behind one `RwLock`, so every trait method is atomic with
//! respect to the others, which is what the first-source claim and the
//! counter increments rely on.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::error::LifecycleError;
use crate::lifecycle::{callback_effect, CallbackEffect};
use crate::models::{
    new_id, now_ts, AnalysisResult, CallbackOutcome, CallbackStatus, DocumentType, Dossier,
    GeneratedContent, GenerationStatus, JobKind, JobState, NewAnalysisResult, NewDossier,
    NewSource, OutboxJob, Source, SourceCreated, SourceStatus, SourceUpdate, DEFAULT_COLOR,
    DEFAULT_ICON,
};

use super::{apply_source_update, with_failure_reason, Store};

struct StoredResult {
    dossier_id: String,
    result: AnalysisResult,
}

#[derive(Default)]
struct MemoryState {
    dossiers: Vec<Dossier>,
    sources: Vec<Source>,
    /// Checklist topics as `(id, title)`.
    checklist: Vec<(String, String)>,
    results: Vec<StoredResult>,
    jobs: Vec<OutboxJob>,
}

impl MemoryState {
    fn dossier_mut(&mut self, id: &str) -> Result<&mut Dossier> {
        self.dossiers
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| LifecycleError::dossier_not_found(id).into())
    }

    fn job_mut(&mut self, id: &str) -> Result<&mut OutboxJob> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| LifecycleError::job_not_found(id).into())
    }
}

/// In-memory store for tests.
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_dossier(&self, input: &NewDossier) -> Result<Dossier> {
        let now = now_ts();
        let dossier = Dossier {
            id: new_id(),
            owner_id: input.owner_id.clone(),
            title: input
                .title
                .clone()
                .unwrap_or_else(|| "Untitled dossier".to_string()),
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
        self.write()?.dossiers.push(dossier.clone());
        Ok(dossier)
    }

    async fn get_dossier(&self, id: &str) -> Result<Option<Dossier>> {
        Ok(self.read()?.dossiers.iter().find(|d| d.id == id).cloned())
    }

    async fn list_dossiers(&self, owner_id: Option<&str>) -> Result<Vec<Dossier>> {
        let state = self.read()?;
        Ok(state
            .dossiers
            .iter()
            .rev()
            .filter(|d| owner_id.map_or(true, |o| d.owner_id == o))
            .cloned()
            .collect())
    }

    async fn delete_dossier(&self, id: &str) -> Result<Vec<Source>> {
        let mut state = self.write()?;
        let idx = state
            .dossiers
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| LifecycleError::dossier_not_found(id))?;
        state.dossiers.remove(idx);

        let (removed, kept): (Vec<Source>, Vec<Source>) = std::mem::take(&mut state.sources)
            .into_iter()
            .partition(|s| s.dossier_id == id);
        state.sources = kept;
        state.results.retain(|r| r.dossier_id != id);
        Ok(removed)
    }

    async fn create_source(&self, input: &NewSource) -> Result<SourceCreated> {
        let mut guard = self.write()?;
        let state = &mut *guard;
        let now = now_ts();

        let dossier = state
            .dossiers
            .iter_mut()
            .find(|d| d.id == input.dossier_id)
            .ok_or_else(|| LifecycleError::dossier_not_found(&input.dossier_id))?;

        if let Some(document_type) = input.document_type {
            let taken = state.sources.iter().any(|s| {
                s.dossier_id == input.dossier_id && s.document_type == Some(document_type)
            });
            if taken {
                return Err(LifecycleError::DuplicateDocumentType {
                    dossier_id: input.dossier_id.clone(),
                    document_type,
                }
                .into());
            }
        }

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

        let claimed_first = input.source_type.is_processable() && dossier.first_source_id.is_none();
        if claimed_first {
            dossier.first_source_id = Some(source.id.clone());
            dossier.updated_at = now;
        }

        state.sources.push(source.clone());
        Ok(SourceCreated {
            source,
            claimed_first,
        })
    }

    async fn get_source(&self, id: &str) -> Result<Option<Source>> {
        Ok(self.read()?.sources.iter().find(|s| s.id == id).cloned())
    }

    async fn list_sources(&self, dossier_id: &str) -> Result<Vec<Source>> {
        Ok(self
            .read()?
            .sources
            .iter()
            .filter(|s| s.dossier_id == dossier_id)
            .cloned()
            .collect())
    }

    async fn update_source(&self, id: &str, update: &SourceUpdate) -> Result<Source> {
        let mut state = self.write()?;
        let source = state
            .sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| LifecycleError::source_not_found(id))?;
        apply_source_update(source, update, now_ts())?;
        Ok(source.clone())
    }

    async fn increment_sources_uploaded(&self, dossier_id: &str, by: i64) -> Result<i64> {
        let mut state = self.write()?;
        let dossier = state.dossier_mut(dossier_id)?;
        dossier.sources_uploaded += by;
        dossier.updated_at = now_ts();
        Ok(dossier.sources_uploaded)
    }

    async fn set_generation_status(
        &self,
        dossier_id: &str,
        status: GenerationStatus,
    ) -> Result<()> {
        let mut state = self.write()?;
        let dossier = state.dossier_mut(dossier_id)?;
        dossier.generation_status = status;
        dossier.updated_at = now_ts();
        Ok(())
    }

    async fn complete_generation(
        &self,
        dossier_id: &str,
        content: &GeneratedContent,
    ) -> Result<()> {
        let mut state = self.write()?;
        let dossier = state.dossier_mut(dossier_id)?;
        dossier.title = content.title.clone();
        dossier.description = content.description.clone();
        dossier.icon = content.icon.clone();
        dossier.color = content.color.clone();
        dossier.example_questions = content.example_questions.clone();
        dossier.generation_status = GenerationStatus::Completed;
        dossier.updated_at = now_ts();
        Ok(())
    }

    async fn apply_callback(
        &self,
        dossier_id: &str,
        document_type: DocumentType,
        status: CallbackStatus,
    ) -> Result<CallbackOutcome> {
        let mut guard = self.write()?;
        let state = &mut *guard;
        let now = now_ts();

        if !state.dossiers.iter().any(|d| d.id == dossier_id) {
            return Err(LifecycleError::dossier_not_found(dossier_id).into());
        }

        let target = status.source_status();
        let mut outcome = CallbackOutcome::default();
        for source in state
            .sources
            .iter_mut()
            .filter(|s| s.dossier_id == dossier_id && s.document_type == Some(document_type))
        {
            match callback_effect(source.processing_status, status) {
                CallbackEffect::Update => {
                    source.processing_status = target;
                    source.updated_at = now;
                    outcome.updated.push(source.id.clone());
                }
                CallbackEffect::Unchanged => outcome.unchanged.push(source.id.clone()),
                CallbackEffect::Skip => outcome.skipped.push(source.id.clone()),
            }
        }

        let dossier = state.dossier_mut(dossier_id)?;
        if target == SourceStatus::Completed {
            dossier.sources_processed += outcome.updated.len() as i64;
        }
        dossier.generation_status = status.generation_status();
        dossier.updated_at = now;
        Ok(outcome)
    }

    async fn fail_stale_processing(&self, cutoff: i64, reason: &str) -> Result<Vec<Source>> {
        let mut state = self.write()?;
        let now = now_ts();
        let mut failed = Vec::new();
        for source in state
            .sources
            .iter_mut()
            .filter(|s| s.processing_status == SourceStatus::Processing && s.updated_at < cutoff)
        {
            source.processing_status = SourceStatus::Failed;
            source.metadata = with_failure_reason(&source.metadata, reason);
            source.updated_at = now;
            failed.push(source.clone());
        }
        Ok(failed)
    }

    async fn record_analysis_result(&self, input: &NewAnalysisResult) -> Result<AnalysisResult> {
        let mut state = self.write()?;
        if !state.dossiers.iter().any(|d| d.id == input.dossier_id) {
            return Err(LifecycleError::dossier_not_found(&input.dossier_id).into());
        }
        if !state
            .checklist
            .iter()
            .any(|(_, title)| *title == input.checklist_topic)
        {
            state
                .checklist
                .push((new_id(), input.checklist_topic.clone()));
        }

        let result = AnalysisResult {
            id: new_id(),
            checklist_topic: input.checklist_topic.clone(),
            summary: input.summary.clone(),
            confidence_score: input.confidence_score,
            created_at: now_ts(),
        };
        state.results.push(StoredResult {
            dossier_id: input.dossier_id.clone(),
            result: result.clone(),
        });
        Ok(result)
    }

    async fn list_analysis_results(&self, dossier_id: &str) -> Result<Vec<AnalysisResult>> {
        Ok(self
            .read()?
            .results
            .iter()
            .filter(|r| r.dossier_id == dossier_id)
            .map(|r| r.result.clone())
            .collect())
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
        self.write()?.jobs.push(job.clone());
        Ok(job)
    }

    async fn due_jobs(&self, now: i64, limit: i64) -> Result<Vec<OutboxJob>> {
        let state = self.read()?;
        let mut due: Vec<OutboxJob> = state
            .jobs
            .iter()
            .filter(|j| j.state == JobState::Pending && j.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|j| j.next_attempt_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn mark_job_delivered(&self, id: &str) -> Result<()> {
        let mut state = self.write()?;
        let job = state.job_mut(id)?;
        job.state = JobState::Delivered;
        job.attempts += 1;
        job.updated_at = now_ts();
        Ok(())
    }

    async fn record_job_failure(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: i64,
        dead: bool,
    ) -> Result<OutboxJob> {
        let mut state = self.write()?;
        let job = state.job_mut(id)?;
        job.attempts += 1;
        job.last_error = Some(error.to_string());
        job.next_attempt_at = next_attempt_at;
        if dead {
            job.state = JobState::Dead;
        }
        job.updated_at = now_ts();
        Ok(job.clone())
    }

    async fn list_jobs(&self, state_filter: Option<JobState>) -> Result<Vec<OutboxJob>> {
        Ok(self
            .read()?
            .jobs
            .iter()
            .filter(|j| state_filter.map_or(true, |s| j.state == s))
            .cloned()
            .collect())
    }

    async fn requeue_job(&self, id: &str, now: i64) -> Result<OutboxJob> {
        let mut state = self.write()?;
        let job = state.job_mut(id)?;
        job.state = JobState::Pending;
        job.attempts = 0;
        job.next_attempt_at = now;
        job.updated_at = now;
        Ok(job.clone())
    }
}
