//! Upload coordination for files, pasted text and links.
//!
//! Every entry point returns as soon as the Source rows exist. The slow
//! part (byte transfer, counter update, notification, generation) runs in a
//! background task whose handle is returned to callers that want to wait.
//!
//! File batches go through three phases:
//!
//! 1. one write target per file is requested up front; if any request
//!    fails, nothing has been written and the error is returned;
//! 2. the first source is created, then the rest after `batch_stagger_ms`;
//! 3. in the background, at most `max_concurrent` transfers run at a time.
//!    Each successful transfer bumps the upload counter, moves the source to
//!    `processing`, queues a notifier job and, for the source that claimed
//!    the dossier's first slot, runs generation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use dossier_core::error::LifecycleError;
use dossier_core::models::{DocumentType, NewSource, Source, SourceCreated, SourceType};
use dossier_core::store::Store;

use crate::config::UploadConfig;
use crate::counter::increment_uploaded_counter;
use crate::generation;
use crate::outbox;
use crate::pipeline::{DocumentNotification, Pipelines};
use crate::registry;
use crate::storage::{ObjectStorage, WriteTarget};

/// The user on whose behalf sources are added.
#[derive(Debug, Clone)]
pub struct Actor {
    pub owner_id: String,
    pub email: String,
}

/// One file to upload.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub document_type: Option<DocumentType>,
}

/// Outcome of the background part of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

/// Sources created by a batch and the handle of its background work.
pub struct Submitted {
    pub sources: Vec<Source>,
    pub background: JoinHandle<BatchReport>,
}

#[derive(Clone)]
pub struct UploadCoordinator {
    store: Arc<dyn Store>,
    storage: Option<Arc<dyn ObjectStorage>>,
    pipelines: Arc<dyn Pipelines>,
    config: UploadConfig,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        storage: Option<Arc<dyn ObjectStorage>>,
        pipelines: Arc<dyn Pipelines>,
        config: UploadConfig,
    ) -> Self {
        Self {
            store,
            storage,
            pipelines,
            config,
        }
    }

    /// Create sources for `inputs`: the first alone, the rest after the
    /// configured stagger. On failure, sources already created are failed
    /// so none is left `pending` with no work behind it.
    async fn create_staggered(&self, inputs: Vec<NewSource>) -> Result<Vec<SourceCreated>> {
        let mut inputs = inputs.into_iter();
        let Some(first) = inputs.next() else {
            return Ok(Vec::new());
        };
        let rest: Vec<NewSource> = inputs.collect();

        let mut created = vec![registry::create_source(self.store.as_ref(), &first).await?];
        if rest.is_empty() {
            return Ok(created);
        }

        tokio::time::sleep(Duration::from_millis(self.config.batch_stagger_ms)).await;

        let mut set = JoinSet::new();
        for (index, input) in rest.into_iter().enumerate() {
            let store = self.store.clone();
            set.spawn(async move { (index, registry::create_source(store.as_ref(), &input).await) });
        }

        let mut slots: Vec<Option<SourceCreated>> = Vec::new();
        slots.resize_with(set.len(), || None);
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(c))) => slots[index] = Some(c),
                Ok((_, Err(e))) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(e.into());
                }
            }
        }
        created.extend(slots.into_iter().flatten());

        if let Some(e) = first_error {
            self.fail_created(&created, "batch aborted").await;
            return Err(e);
        }
        Ok(created)
    }

    async fn fail_created(&self, created: &[SourceCreated], reason: &str) {
        for c in created {
            if let Err(fe) = registry::mark_failed(self.store.as_ref(), &c.source.id, reason).await {
                error!(source_id = %c.source.id, error = %fe, "failed to fail source of aborted batch");
            }
        }
    }

    /// Fail early, before any write target is issued, when the dossier is
    /// unknown or already holds one of the batch's document types. The
    /// unique index still decides races.
    async fn check_free_document_types(&self, dossier_id: &str, files: &[FileUpload]) -> Result<()> {
        crate::dossiers::get(self.store.as_ref(), dossier_id).await?;
        let existing = self.store.list_sources(dossier_id).await?;
        for document_type in files.iter().filter_map(|f| f.document_type) {
            if existing.iter().any(|s| s.document_type == Some(document_type)) {
                return Err(LifecycleError::DuplicateDocumentType {
                    dossier_id: dossier_id.to_string(),
                    document_type,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Upload files into a dossier.
    pub async fn upload_files(
        &self,
        actor: &Actor,
        dossier_id: &str,
        files: Vec<FileUpload>,
    ) -> Result<Submitted> {
        if files.is_empty() {
            return Err(LifecycleError::Validation("no files to upload".into()).into());
        }
        let storage = self
            .storage
            .clone()
            .ok_or_else(|| LifecycleError::Validation("object storage is not configured".into()))?;
        check_batch_document_types(files.iter().map(|f| f.document_type))?;
        self.check_free_document_types(dossier_id, &files).await?;

        let mut targets = Vec::with_capacity(files.len());
        for file in &files {
            targets.push(
                storage
                    .request_write_target(&actor.owner_id, &file.filename, &file.content_type)
                    .await?,
            );
        }

        let inputs = files
            .iter()
            .map(|file| {
                let mut input = NewSource::new(
                    dossier_id,
                    file.filename.clone(),
                    SourceType::from_mime(&file.content_type),
                );
                input.document_type = file.document_type;
                input.file_size = Some(file.bytes.len() as i64);
                input.metadata = serde_json::json!({
                    "fileName": file.filename,
                    "fileType": file.content_type,
                });
                input
            })
            .collect();
        let created = self.create_staggered(inputs).await?;
        info!(dossier_id, files = created.len(), "upload batch accepted");

        let sources = created.iter().map(|c| c.source.clone()).collect();
        let this = self.clone();
        let actor = actor.clone();
        let background = tokio::spawn(async move {
            this.transfer_all(storage, actor, created, files, targets).await
        });
        Ok(Submitted {
            sources,
            background,
        })
    }

    async fn transfer_all(
        self,
        storage: Arc<dyn ObjectStorage>,
        actor: Actor,
        created: Vec<SourceCreated>,
        files: Vec<FileUpload>,
        targets: Vec<WriteTarget>,
    ) -> BatchReport {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut set = JoinSet::new();

        for ((c, file), target) in created.into_iter().zip(files).zip(targets) {
            let this = self.clone();
            let storage = storage.clone();
            let actor = actor.clone();
            let permits = permits.clone();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                this.transfer_one(storage.as_ref(), &actor, c, file, target).await
            });
        }

        let mut report = BatchReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(true) => report.succeeded += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    error!(error = %e, "transfer task panicked");
                    report.failed += 1;
                }
            }
        }
        info!(succeeded = report.succeeded, failed = report.failed, "upload batch finished");
        report
    }

    /// Transfer one file and advance its source. Returns whether it succeeded.
    async fn transfer_one(
        &self,
        storage: &dyn ObjectStorage,
        actor: &Actor,
        created: SourceCreated,
        file: FileUpload,
        target: WriteTarget,
    ) -> bool {
        let store = self.store.as_ref();
        let source = created.source;

        if let Err(e) = registry::mark_uploading(store, &source.id).await {
            error!(source_id = %source.id, error = %e, "cannot start upload");
            return false;
        }

        if let Err(e) = storage.put_object(&target, &file.content_type, file.bytes).await {
            warn!(source_id = %source.id, error = %e, "transfer failed");
            if let Err(fe) = registry::mark_failed(store, &source.id, &e.to_string()).await {
                error!(source_id = %source.id, error = %fe, "failed to record transfer failure");
            }
            return false;
        }

        increment_uploaded_counter(store, &source.dossier_id, 1).await;

        let source = match registry::mark_processing(store, &source.id, Some(&target.file_url)).await {
            Ok(s) => s,
            Err(e) => {
                error!(source_id = %source.id, error = %e, "failed to mark source processing");
                return false;
            }
        };

        self.queue_notification(actor, &source, &target.file_url).await;

        if created.claimed_first {
            self.run_generation(&source, Some(&target.file_url)).await;
        }
        true
    }

    async fn queue_notification(&self, actor: &Actor, source: &Source, url: &str) {
        let notification = DocumentNotification {
            actor_id: actor.owner_id.clone(),
            dossier_id: source.dossier_id.clone(),
            email: actor.email.clone(),
            document_type: source.document_type,
            document_url: url.to_string(),
        };
        if let Err(e) = outbox::enqueue_notification(self.store.as_ref(), &notification).await {
            error!(source_id = %source.id, error = %e, "failed to queue notification");
        }
    }

    async fn run_generation(&self, source: &Source, file_url: Option<&str>) {
        let request = generation::request_for(source, file_url);
        if let Err(e) = generation::generate(
            self.store.as_ref(),
            self.pipelines.as_ref(),
            &source.dossier_id,
            &request,
        )
        .await
        {
            error!(dossier_id = %source.dossier_id, error = %e, "generation could not be recorded");
        }
    }

    /// Add pasted text as a source. Text needs no transfer, so it goes
    /// straight to `processing`.
    pub async fn add_text(
        &self,
        dossier_id: &str,
        title: &str,
        content: &str,
    ) -> Result<Submitted> {
        if content.trim().is_empty() {
            return Err(LifecycleError::Validation("text content is required".into()).into());
        }
        let mut input = NewSource::new(dossier_id, title, SourceType::Text);
        input.content = Some(content.to_string());
        input.metadata = serde_json::json!({ "characterCount": content.chars().count() });

        let created = registry::create_source(self.store.as_ref(), &input).await?;
        let source = registry::mark_processing(self.store.as_ref(), &created.source.id, None).await?;
        increment_uploaded_counter(self.store.as_ref(), dossier_id, 1).await;

        let this = self.clone();
        let claimed = created.claimed_first;
        let bg_source = source.clone();
        let background = tokio::spawn(async move {
            if claimed {
                this.run_generation(&bg_source, None).await;
            }
            BatchReport {
                succeeded: 1,
                failed: 0,
            }
        });
        Ok(Submitted {
            sources: vec![source],
            background,
        })
    }

    /// Add one source per URL, first alone and the rest after the stagger.
    pub async fn add_websites(
        &self,
        actor: &Actor,
        dossier_id: &str,
        urls: &[String],
    ) -> Result<Submitted> {
        let urls: Vec<&str> = urls.iter().map(|u| u.trim()).filter(|u| !u.is_empty()).collect();
        if urls.is_empty() {
            return Err(LifecycleError::Validation("at least one url is required".into()).into());
        }
        if let Some(bad) = urls
            .iter()
            .find(|u| !u.starts_with("http://") && !u.starts_with("https://"))
        {
            return Err(LifecycleError::Validation(format!("not an http(s) url: '{}'", bad)).into());
        }

        let inputs = urls
            .iter()
            .enumerate()
            .map(|(i, url)| {
                let mut input =
                    NewSource::new(dossier_id, format!("Website {}: {}", i + 1, url), SourceType::Website);
                input.url = Some(url.to_string());
                input.metadata = serde_json::json!({ "originalUrl": url });
                input
            })
            .collect();
        let created = self.create_staggered(inputs).await?;

        let mut sources = Vec::with_capacity(created.len());
        let mut claimed = None;
        for c in &created {
            let source =
                match registry::mark_processing(self.store.as_ref(), &c.source.id, None).await {
                    Ok(source) => source,
                    Err(e) => {
                        self.fail_created(&created, "batch aborted").await;
                        return Err(e);
                    }
                };
            if c.claimed_first {
                claimed = Some(source.clone());
            }
            sources.push(source);
        }
        increment_uploaded_counter(self.store.as_ref(), dossier_id, sources.len() as i64).await;
        info!(dossier_id, urls = sources.len(), "websites added");

        let this = self.clone();
        let actor = actor.clone();
        let bg_sources = sources.clone();
        let background = tokio::spawn(async move {
            for source in &bg_sources {
                if let Some(ref url) = source.url {
                    this.queue_notification(&actor, source, url).await;
                }
            }
            if let Some(ref source) = claimed {
                this.run_generation(source, None).await;
            }
            BatchReport {
                succeeded: bg_sources.len(),
                failed: 0,
            }
        });
        Ok(Submitted {
            sources,
            background,
        })
    }
}

/// Reject a batch that names the same document type twice.
fn check_batch_document_types(
    types: impl Iterator<Item = Option<DocumentType>>,
) -> Result<(), LifecycleError> {
    let mut seen = Vec::new();
    for t in types.flatten() {
        if seen.contains(&t) {
            return Err(LifecycleError::Validation(format!(
                "document type '{}' appears more than once in the batch",
                t
            )));
        }
        seen.push(t);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_document_type_check() {
        assert!(check_batch_document_types(
            [Some(DocumentType::Edital), None, None, Some(DocumentType::Processo)].into_iter()
        )
        .is_ok());
        assert!(check_batch_document_types(
            [Some(DocumentType::Edital), Some(DocumentType::Edital)].into_iter()
        )
        .is_err());
    }
}
