//! Source registry: creating sources and moving them through the lifecycle.
//!
//! Creation always yields a `pending` source. Status changes go through
//! [`update_source`], which refuses backward moves and anything leaving a
//! terminal state; all other fields are last-write-wins.

use anyhow::Result;
use tracing::{debug, info, warn};

use dossier_core::error::LifecycleError;
use dossier_core::models::{NewSource, Source, SourceCreated, SourceStatus, SourceType, SourceUpdate};
use dossier_core::store::{with_failure_reason, Store};

fn validate_new_source(input: &NewSource) -> Result<(), LifecycleError> {
    if input.dossier_id.trim().is_empty() {
        return Err(LifecycleError::Validation("dossier id is required".into()));
    }
    if input.title.trim().is_empty() {
        return Err(LifecycleError::Validation("source title is required".into()));
    }
    if input.content.is_some() && input.url.is_some() {
        return Err(LifecycleError::Validation(
            "a source carries either content or a url, not both".into(),
        ));
    }
    if matches!(input.source_type, SourceType::Website | SourceType::Youtube)
        && input.url.as_deref().map_or(true, |u| u.trim().is_empty())
    {
        return Err(LifecycleError::Validation(format!(
            "{} sources require a url",
            input.source_type
        )));
    }
    if let Some(size) = input.file_size {
        if size < 0 {
            return Err(LifecycleError::Validation("file size must be >= 0".into()));
        }
    }
    Ok(())
}

/// Validate and insert a new `pending` source.
pub async fn create_source(store: &dyn Store, input: &NewSource) -> Result<SourceCreated> {
    validate_new_source(input)?;
    let created = store.create_source(input).await?;
    info!(
        dossier_id = %created.source.dossier_id,
        source_id = %created.source.id,
        source_type = %created.source.source_type,
        claimed_first = created.claimed_first,
        "source created"
    );
    Ok(created)
}

pub async fn update_source(store: &dyn Store, id: &str, update: &SourceUpdate) -> Result<Source> {
    if let Some(ref title) = update.title {
        if title.trim().is_empty() {
            return Err(LifecycleError::Validation("source title must not be empty".into()).into());
        }
    }
    let source = store.update_source(id, update).await?;
    debug!(source_id = %id, status = %source.processing_status, "source updated");
    Ok(source)
}

pub async fn mark_uploading(store: &dyn Store, id: &str) -> Result<Source> {
    update_source(store, id, &SourceUpdate::status(SourceStatus::Uploading)).await
}

/// Move a source to `processing`, recording where its bytes now live.
pub async fn mark_processing(store: &dyn Store, id: &str, file_path: Option<&str>) -> Result<Source> {
    let update = SourceUpdate {
        processing_status: Some(SourceStatus::Processing),
        file_path: file_path.map(str::to_string),
        ..Default::default()
    };
    update_source(store, id, &update).await
}

/// Fail a source, keeping its metadata and adding `failure_reason`.
pub async fn mark_failed(store: &dyn Store, id: &str, reason: &str) -> Result<Source> {
    let current = store
        .get_source(id)
        .await?
        .ok_or_else(|| LifecycleError::source_not_found(id))?;
    let update = SourceUpdate {
        processing_status: Some(SourceStatus::Failed),
        metadata: Some(with_failure_reason(&current.metadata, reason)),
        ..Default::default()
    };
    let source = update_source(store, id, &update).await?;
    warn!(source_id = %id, reason, "source failed");
    Ok(source)
}
