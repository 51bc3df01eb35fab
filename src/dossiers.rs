//! Dossier management and readiness.

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use dossier_core::error::LifecycleError;
use dossier_core::models::{Dossier, NewDossier, Source};
use dossier_core::store::Store;

/// How far a dossier's sources have come, as shown before analysis starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Readiness {
    /// Nothing uploaded yet.
    Empty,
    Processing { processed: i64, uploaded: i64 },
    Ready,
}

impl Readiness {
    pub fn of(dossier: &Dossier) -> Self {
        if dossier.sources_uploaded <= 0 {
            Readiness::Empty
        } else if dossier.sources_processed < dossier.sources_uploaded {
            Readiness::Processing {
                processed: dossier.sources_processed,
                uploaded: dossier.sources_uploaded,
            }
        } else {
            Readiness::Ready
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

impl std::fmt::Display for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Readiness::Empty => write!(f, "empty"),
            Readiness::Processing {
                processed,
                uploaded,
            } => write!(f, "processing ({} of {})", processed, uploaded),
            Readiness::Ready => write!(f, "ready"),
        }
    }
}

/// A dossier with its sources, as returned by `GET /dossiers/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct DossierDetail {
    #[serde(flatten)]
    pub dossier: Dossier,
    pub sources: Vec<Source>,
    pub readiness: Readiness,
}

pub async fn create(store: &dyn Store, owner_id: &str, title: Option<&str>) -> Result<Dossier> {
    if owner_id.trim().is_empty() {
        return Err(LifecycleError::Validation("owner id is required".into()).into());
    }
    let title = title.map(str::trim).filter(|t| !t.is_empty());
    let dossier = store
        .create_dossier(&NewDossier {
            owner_id: owner_id.to_string(),
            title: title.map(str::to_string),
        })
        .await?;
    info!(dossier_id = %dossier.id, owner_id, "dossier created");
    Ok(dossier)
}

pub async fn get(store: &dyn Store, id: &str) -> Result<Dossier> {
    Ok(store
        .get_dossier(id)
        .await?
        .ok_or_else(|| LifecycleError::dossier_not_found(id))?)
}

pub async fn detail(store: &dyn Store, id: &str) -> Result<DossierDetail> {
    let dossier = get(store, id).await?;
    let sources = store.list_sources(id).await?;
    let readiness = Readiness::of(&dossier);
    Ok(DossierDetail {
        dossier,
        sources,
        readiness,
    })
}

pub async fn list(store: &dyn Store, owner_id: Option<&str>) -> Result<Vec<Dossier>> {
    store.list_dossiers(owner_id).await
}

/// Delete a dossier with its sources and analysis results.
///
/// Stored objects are not removed from the bucket; the count of orphaned
/// files is logged.
pub async fn delete(store: &dyn Store, id: &str) -> Result<Vec<Source>> {
    let removed = store.delete_dossier(id).await?;
    let stored_files = removed.iter().filter(|s| s.file_path.is_some()).count();
    info!(
        dossier_id = %id,
        sources = removed.len(),
        stored_files,
        "dossier deleted"
    );
    Ok(removed)
}
