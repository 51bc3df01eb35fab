//! Analysis results per dossier and the trigger that starts an analysis.
//!
//! Results are written by the analysis pipeline and read by the dashboard,
//! which polls until the list is non-empty.

use anyhow::Result;
use tracing::info;

use dossier_core::error::LifecycleError;
use dossier_core::models::{AnalysisResult, NewAnalysisResult};
use dossier_core::store::Store;

use crate::dossiers::{self, Readiness};
use crate::pipeline::Pipelines;

/// Results for a dossier in creation order. Empty means still processing.
pub async fn results(store: &dyn Store, dossier_id: &str) -> Result<Vec<AnalysisResult>> {
    dossiers::get(store, dossier_id).await?;
    store.list_analysis_results(dossier_id).await
}

pub async fn record(store: &dyn Store, input: &NewAnalysisResult) -> Result<AnalysisResult> {
    if input.checklist_topic.trim().is_empty() {
        return Err(LifecycleError::Validation("checklistTopic is required".into()).into());
    }
    if input.summary.trim().is_empty() {
        return Err(LifecycleError::Validation("summary is required".into()).into());
    }
    if let Some(score) = input.confidence_score {
        if !(0.0..=1.0).contains(&score) {
            return Err(LifecycleError::Validation(
                "confidenceScore must be between 0 and 1".into(),
            )
            .into());
        }
    }
    let result = store.record_analysis_result(input).await?;
    info!(
        dossier_id = %input.dossier_id,
        topic = %result.checklist_topic,
        "analysis result recorded"
    );
    Ok(result)
}

/// Ask the analysis pipeline to analyze a dossier whose sources are all
/// processed.
pub async fn start(store: &dyn Store, pipelines: &dyn Pipelines, dossier_id: &str) -> Result<()> {
    let dossier = dossiers::get(store, dossier_id).await?;
    let readiness = Readiness::of(&dossier);
    if !readiness.is_ready() {
        return Err(LifecycleError::Validation(format!(
            "dossier is not ready for analysis: {}",
            readiness
        ))
        .into());
    }
    pipelines.start_analysis(dossier_id).await?;
    info!(dossier_id, "analysis started");
    Ok(())
}
