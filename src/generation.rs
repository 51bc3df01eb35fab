//! One-time generation of dossier title, summary, icon, color and example
//! questions.
//!
//! Only the source that claimed a dossier's first-source slot fires this.
//! A failed call marks the dossier `failed` and writes nothing else.

use anyhow::Result;
use tracing::{error, info};

use dossier_core::models::{GenerationStatus, Source, SourceType};
use dossier_core::store::Store;

use crate::pipeline::{GenerationRequest, Pipelines};

/// Build the generation request for `source`.
///
/// Files send their public URL, websites their address, and pasted text
/// sends nothing.
pub fn request_for(source: &Source, file_url: Option<&str>) -> GenerationRequest {
    let file_path = match source.source_type {
        SourceType::Text => None,
        SourceType::Website | SourceType::Youtube => source.url.clone(),
        SourceType::Pdf | SourceType::Audio => file_url
            .map(str::to_string)
            .or_else(|| source.file_path.clone()),
    };
    GenerationRequest {
        source_type: source.source_type,
        file_path,
    }
}

/// Run generation for a dossier and return the resulting status.
///
/// Pipeline failures end in `failed` and are not errors; only store
/// failures propagate.
pub async fn generate(
    store: &dyn Store,
    pipelines: &dyn Pipelines,
    dossier_id: &str,
    request: &GenerationRequest,
) -> Result<GenerationStatus> {
    store
        .set_generation_status(dossier_id, GenerationStatus::Generating)
        .await?;
    info!(dossier_id, source_type = %request.source_type, "generation started");

    let content = match pipelines.generate(request).await {
        Ok(output) => output.into_content().map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };

    match content {
        Ok(content) => {
            store.complete_generation(dossier_id, &content).await?;
            info!(dossier_id, title = %content.title, "generation completed");
            Ok(GenerationStatus::Completed)
        }
        Err(e) => {
            error!(dossier_id, error = %e, "generation failed");
            store
                .set_generation_status(dossier_id, GenerationStatus::Failed)
                .await?;
            Ok(GenerationStatus::Failed)
        }
    }
}
