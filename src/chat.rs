//! Question/answer chat over an analyzed dossier.

use anyhow::Result;
use tracing::debug;

use dossier_core::error::LifecycleError;
use dossier_core::store::Store;

use crate::dossiers;
use crate::pipeline::Pipelines;

/// Forward a message to the chat pipeline and return its reply.
pub async fn send(
    store: &dyn Store,
    pipelines: &dyn Pipelines,
    dossier_id: &str,
    message: &str,
) -> Result<String> {
    let message = message.trim();
    if dossier_id.trim().is_empty() {
        return Err(LifecycleError::Validation("dossierId is required".into()).into());
    }
    if message.is_empty() {
        return Err(LifecycleError::Validation("message is required".into()).into());
    }
    dossiers::get(store, dossier_id).await?;

    debug!(dossier_id, chars = message.len(), "forwarding chat message");
    pipelines.chat(dossier_id, message).await
}
