//! Upload counter maintenance.
//!
//! Counter failures never fail the operation they belong to: they are
//! logged and the caller carries on.

use tracing::{debug, error};

use dossier_core::store::Store;

/// Atomically add `by` to a dossier's `sources_uploaded`.
///
/// Returns the new value, or `None` when the increment failed.
pub async fn increment_uploaded_counter(store: &dyn Store, dossier_id: &str, by: i64) -> Option<i64> {
    match store.increment_sources_uploaded(dossier_id, by).await {
        Ok(value) => {
            debug!(dossier_id, by, sources_uploaded = value, "upload counter incremented");
            Some(value)
        }
        Err(e) => {
            error!(dossier_id, by, error = %e, "failed to increment upload counter");
            None
        }
    }
}
