//! Time-out for sources whose completion callback never arrives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use dossier_core::models::{now_ts, Source};
use dossier_core::store::Store;

use crate::config::LifecycleConfig;

pub const TIMEOUT_REASON: &str = "processing timed out";

/// Fail every source stuck in `processing` for longer than `timeout_secs`.
pub async fn sweep_stale(store: &dyn Store, timeout_secs: u64) -> Result<Vec<Source>> {
    let cutoff = now_ts() - timeout_secs as i64;
    let failed = store.fail_stale_processing(cutoff, TIMEOUT_REASON).await?;
    for source in &failed {
        warn!(
            source_id = %source.id,
            dossier_id = %source.dossier_id,
            "source timed out in processing"
        );
    }
    if !failed.is_empty() {
        info!(count = failed.len(), "stale sources failed");
    }
    Ok(failed)
}

/// Sweep periodically until the task is dropped. Returns at once when
/// the sweeper is disabled.
pub async fn run_sweeper(store: Arc<dyn Store>, config: LifecycleConfig) {
    if !config.sweeper_enabled() {
        return;
    }
    let mut interval = tokio::time::interval(Duration::from_secs(config.sweep_interval_secs));
    loop {
        interval.tick().await;
        if let Err(e) = sweep_stale(store.as_ref(), config.processing_timeout_secs).await {
            error!(error = %e, "stale source sweep failed");
        }
    }
}
