//! Persistent outbound queue for pipeline notifications.
//!
//! A notification is written to `outbox_jobs` before anything is sent, so
//! a crash or an unreachable pipeline never loses it. The worker delivers
//! due jobs, reschedules failures with exponential backoff, and parks a job
//! as `dead` once `outbox.max_attempts` is spent. Dead jobs stay visible
//! and can be re-queued by hand.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use dossier_core::models::{now_ts, JobKind, OutboxJob};
use dossier_core::store::Store;

use crate::config::OutboxConfig;
use crate::pipeline::{DocumentNotification, Pipelines};

/// Totals from one pass over the due jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub retried: usize,
    pub dead: usize,
}

/// Seconds to wait before the next attempt after `attempts` failures:
/// 1s, 2s, 4s, ... capped at 32s.
pub fn backoff_secs(attempts: i64) -> i64 {
    1 << (attempts.max(1) - 1).min(5)
}

/// Queue a document notification for delivery.
pub async fn enqueue_notification(
    store: &dyn Store,
    notification: &DocumentNotification,
) -> Result<OutboxJob> {
    let payload = serde_json::to_value(notification)?;
    let job = store
        .enqueue_job(JobKind::DocumentNotification, &notification.dossier_id, &payload)
        .await?;
    debug!(job_id = %job.id, dossier_id = %job.dossier_id, "notification queued");
    Ok(job)
}

async fn send(pipelines: &dyn Pipelines, job: &OutboxJob) -> Result<()> {
    match job.kind {
        JobKind::DocumentNotification => {
            let notification: DocumentNotification = serde_json::from_value(job.payload.clone())?;
            pipelines.notify_document(&notification).await
        }
    }
}

/// Attempt every job that is due now.
pub async fn deliver_due(
    store: &dyn Store,
    pipelines: &dyn Pipelines,
    config: &OutboxConfig,
) -> Result<DeliveryReport> {
    let mut report = DeliveryReport::default();
    let jobs = store.due_jobs(now_ts(), config.batch_size).await?;

    for job in jobs {
        match send(pipelines, &job).await {
            Ok(()) => {
                store.mark_job_delivered(&job.id).await?;
                info!(job_id = %job.id, dossier_id = %job.dossier_id, "job delivered");
                report.delivered += 1;
            }
            Err(e) => {
                let attempts = job.attempts + 1;
                let dead = attempts >= i64::from(config.max_attempts);
                let next = now_ts() + backoff_secs(attempts);
                store
                    .record_job_failure(&job.id, &e.to_string(), next, dead)
                    .await?;
                if dead {
                    error!(job_id = %job.id, attempts, error = %e, "job moved to dead letter");
                    report.dead += 1;
                } else {
                    warn!(job_id = %job.id, attempts, error = %e, "job delivery failed, will retry");
                    report.retried += 1;
                }
            }
        }
    }
    Ok(report)
}

/// Put a job back in the queue with a fresh attempt budget.
pub async fn retry(store: &dyn Store, id: &str) -> Result<OutboxJob> {
    let job = store.requeue_job(id, now_ts()).await?;
    info!(job_id = %id, "job re-queued");
    Ok(job)
}

/// Poll for due jobs until the task is dropped.
pub async fn run_worker(store: Arc<dyn Store>, pipelines: Arc<dyn Pipelines>, config: OutboxConfig) {
    let mut interval = tokio::time::interval(Duration::from_secs(config.poll_interval_secs.max(1)));
    loop {
        interval.tick().await;
        if let Err(e) = deliver_due(store.as_ref(), pipelines.as_ref(), &config).await {
            error!(error = %e, "outbox pass failed");
        }
    }
}
