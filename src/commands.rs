//! CLI command implementations. Each prints its result to stdout.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use dossier_core::models::{CallbackOutcome, Dossier, JobState, Source};

use crate::analysis;
use crate::callback::{self, CallbackRequest};
use crate::chat;
use crate::config::Config;
use crate::dossiers::{self, Readiness};
use crate::outbox;
use crate::services::Services;
use crate::storage::GatewayStorage;
use crate::sweep;
use crate::upload::{Actor, FileUpload, Submitted};

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn print_sources(sources: &[Source]) {
    println!(
        "{:<36}  {:<8}  {:<10}  {:<11}  TITLE",
        "SOURCE", "TYPE", "DOCUMENT", "STATUS"
    );
    for s in sources {
        println!(
            "{:<36}  {:<8}  {:<10}  {:<11}  {}",
            s.id,
            s.source_type,
            s.document_type.map(|t| t.as_str()).unwrap_or("-"),
            s.processing_status,
            s.title
        );
    }
}

fn print_outcome(outcome: &CallbackOutcome) {
    println!(
        "updated: {}  unchanged: {}  skipped: {}",
        outcome.updated.len(),
        outcome.unchanged.len(),
        outcome.skipped.len()
    );
    for id in &outcome.skipped {
        println!("  skipped (terminal): {}", id);
    }
}

pub async fn run_create(config: &Config, owner: &str, title: Option<&str>) -> Result<()> {
    let services = Services::from_config(config).await?;
    let dossier = dossiers::create(services.store.as_ref(), owner, title).await?;
    println!("{}", dossier.id);
    Ok(())
}

pub async fn run_list(config: &Config, owner: Option<&str>) -> Result<()> {
    let services = Services::from_config(config).await?;
    let list: Vec<Dossier> = dossiers::list(services.store.as_ref(), owner).await?;
    if list.is_empty() {
        println!("No dossiers.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<10}  {:<20}  {:<22}  TITLE",
        "DOSSIER", "GENERATION", "CREATED", "READINESS"
    );
    for d in &list {
        println!(
            "{:<36}  {:<10}  {:<20}  {:<22}  {}",
            d.id,
            d.generation_status,
            format_ts(d.created_at),
            Readiness::of(d).to_string(),
            d.title
        );
    }
    Ok(())
}

pub async fn run_show(config: &Config, id: &str) -> Result<()> {
    let services = Services::from_config(config).await?;
    let detail = dossiers::detail(services.store.as_ref(), id).await?;
    let d = &detail.dossier;

    println!("--- Dossier ---");
    println!("id:           {}", d.id);
    println!("owner:        {}", d.owner_id);
    println!("title:        {} {}", d.icon, d.title);
    if let Some(ref desc) = d.description {
        println!("description:  {}", desc);
    }
    println!("color:        {}", d.color);
    println!("generation:   {}", d.generation_status);
    println!("readiness:    {}", detail.readiness);
    println!(
        "sources:      {} uploaded, {} processed",
        d.sources_uploaded, d.sources_processed
    );
    println!("created_at:   {}", format_ts(d.created_at));
    println!("updated_at:   {}", format_ts(d.updated_at));
    if !d.example_questions.is_empty() {
        println!();
        println!("--- Example questions ---");
        for q in &d.example_questions {
            println!("  - {}", q);
        }
    }
    println!();
    print_sources(&detail.sources);
    Ok(())
}

pub async fn run_delete(config: &Config, id: &str) -> Result<()> {
    let services = Services::from_config(config).await?;
    let removed = dossiers::delete(services.store.as_ref(), id).await?;
    println!("Deleted dossier {} ({} sources).", id, removed.len());
    Ok(())
}

/// MIME type from a file extension.
fn detect_content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("pdf") => "application/pdf",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("m4a") => "audio/mp4",
        Some("ogg") => "audio/ogg",
        Some("md") => "text/markdown",
        Some("html") | Some("htm") => "text/html",
        _ => "text/plain",
    }
}

/// Wait for background work, then flush queued notifications once.
async fn finish(services: &Services, config: &Config, submitted: Submitted) -> Result<()> {
    let report = submitted
        .background
        .await
        .context("background upload task failed")?;
    println!(
        "Processed: {} succeeded, {} failed.",
        report.succeeded, report.failed
    );
    let delivery = outbox::deliver_due(
        services.store.as_ref(),
        services.pipelines.as_ref(),
        &config.outbox,
    )
    .await?;
    println!(
        "Notifications: {} delivered, {} retrying, {} dead.",
        delivery.delivered, delivery.retried, delivery.dead
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn run_upload(
    config: &Config,
    dossier: &str,
    owner: &str,
    email: &str,
    document_type: Option<dossier_core::models::DocumentType>,
    gateway: Option<&str>,
    files: &[PathBuf],
) -> Result<()> {
    let mut services = Services::from_config(config).await?;
    if let Some(url) = gateway {
        let token = Config::secret(config.server.api_token_env.as_deref());
        services = services.with_storage(Arc::new(GatewayStorage::new(url, token)));
    }

    let mut uploads = Vec::with_capacity(files.len());
    for path in files {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Not a file name: {}", path.display()))?
            .to_string();
        uploads.push(FileUpload {
            filename,
            content_type: detect_content_type(path).to_string(),
            bytes,
            // A document type labels a single file.
            document_type: if files.len() == 1 { document_type } else { None },
        });
    }

    let actor = Actor {
        owner_id: owner.to_string(),
        email: email.to_string(),
    };
    let submitted = services
        .coordinator(config)
        .upload_files(&actor, dossier, uploads)
        .await?;
    print_sources(&submitted.sources);
    finish(&services, config, submitted).await
}

pub async fn run_add_text(config: &Config, dossier: &str, title: &str, content: &str) -> Result<()> {
    let services = Services::from_config(config).await?;
    let submitted = services
        .coordinator(config)
        .add_text(dossier, title, content)
        .await?;
    print_sources(&submitted.sources);
    finish(&services, config, submitted).await
}

pub async fn run_add_urls(
    config: &Config,
    dossier: &str,
    owner: &str,
    email: &str,
    urls: &[String],
) -> Result<()> {
    let services = Services::from_config(config).await?;
    let actor = Actor {
        owner_id: owner.to_string(),
        email: email.to_string(),
    };
    let submitted = services
        .coordinator(config)
        .add_websites(&actor, dossier, urls)
        .await?;
    print_sources(&submitted.sources);
    finish(&services, config, submitted).await
}

pub async fn run_callback(
    config: &Config,
    dossier: &str,
    document_type: &str,
    status: &str,
) -> Result<()> {
    let services = Services::from_config(config).await?;
    let request = CallbackRequest {
        dossier_id: Some(dossier.to_string()),
        document_type: Some(document_type.to_string()),
        status: Some(status.to_string()),
    };
    let outcome = callback::handle(services.store.as_ref(), &request).await?;
    print_outcome(&outcome);
    Ok(())
}

pub async fn run_analysis(config: &Config, dossier: &str, start: bool) -> Result<()> {
    let services = Services::from_config(config).await?;
    if start {
        analysis::start(services.store.as_ref(), services.pipelines.as_ref(), dossier).await?;
        println!("Analysis started.");
        return Ok(());
    }
    let results = analysis::results(services.store.as_ref(), dossier).await?;
    if results.is_empty() {
        println!("Analysis still processing.");
        return Ok(());
    }
    for r in &results {
        match r.confidence_score {
            Some(score) => println!("## {} ({:.0}%)", r.checklist_topic, score * 100.0),
            None => println!("## {}", r.checklist_topic),
        }
        println!("{}", r.summary);
        println!();
    }
    Ok(())
}

pub async fn run_chat(config: &Config, dossier: &str, message: &str) -> Result<()> {
    let services = Services::from_config(config).await?;
    let reply = chat::send(
        services.store.as_ref(),
        services.pipelines.as_ref(),
        dossier,
        message,
    )
    .await?;
    println!("{}", reply);
    Ok(())
}

pub async fn run_outbox_list(config: &Config, state: Option<JobState>) -> Result<()> {
    let services = Services::from_config(config).await?;
    let jobs = services.store.list_jobs(state).await?;
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<9}  {:>8}  {:<20}  LAST ERROR",
        "JOB", "STATE", "ATTEMPTS", "NEXT ATTEMPT"
    );
    for j in &jobs {
        println!(
            "{:<36}  {:<9}  {:>8}  {:<20}  {}",
            j.id,
            j.state,
            j.attempts,
            format_ts(j.next_attempt_at),
            j.last_error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn run_outbox_retry(config: &Config, id: &str) -> Result<()> {
    let services = Services::from_config(config).await?;
    let job = outbox::retry(services.store.as_ref(), id).await?;
    println!("Job {} re-queued.", job.id);
    Ok(())
}

pub async fn run_outbox_drain(config: &Config) -> Result<()> {
    let services = Services::from_config(config).await?;
    let report = outbox::deliver_due(
        services.store.as_ref(),
        services.pipelines.as_ref(),
        &config.outbox,
    )
    .await?;
    println!(
        "Delivered: {}  Retrying: {}  Dead: {}",
        report.delivered, report.retried, report.dead
    );
    Ok(())
}

pub async fn run_sweep(config: &Config) -> Result<()> {
    if !config.lifecycle.sweeper_enabled() {
        println!("Sweeper disabled (lifecycle.processing_timeout_secs = 0).");
        return Ok(());
    }
    let services = Services::from_config(config).await?;
    let failed = sweep::sweep_stale(
        services.store.as_ref(),
        config.lifecycle.processing_timeout_secs,
    )
    .await?;
    println!("Timed out {} source(s).", failed.len());
    for s in &failed {
        println!("  {}  {}", s.id, s.title);
    }
    Ok(())
}
