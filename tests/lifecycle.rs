//! End-to-end lifecycle tests against the SQLite store, with in-process
//! fakes for object storage and the processing pipelines.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use dossier_core::error::LifecycleError;
use dossier_core::models::{
    CallbackStatus, DocumentType, GenerationStatus, JobState, SourceStatus, DEFAULT_ICON,
};
use dossier_core::store::Store;
use dossier_intake::callback::{self, CallbackRequest};
use dossier_intake::config::{self, Config, OutboxConfig};
use dossier_intake::pipeline::{
    DocumentNotification, GenerationOutput, GenerationRequest, Pipelines, UpstreamError,
};
use dossier_intake::sqlite_store::SqliteStore;
use dossier_intake::storage::{object_key, ObjectStorage, WriteTarget};
use dossier_intake::upload::{Actor, FileUpload, UploadCoordinator};
use dossier_intake::{analysis, db, dossiers, migrate, outbox, sweep};

// ============ Fakes ============

#[derive(Default)]
struct FakePipelines {
    fail_generation: bool,
    untitled_generation: bool,
    fail_notifications: bool,
    generation_calls: AtomicUsize,
    generation_requests: Mutex<Vec<GenerationRequest>>,
    notifications: Mutex<Vec<DocumentNotification>>,
}

#[async_trait]
impl Pipelines for FakePipelines {
    async fn notify_document(&self, notification: &DocumentNotification) -> Result<()> {
        if self.fail_notifications {
            return Err(UpstreamError::new("notifier", "HTTP 503").into());
        }
        self.notifications.lock().unwrap().push(notification.clone());
        Ok(())
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        self.generation_calls.fetch_add(1, Ordering::SeqCst);
        self.generation_requests.lock().unwrap().push(request.clone());
        if self.fail_generation {
            return Err(UpstreamError::new("generation", "HTTP 500: boom").into());
        }
        let title = if self.untitled_generation {
            None
        } else {
            Some("Leilão Rua das Flores 120".to_string())
        };
        Ok(GenerationOutput {
            title,
            summary: Some("Apartamento em leilão judicial".into()),
            notebook_icon: Some("🏠".into()),
            background_color: None,
            example_questions: Some(vec!["Qual o valor do lance mínimo?".into()]),
        })
    }

    async fn chat(&self, _dossier_id: &str, message: &str) -> Result<String> {
        Ok(format!("echo: {}", message))
    }

    async fn start_analysis(&self, _dossier_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Storage that keeps objects in memory and refuses files named `broken*`.
#[derive(Default)]
struct FakeStorage {
    targets_issued: AtomicUsize,
    objects: Mutex<Vec<String>>,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn request_write_target(
        &self,
        owner_id: &str,
        filename: &str,
        _content_type: &str,
    ) -> Result<WriteTarget> {
        self.targets_issued.fetch_add(1, Ordering::SeqCst);
        let key = object_key(owner_id, filename);
        Ok(WriteTarget {
            url: format!("https://bucket.test/{}?X-Amz-Signature=x", key),
            file_url: format!("https://files.test/{}", key),
        })
    }

    async fn put_object(&self, target: &WriteTarget, _ct: &str, _body: Vec<u8>) -> Result<()> {
        if target.file_url.contains("-broken") {
            anyhow::bail!("PUT returned HTTP 403");
        }
        self.objects.lock().unwrap().push(target.file_url.clone());
        Ok(())
    }
}

// ============ Setup ============

struct Harness {
    _tmp: TempDir,
    config: Config,
    sqlite: SqliteStore,
    store: Arc<dyn Store>,
    pipelines: Arc<FakePipelines>,
    storage: Arc<FakeStorage>,
}

impl Harness {
    async fn new(pipelines: FakePipelines) -> Self {
        let tmp = TempDir::new().unwrap();
        let config_path = tmp.path().join("dossier.toml");
        fs::write(
            &config_path,
            format!(
                r#"[db]
path = "{}/dossier.sqlite"

[server]
bind = "127.0.0.1:0"

[upload]
batch_stagger_ms = 10
max_concurrent = 2

[outbox]
max_attempts = 2
"#,
                tmp.path().display()
            ),
        )
        .unwrap();
        let config = config::load_config(&config_path).unwrap();
        let pool = db::connect(&config).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        let sqlite = SqliteStore::new(pool);
        Self {
            _tmp: tmp,
            store: Arc::new(sqlite.clone()),
            sqlite,
            config,
            pipelines: Arc::new(pipelines),
            storage: Arc::new(FakeStorage::default()),
        }
    }

    fn coordinator(&self) -> UploadCoordinator {
        UploadCoordinator::new(
            self.store.clone(),
            Some(self.storage.clone()),
            self.pipelines.clone(),
            self.config.upload.clone(),
        )
    }

    async fn dossier(&self) -> String {
        dossiers::create(self.store.as_ref(), "user-1", None)
            .await
            .unwrap()
            .id
    }

    fn generation_calls(&self) -> usize {
        self.pipelines.generation_calls.load(Ordering::SeqCst)
    }
}

fn actor() -> Actor {
    Actor {
        owner_id: "user-1".into(),
        email: "user-1@example.com".into(),
    }
}

fn pdf(name: &str, document_type: Option<DocumentType>) -> FileUpload {
    FileUpload {
        filename: name.to_string(),
        content_type: "application/pdf".into(),
        bytes: b"%PDF-1.4 test".to_vec(),
        document_type,
    }
}

fn report(dossier_id: &str, document_type: &str, status: &str) -> CallbackRequest {
    CallbackRequest {
        dossier_id: Some(dossier_id.to_string()),
        document_type: Some(document_type.to_string()),
        status: Some(status.to_string()),
    }
}

// ============ Uploads and generation ============

#[tokio::test]
async fn test_batch_upload_counts_every_file_and_generates_once() {
    let h = Harness::new(FakePipelines::default()).await;
    let dossier_id = h.dossier().await;

    let files = vec![
        pdf("edital.pdf", Some(DocumentType::Edital)),
        pdf("matricula.pdf", Some(DocumentType::Matricula)),
        FileUpload {
            filename: "audiencia.mp3".into(),
            content_type: "audio/mpeg".into(),
            bytes: vec![0u8; 64],
            document_type: None,
        },
    ];
    let submitted = h
        .coordinator()
        .upload_files(&actor(), &dossier_id, files)
        .await
        .unwrap();
    assert_eq!(submitted.sources.len(), 3);
    assert!(submitted
        .sources
        .iter()
        .all(|s| s.processing_status == SourceStatus::Pending));

    let batch = submitted.background.await.unwrap();
    assert_eq!(batch.succeeded, 3);
    assert_eq!(batch.failed, 0);

    let dossier = dossiers::get(h.store.as_ref(), &dossier_id).await.unwrap();
    assert_eq!(dossier.sources_uploaded, 3);
    assert_eq!(dossier.sources_processed, 0);
    assert_eq!(dossier.generation_status, GenerationStatus::Completed);
    assert_eq!(dossier.title, "Leilão Rua das Flores 120");
    assert_eq!(dossier.icon, "🏠");
    assert_eq!(dossier.example_questions.len(), 1);
    assert_eq!(h.generation_calls(), 1);

    // Generation ran for the source that claimed the slot
    let first = dossier.first_source_id.clone().unwrap();
    let sources = h.store.list_sources(&dossier_id).await.unwrap();
    assert!(sources.iter().any(|s| s.id == first));
    for s in &sources {
        assert_eq!(s.processing_status, SourceStatus::Processing);
        assert!(s.file_path.as_deref().unwrap().starts_with("https://files.test/user-1/"));
    }

    // One notification job per file
    let jobs = h.store.list_jobs(Some(JobState::Pending)).await.unwrap();
    assert_eq!(jobs.len(), 3);
}

#[tokio::test]
async fn test_concurrent_batches_fire_generation_exactly_once() {
    let h = Harness::new(FakePipelines::default()).await;
    let dossier_id = h.dossier().await;
    let coordinator = h.coordinator();

    let who = actor();
    let a = coordinator.upload_files(&who, &dossier_id, vec![pdf("a.pdf", None)]);
    let b = coordinator.upload_files(&who, &dossier_id, vec![pdf("b.pdf", None)]);
    let c = coordinator.add_text(&dossier_id, "Notas", "Lance mínimo de R$ 200.000");
    let (a, b, c) = tokio::join!(a, b, c);
    for submitted in [a.unwrap(), b.unwrap(), c.unwrap()] {
        submitted.background.await.unwrap();
    }

    let dossier = dossiers::get(h.store.as_ref(), &dossier_id).await.unwrap();
    assert_eq!(dossier.sources_uploaded, 3);
    assert_eq!(h.generation_calls(), 1);
    assert_eq!(dossier.generation_status, GenerationStatus::Completed);
}

#[tokio::test]
async fn test_second_upload_does_not_regenerate() {
    let h = Harness::new(FakePipelines::default()).await;
    let dossier_id = h.dossier().await;

    let first = h
        .coordinator()
        .upload_files(&actor(), &dossier_id, vec![pdf("a.pdf", None)])
        .await
        .unwrap();
    first.background.await.unwrap();
    let second = h
        .coordinator()
        .upload_files(&actor(), &dossier_id, vec![pdf("b.pdf", None)])
        .await
        .unwrap();
    second.background.await.unwrap();

    assert_eq!(h.generation_calls(), 1);
}

#[tokio::test]
async fn test_generation_failure_leaves_metadata_untouched() {
    let h = Harness::new(FakePipelines {
        fail_generation: true,
        ..Default::default()
    })
    .await;
    let dossier_id = h.dossier().await;

    let submitted = h
        .coordinator()
        .add_text(&dossier_id, "Notas", "Matrícula 12.345")
        .await
        .unwrap();
    submitted.background.await.unwrap();

    let dossier = dossiers::get(h.store.as_ref(), &dossier_id).await.unwrap();
    assert_eq!(dossier.generation_status, GenerationStatus::Failed);
    assert_eq!(dossier.title, "Untitled dossier");
    assert_eq!(dossier.description, None);
    assert_eq!(dossier.icon, DEFAULT_ICON);
    assert!(dossier.example_questions.is_empty());
}

#[tokio::test]
async fn test_generation_reply_without_title_fails() {
    let h = Harness::new(FakePipelines {
        untitled_generation: true,
        ..Default::default()
    })
    .await;
    let dossier_id = h.dossier().await;

    let submitted = h
        .coordinator()
        .add_text(&dossier_id, "Notas", "texto")
        .await
        .unwrap();
    submitted.background.await.unwrap();

    let dossier = dossiers::get(h.store.as_ref(), &dossier_id).await.unwrap();
    assert_eq!(dossier.generation_status, GenerationStatus::Failed);
    assert_eq!(dossier.title, "Untitled dossier");
}

#[tokio::test]
async fn test_text_source_skips_notifier() {
    let h = Harness::new(FakePipelines::default()).await;
    let dossier_id = h.dossier().await;

    let submitted = h
        .coordinator()
        .add_text(&dossier_id, "Notas", "texto colado")
        .await
        .unwrap();
    assert_eq!(submitted.sources[0].processing_status, SourceStatus::Processing);
    assert_eq!(submitted.sources[0].content.as_deref(), Some("texto colado"));
    submitted.background.await.unwrap();

    assert!(h.store.list_jobs(None).await.unwrap().is_empty());
    let request = h.pipelines.generation_requests.lock().unwrap()[0].clone();
    assert_eq!(request.file_path, None);
}

#[tokio::test]
async fn test_websites_are_titled_counted_and_notified() {
    let h = Harness::new(FakePipelines::default()).await;
    let dossier_id = h.dossier().await;

    let urls = vec![
        "https://leiloes.example.com/lote/1".to_string(),
        "https://tjsp.example.com/processo/2".to_string(),
    ];
    let submitted = h
        .coordinator()
        .add_websites(&actor(), &dossier_id, &urls)
        .await
        .unwrap();
    let titles: Vec<&str> = submitted.sources.iter().map(|s| s.title.as_str()).collect();
    assert_eq!(
        titles,
        vec![
            "Website 1: https://leiloes.example.com/lote/1",
            "Website 2: https://tjsp.example.com/processo/2",
        ]
    );
    submitted.background.await.unwrap();

    let dossier = dossiers::get(h.store.as_ref(), &dossier_id).await.unwrap();
    assert_eq!(dossier.sources_uploaded, 2);
    assert_eq!(h.store.list_jobs(Some(JobState::Pending)).await.unwrap().len(), 2);

    let request = h.pipelines.generation_requests.lock().unwrap()[0].clone();
    assert_eq!(request.file_path.as_deref(), Some(urls[0].as_str()));
}

#[tokio::test]
async fn test_website_batch_failing_midway_fails_every_source() {
    let h = Harness::new(FakePipelines::default()).await;
    let dossier_id = h.dossier().await;
    sqlx::query(
        "CREATE TRIGGER refuse_broken BEFORE UPDATE OF processing_status ON sources
         WHEN NEW.processing_status = 'processing' AND NEW.url LIKE '%broken%'
         BEGIN SELECT RAISE(ABORT, 'refused'); END",
    )
    .execute(h.sqlite.pool())
    .await
    .unwrap();

    let urls = vec![
        "https://leiloes.example.com/lote/1".to_string(),
        "https://broken.example.com/lote/2".to_string(),
    ];
    let result = h.coordinator().add_websites(&actor(), &dossier_id, &urls).await;
    assert!(result.is_err());

    let sources = h.store.list_sources(&dossier_id).await.unwrap();
    assert_eq!(sources.len(), 2);
    for s in &sources {
        assert_eq!(s.processing_status, SourceStatus::Failed);
        assert_eq!(s.metadata["failure_reason"], "batch aborted");
    }
    let dossier = dossiers::get(h.store.as_ref(), &dossier_id).await.unwrap();
    assert_eq!(dossier.sources_uploaded, 0);
    assert!(h.store.list_jobs(None).await.unwrap().is_empty());
    assert_eq!(h.generation_calls(), 0);
}

#[tokio::test]
async fn test_non_http_url_rejected_before_any_write() {
    let h = Harness::new(FakePipelines::default()).await;
    let dossier_id = h.dossier().await;

    let err = h
        .coordinator()
        .add_websites(&actor(), &dossier_id, &["ftp://x".to_string()])
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err.downcast_ref::<LifecycleError>(),
        Some(LifecycleError::Validation(_))
    ));
    assert!(h.store.list_sources(&dossier_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_transfer_marks_source_failed() {
    let h = Harness::new(FakePipelines::default()).await;
    let dossier_id = h.dossier().await;

    let submitted = h
        .coordinator()
        .upload_files(&actor(), &dossier_id, vec![pdf("broken.pdf", None)])
        .await
        .unwrap();
    let source_id = submitted.sources[0].id.clone();
    let batch = submitted.background.await.unwrap();
    assert_eq!(batch.failed, 1);

    let source = h.store.get_source(&source_id).await.unwrap().unwrap();
    assert_eq!(source.processing_status, SourceStatus::Failed);
    assert!(source.metadata["failure_reason"]
        .as_str()
        .unwrap()
        .contains("403"));

    // The slot was claimed by a source whose bytes never landed
    let dossier = dossiers::get(h.store.as_ref(), &dossier_id).await.unwrap();
    assert_eq!(dossier.sources_uploaded, 0);
    assert_eq!(dossier.generation_status, GenerationStatus::Pending);
    assert_eq!(h.generation_calls(), 0);
}

#[tokio::test]
async fn test_duplicate_document_type_rejected_without_side_effects() {
    let h = Harness::new(FakePipelines::default()).await;
    let dossier_id = h.dossier().await;

    let first = h
        .coordinator()
        .upload_files(
            &actor(),
            &dossier_id,
            vec![pdf("edital.pdf", Some(DocumentType::Edital))],
        )
        .await
        .unwrap();
    first.background.await.unwrap();
    let issued = h.storage.targets_issued.load(Ordering::SeqCst);

    let err = h
        .coordinator()
        .upload_files(
            &actor(),
            &dossier_id,
            vec![pdf("edital-v2.pdf", Some(DocumentType::Edital))],
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err.downcast_ref::<LifecycleError>(),
        Some(LifecycleError::DuplicateDocumentType { .. })
    ));
    assert_eq!(h.storage.targets_issued.load(Ordering::SeqCst), issued);
    assert_eq!(h.store.list_sources(&dossier_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_upload_into_unknown_dossier_is_not_found() {
    let h = Harness::new(FakePipelines::default()).await;
    let err = h
        .coordinator()
        .upload_files(&actor(), "missing", vec![pdf("a.pdf", None)])
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err.downcast_ref::<LifecycleError>(),
        Some(LifecycleError::NotFound { .. })
    ));
}

// ============ Status callbacks ============

#[tokio::test]
async fn test_callbacks_touch_only_the_reported_document_type() {
    let h = Harness::new(FakePipelines::default()).await;
    let dossier_id = h.dossier().await;

    let submitted = h
        .coordinator()
        .upload_files(
            &actor(),
            &dossier_id,
            vec![
                pdf("edital.pdf", Some(DocumentType::Edital)),
                pdf("processo.pdf", Some(DocumentType::Processo)),
            ],
        )
        .await
        .unwrap();
    submitted.background.await.unwrap();

    let by_type = |sources: &[dossier_core::models::Source], t: DocumentType| {
        sources
            .iter()
            .find(|s| s.document_type == Some(t))
            .unwrap()
            .clone()
    };

    let outcome = callback::handle(h.store.as_ref(), &report(&dossier_id, "edital", "completed"))
        .await
        .unwrap();
    assert_eq!(outcome.updated.len(), 1);

    let sources = h.store.list_sources(&dossier_id).await.unwrap();
    assert_eq!(
        by_type(&sources, DocumentType::Edital).processing_status,
        SourceStatus::Completed
    );
    assert_eq!(
        by_type(&sources, DocumentType::Processo).processing_status,
        SourceStatus::Processing
    );
    let dossier = dossiers::get(h.store.as_ref(), &dossier_id).await.unwrap();
    assert_eq!(dossier.sources_processed, 1);
    assert_eq!(dossier.generation_status, GenerationStatus::Completed);
    assert!(!dossiers::Readiness::of(&dossier).is_ready());

    callback::handle(h.store.as_ref(), &report(&dossier_id, "processo", "failed"))
        .await
        .unwrap();
    let dossier = dossiers::get(h.store.as_ref(), &dossier_id).await.unwrap();
    assert_eq!(dossier.generation_status, GenerationStatus::Failed);
    assert_eq!(dossier.sources_processed, 1);

    // A late report cannot reopen a finished source
    let outcome = callback::handle(h.store.as_ref(), &report(&dossier_id, "edital", "failed"))
        .await
        .unwrap();
    let edital = by_type(&sources, DocumentType::Edital);
    assert_eq!(outcome.skipped, vec![edital.id.clone()]);
    let edital = h.store.get_source(&edital.id).await.unwrap().unwrap();
    assert_eq!(edital.processing_status, SourceStatus::Completed);
}

#[tokio::test]
async fn test_callback_updates_every_source_of_the_reported_type() {
    let h = Harness::new(FakePipelines::default()).await;
    let dossier_id = h.dossier().await;
    let submitted = h
        .coordinator()
        .upload_files(
            &actor(),
            &dossier_id,
            vec![
                pdf("edital.pdf", Some(DocumentType::Edital)),
                pdf("processo.pdf", Some(DocumentType::Processo)),
            ],
        )
        .await
        .unwrap();
    submitted.background.await.unwrap();

    // Rows written before the per-type index existed can share a type
    sqlx::query("DROP INDEX idx_sources_dossier_document_type")
        .execute(h.sqlite.pool())
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO sources (id, dossier_id, title, source_type, document_type, \
         processing_status, metadata_json, created_at, updated_at) \
         SELECT 'edital-copy', dossier_id, title, source_type, document_type, \
         processing_status, metadata_json, created_at + 1, updated_at \
         FROM sources WHERE dossier_id = ? AND document_type = 'edital'",
    )
    .bind(&dossier_id)
    .execute(h.sqlite.pool())
    .await
    .unwrap();

    let outcome = h
        .store
        .apply_callback(&dossier_id, DocumentType::Edital, CallbackStatus::Completed)
        .await
        .unwrap();
    assert_eq!(outcome.updated.len(), 2);
    assert!(outcome.updated.contains(&"edital-copy".to_string()));

    let sources = h.store.list_sources(&dossier_id).await.unwrap();
    for s in &sources {
        let expected = match s.document_type {
            Some(DocumentType::Edital) => SourceStatus::Completed,
            _ => SourceStatus::Processing,
        };
        assert_eq!(s.processing_status, expected, "{}", s.title);
    }
    let dossier = dossiers::get(h.store.as_ref(), &dossier_id).await.unwrap();
    assert_eq!(dossier.sources_processed, 2);
}

#[tokio::test]
async fn test_text_source_keeps_dossier_from_becoming_ready() {
    let h = Harness::new(FakePipelines::default()).await;
    let dossier_id = h.dossier().await;
    let submitted = h
        .coordinator()
        .add_text(&dossier_id, "Notas", "texto colado")
        .await
        .unwrap();
    submitted.background.await.unwrap();

    for document_type in ["processo", "edital", "matricula"] {
        callback::handle(h.store.as_ref(), &report(&dossier_id, document_type, "completed"))
            .await
            .unwrap();
    }

    let dossier = dossiers::get(h.store.as_ref(), &dossier_id).await.unwrap();
    assert_eq!(
        dossiers::Readiness::of(&dossier),
        dossiers::Readiness::Processing {
            processed: 0,
            uploaded: 1
        }
    );
    let err = analysis::start(h.store.as_ref(), h.pipelines.as_ref(), &dossier_id)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not ready"));
}

#[tokio::test]
async fn test_repeated_completion_is_counted_once() {
    let h = Harness::new(FakePipelines::default()).await;
    let dossier_id = h.dossier().await;

    let submitted = h
        .coordinator()
        .upload_files(
            &actor(),
            &dossier_id,
            vec![pdf("matricula.pdf", Some(DocumentType::Matricula))],
        )
        .await
        .unwrap();
    submitted.background.await.unwrap();

    for _ in 0..3 {
        h.store
            .apply_callback(&dossier_id, DocumentType::Matricula, CallbackStatus::Completed)
            .await
            .unwrap();
    }
    let dossier = dossiers::get(h.store.as_ref(), &dossier_id).await.unwrap();
    assert_eq!(dossier.sources_processed, 1);
    assert!(dossiers::Readiness::of(&dossier).is_ready());
}

#[tokio::test]
async fn test_callback_for_unknown_dossier_is_not_found() {
    let h = Harness::new(FakePipelines::default()).await;
    let err = callback::handle(h.store.as_ref(), &report("nope", "edital", "completed"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LifecycleError>(),
        Some(LifecycleError::NotFound { .. })
    ));
}

// ============ Outbox ============

#[tokio::test]
async fn test_undeliverable_notification_is_dead_lettered_and_retryable() {
    let h = Harness::new(FakePipelines {
        fail_notifications: true,
        ..Default::default()
    })
    .await;
    let dossier_id = h.dossier().await;

    let submitted = h
        .coordinator()
        .upload_files(&actor(), &dossier_id, vec![pdf("a.pdf", None)])
        .await
        .unwrap();
    submitted.background.await.unwrap();

    let config = OutboxConfig {
        max_attempts: 2,
        poll_interval_secs: 1,
        batch_size: 10,
    };
    let first = outbox::deliver_due(h.store.as_ref(), h.pipelines.as_ref(), &config)
        .await
        .unwrap();
    assert_eq!(first.retried, 1);

    // Skip the backoff so the second attempt is due now
    sqlx::query("UPDATE outbox_jobs SET next_attempt_at = 0")
        .execute(h.sqlite.pool())
        .await
        .unwrap();
    let second = outbox::deliver_due(h.store.as_ref(), h.pipelines.as_ref(), &config)
        .await
        .unwrap();
    assert_eq!(second.dead, 1);

    let dead = h.store.list_jobs(Some(JobState::Dead)).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 2);
    assert!(dead[0].last_error.as_deref().unwrap().contains("503"));

    let job = outbox::retry(h.store.as_ref(), &dead[0].id).await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
}

// ============ Sweeper and deletion ============

#[tokio::test]
async fn test_sweeper_fails_stuck_sources_only() {
    let h = Harness::new(FakePipelines::default()).await;
    let dossier_id = h.dossier().await;

    let stuck = h
        .coordinator()
        .add_text(&dossier_id, "Antigo", "texto")
        .await
        .unwrap();
    stuck.background.await.unwrap();
    sqlx::query("UPDATE sources SET updated_at = updated_at - 7200")
        .execute(h.sqlite.pool())
        .await
        .unwrap();

    let fresh = h
        .coordinator()
        .add_text(&dossier_id, "Novo", "texto")
        .await
        .unwrap();
    fresh.background.await.unwrap();

    let failed = sweep::sweep_stale(h.store.as_ref(), 3600).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, stuck.sources[0].id);

    let source = h.store.get_source(&stuck.sources[0].id).await.unwrap().unwrap();
    assert_eq!(source.processing_status, SourceStatus::Failed);
    assert_eq!(source.metadata["failure_reason"], sweep::TIMEOUT_REASON);
    let other = h.store.get_source(&fresh.sources[0].id).await.unwrap().unwrap();
    assert_eq!(other.processing_status, SourceStatus::Processing);
}

#[tokio::test]
async fn test_delete_removes_sources_and_results() {
    let h = Harness::new(FakePipelines::default()).await;
    let dossier_id = h.dossier().await;

    let submitted = h
        .coordinator()
        .add_text(&dossier_id, "Notas", "texto")
        .await
        .unwrap();
    submitted.background.await.unwrap();
    dossier_intake::analysis::record(
        h.store.as_ref(),
        &dossier_core::models::NewAnalysisResult {
            dossier_id: dossier_id.clone(),
            checklist_topic: "Débitos de IPTU".into(),
            summary: "Sem débitos".into(),
            confidence_score: Some(0.9),
        },
    )
    .await
    .unwrap();

    let removed = dossiers::delete(h.store.as_ref(), &dossier_id).await.unwrap();
    assert_eq!(removed.len(), 1);
    assert!(h.store.get_source(&submitted.sources[0].id).await.unwrap().is_none());
    assert!(h.store.get_dossier(&dossier_id).await.unwrap().is_none());
    assert!(dossiers::delete(h.store.as_ref(), &dossier_id).await.is_err());
}
