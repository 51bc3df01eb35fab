//! HTTP API for the dossier dashboard and the processing pipelines.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Health check (returns version) |
//! | `POST` | `/dossiers` | Create a dossier |
//! | `GET` | `/dossiers?owner=` | List dossiers, newest first |
//! | `GET` | `/dossiers/{id}` | Dossier with sources and readiness |
//! | `DELETE` | `/dossiers/{id}` | Delete a dossier and its sources |
//! | `GET` | `/dossiers/{id}/sources` | List sources |
//! | `POST` | `/dossiers/{id}/sources/text` | Add pasted text |
//! | `POST` | `/dossiers/{id}/sources/websites` | Add links |
//! | `GET` | `/dossiers/{id}/analysis` | Analysis results |
//! | `POST` | `/dossiers/{id}/analysis/start` | Start the analysis pipeline |
//! | `POST` | `/analysis-results` | Record an analysis result |
//! | `POST` | `/upload-url` | Issue a presigned upload target |
//! | `POST` | `/callbacks/document-status` | Pipeline status callback |
//! | `POST` | `/chat` | Forward a chat message |
//! | `GET` | `/outbox?state=` | Inspect outbound jobs |
//! | `POST` | `/outbox/{id}/retry` | Re-queue an outbound job |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "status is required" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `conflict` (409), `upstream_error` (502), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the browser dashboard
//! can call the API directly.

use axum::{
    extract::{FromRequest, Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use dossier_core::error::LifecycleError;
use dossier_core::models::{
    AnalysisResult, CallbackOutcome, Dossier, JobState, NewAnalysisResult, OutboxJob, Source,
};

use crate::analysis;
use crate::callback::{self, CallbackRequest};
use crate::chat;
use crate::config::Config;
use crate::dossiers::{self, DossierDetail};
use crate::outbox;
use crate::pipeline::UpstreamError;
use crate::services::Services;
use crate::storage::WriteTarget;
use crate::sweep;
use crate::upload::{Actor, UploadCoordinator};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    services: Services,
    coordinator: UploadCoordinator,
    api_token: Option<Arc<str>>,
    callback_token: Option<Arc<str>>,
}

/// Start the server with backends built from `config`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = Services::from_config(config).await?;
    run_server_with(config, services).await
}

/// Start the server with caller-supplied backends.
///
/// Also spawns the outbox worker and, when enabled, the stale-source
/// sweeper. Runs until Ctrl-C.
pub async fn run_server_with(config: &Config, services: Services) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();

    let worker = tokio::spawn(outbox::run_worker(
        services.store.clone(),
        services.pipelines.clone(),
        config.outbox.clone(),
    ));
    let sweeper = tokio::spawn(sweep::run_sweeper(
        services.store.clone(),
        config.lifecycle.clone(),
    ));

    let app = router(config, services);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "dossier server listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await;

    worker.abort();
    sweeper.abort();
    served?;
    Ok(())
}

/// Build the router. Exposed for embedding the API in another server.
pub fn router(config: &Config, services: Services) -> Router {
    let state = AppState {
        coordinator: services.coordinator(config),
        services,
        api_token: Config::secret(config.server.api_token_env.as_deref()).map(Arc::from),
        callback_token: Config::secret(config.server.callback_token_env.as_deref())
            .map(Arc::from),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/dossiers", post(handle_create_dossier).get(handle_list_dossiers))
        .route(
            "/dossiers/{id}",
            get(handle_get_dossier).delete(handle_delete_dossier),
        )
        .route("/dossiers/{id}/sources", get(handle_list_sources))
        .route("/dossiers/{id}/sources/text", post(handle_add_text))
        .route("/dossiers/{id}/sources/websites", post(handle_add_websites))
        .route("/dossiers/{id}/analysis", get(handle_analysis_results))
        .route("/dossiers/{id}/analysis/start", post(handle_start_analysis))
        .route("/analysis-results", post(handle_record_result))
        .route("/upload-url", post(handle_upload_url))
        .route("/callbacks/document-status", post(handle_callback))
        .route("/chat", post(handle_chat))
        .route("/outbox", get(handle_list_jobs))
        .route("/outbox/{id}/retry", post(handle_retry_job))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        let message = err.to_string();
        match err {
            LifecycleError::Validation(_) => {
                AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
            }
            LifecycleError::NotFound { .. } => {
                AppError::new(StatusCode::NOT_FOUND, "not_found", message)
            }
            LifecycleError::DuplicateDocumentType { .. }
            | LifecycleError::InvalidTransition { .. } => {
                AppError::new(StatusCode::CONFLICT, "conflict", message)
            }
        }
    }
}

/// Map service errors onto the error contract by their concrete type.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let err = match err.downcast::<LifecycleError>() {
            Ok(lifecycle) => return lifecycle.into(),
            Err(err) => err,
        };
        if let Some(upstream) = err.downcast_ref::<UpstreamError>() {
            return AppError::new(StatusCode::BAD_GATEWAY, "upstream_error", upstream.to_string());
        }
        error!(error = %err, "request failed");
        AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
    }
}

/// JSON request body whose rejections (bad syntax, wrong field types,
/// missing content type) answer with the error contract as `400`.
struct JsonBody<T>(T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(JsonBody(value)),
            Err(rejection) => Err(AppError::new(
                StatusCode::BAD_REQUEST,
                "bad_request",
                rejection.body_text(),
            )),
        }
    }
}

fn check_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), AppError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected) {
        Ok(())
    } else {
        Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid bearer token",
        ))
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Dossiers ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDossierRequest {
    #[serde(default)]
    owner_id: String,
    #[serde(default)]
    title: Option<String>,
}

async fn handle_create_dossier(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<CreateDossierRequest>,
) -> Result<(StatusCode, Json<Dossier>), AppError> {
    let dossier = dossiers::create(
        state.services.store.as_ref(),
        &req.owner_id,
        req.title.as_deref(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(dossier)))
}

#[derive(Deserialize)]
struct ListDossiersQuery {
    owner: Option<String>,
}

#[derive(Serialize)]
struct DossierList {
    dossiers: Vec<Dossier>,
}

async fn handle_list_dossiers(
    State(state): State<AppState>,
    Query(query): Query<ListDossiersQuery>,
) -> Result<Json<DossierList>, AppError> {
    let dossiers = dossiers::list(state.services.store.as_ref(), query.owner.as_deref()).await?;
    Ok(Json(DossierList { dossiers }))
}

async fn handle_get_dossier(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DossierDetail>, AppError> {
    Ok(Json(dossiers::detail(state.services.store.as_ref(), &id).await?))
}

async fn handle_delete_dossier(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let removed = dossiers::delete(state.services.store.as_ref(), &id).await?;
    Ok(Json(serde_json::json!({
        "deleted": id,
        "sources": removed.len(),
    })))
}

// ============ Sources ============

#[derive(Serialize)]
struct SourceList {
    sources: Vec<Source>,
}

async fn handle_list_sources(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SourceList>, AppError> {
    let store = state.services.store.as_ref();
    dossiers::get(store, &id).await?;
    Ok(Json(SourceList {
        sources: store.list_sources(&id).await?,
    }))
}

#[derive(Deserialize)]
struct AddTextRequest {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

async fn handle_add_text(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<AddTextRequest>,
) -> Result<(StatusCode, Json<SourceList>), AppError> {
    let submitted = state
        .coordinator
        .add_text(&id, &req.title, &req.content)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SourceList {
            sources: submitted.sources,
        }),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddWebsitesRequest {
    #[serde(default)]
    owner_id: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    urls: Vec<String>,
}

async fn handle_add_websites(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<AddWebsitesRequest>,
) -> Result<(StatusCode, Json<SourceList>), AppError> {
    if req.owner_id.trim().is_empty() {
        return Err(LifecycleError::Validation("ownerId is required".into()).into());
    }
    let actor = Actor {
        owner_id: req.owner_id,
        email: req.email,
    };
    let submitted = state
        .coordinator
        .add_websites(&actor, &id, &req.urls)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SourceList {
            sources: submitted.sources,
        }),
    ))
}

// ============ Analysis ============

#[derive(Serialize)]
struct AnalysisResults {
    results: Vec<AnalysisResult>,
}

async fn handle_analysis_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AnalysisResults>, AppError> {
    let results = analysis::results(state.services.store.as_ref(), &id).await?;
    Ok(Json(AnalysisResults { results }))
}

async fn handle_start_analysis(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    analysis::start(
        state.services.store.as_ref(),
        state.services.pipelines.as_ref(),
        &id,
    )
    .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "started": true })),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordResultRequest {
    #[serde(default, alias = "notebookId")]
    dossier_id: String,
    #[serde(default)]
    checklist_topic: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    confidence_score: Option<f64>,
}

async fn handle_record_result(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(req): JsonBody<RecordResultRequest>,
) -> Result<(StatusCode, Json<AnalysisResult>), AppError> {
    check_bearer(&headers, state.callback_token.as_deref())?;
    if req.dossier_id.trim().is_empty() {
        return Err(LifecycleError::Validation("dossierId is required".into()).into());
    }
    let result = analysis::record(
        state.services.store.as_ref(),
        &NewAnalysisResult {
            dossier_id: req.dossier_id,
            checklist_topic: req.checklist_topic,
            summary: req.summary,
            confidence_score: req.confidence_score,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(result)))
}

// ============ POST /upload-url ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadUrlRequest {
    #[serde(default)]
    owner_id: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    content_type: String,
}

async fn handle_upload_url(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(req): JsonBody<UploadUrlRequest>,
) -> Result<Json<WriteTarget>, AppError> {
    check_bearer(&headers, state.api_token.as_deref())?;
    for (name, value) in [
        ("ownerId", &req.owner_id),
        ("filename", &req.filename),
        ("contentType", &req.content_type),
    ] {
        if value.trim().is_empty() {
            return Err(LifecycleError::Validation(format!("{} is required", name)).into());
        }
    }
    let storage = state
        .services
        .storage
        .as_ref()
        .ok_or_else(|| UpstreamError::new("storage", "object storage is not configured"))
        .map_err(anyhow::Error::from)?;
    let target = storage
        .request_write_target(&req.owner_id, &req.filename, &req.content_type)
        .await?;
    Ok(Json(target))
}

// ============ POST /callbacks/document-status ============

#[derive(Serialize)]
struct CallbackResponse {
    message: &'static str,
    #[serde(flatten)]
    outcome: CallbackOutcome,
}

async fn handle_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(req): JsonBody<CallbackRequest>,
) -> Result<Json<CallbackResponse>, AppError> {
    check_bearer(&headers, state.callback_token.as_deref())?;
    let outcome = callback::handle(state.services.store.as_ref(), &req).await?;
    Ok(Json(CallbackResponse {
        message: "document and dossier status updated",
        outcome,
    }))
}

// ============ POST /chat ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    #[serde(default, alias = "notebookId")]
    dossier_id: String,
    #[serde(default)]
    message: String,
}

async fn handle_chat(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<ChatRequest>,
) -> Result<String, AppError> {
    Ok(chat::send(
        state.services.store.as_ref(),
        state.services.pipelines.as_ref(),
        &req.dossier_id,
        &req.message,
    )
    .await?)
}

// ============ Outbox ============

#[derive(Deserialize)]
struct ListJobsQuery {
    state: Option<String>,
}

#[derive(Serialize)]
struct JobList {
    jobs: Vec<OutboxJob>,
}

async fn handle_list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobList>, AppError> {
    let filter = query
        .state
        .as_deref()
        .map(str::parse::<JobState>)
        .transpose()?;
    let jobs = state.services.store.list_jobs(filter).await?;
    Ok(Json(JobList { jobs }))
}

async fn handle_retry_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OutboxJob>, AppError> {
    Ok(Json(outbox::retry(state.services.store.as_ref(), &id).await?))
}
