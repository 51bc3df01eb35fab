//! Outbound calls to the external processing pipelines.
//!
//! Four webhooks are reached over plain JSON POSTs:
//!
//! | Pipeline | Body | Reply |
//! |----------|------|-------|
//! | notifier | [`DocumentNotification`] | ignored |
//! | generation | [`GenerationRequest`] | `{output: {...}}` |
//! | chat | `{notebook_id, message}` | plain text |
//! | analysis | `{notebook_id}` | ignored |
//!
//! [`Pipelines`] is the seam; [`HttpPipelines`] is the reqwest client used
//! in production. Any failure is an [`UpstreamError`].

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use dossier_core::models::{
    DocumentType, GeneratedContent, SourceType, DEFAULT_COLOR, DEFAULT_ICON,
};

use crate::config::{Config, PipelinesConfig};

/// A pipeline or storage call that failed or was not possible.
#[derive(Debug, thiserror::Error)]
#[error("{service} upstream error: {message}")]
pub struct UpstreamError {
    pub service: &'static str,
    pub message: String,
}

impl UpstreamError {
    pub fn new(service: &'static str, message: impl Into<String>) -> Self {
        Self {
            service,
            message: message.into(),
        }
    }
}

/// Body posted to the document notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentNotification {
    /// Acting user.
    #[serde(rename = "id_conversa")]
    pub actor_id: String,
    #[serde(rename = "correlation_id")]
    pub dossier_id: String,
    #[serde(rename = "whatsapp")]
    pub email: String,
    #[serde(rename = "tipo_documento")]
    pub document_type: Option<DocumentType>,
    #[serde(rename = "url_documento")]
    pub document_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    #[serde(rename = "sourceType")]
    pub source_type: SourceType,
    #[serde(rename = "filePath")]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GenerationOutput {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub notebook_icon: Option<String>,
    #[serde(default)]
    pub background_color: Option<String>,
    #[serde(default)]
    pub example_questions: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct GenerationReply {
    output: Option<GenerationOutput>,
}

impl GenerationOutput {
    /// Fill defaults for missing fields. A reply without a title is unusable.
    pub fn into_content(self) -> Result<GeneratedContent, UpstreamError> {
        let title = self
            .title
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| UpstreamError::new("generation", "reply has no output.title"))?;
        Ok(GeneratedContent {
            title,
            description: self.summary.filter(|s| !s.is_empty()),
            icon: self
                .notebook_icon
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_ICON.to_string()),
            color: self
                .background_color
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_COLOR.to_string()),
            example_questions: self.example_questions.unwrap_or_default(),
        })
    }
}

#[async_trait]
pub trait Pipelines: Send + Sync {
    async fn notify_document(&self, notification: &DocumentNotification) -> Result<()>;

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput>;

    /// Forward a chat message and return the reply text.
    async fn chat(&self, dossier_id: &str, message: &str) -> Result<String>;

    async fn start_analysis(&self, dossier_id: &str) -> Result<()>;
}

/// reqwest-backed [`Pipelines`].
pub struct HttpPipelines {
    client: reqwest::Client,
    config: PipelinesConfig,
    generation_auth: Option<String>,
}

impl HttpPipelines {
    pub fn new(config: &PipelinesConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
            generation_auth: Config::secret(Some(&config.generation_auth_env)),
        })
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        service: &'static str,
        url: Option<&String>,
        body: &B,
        authorization: Option<&str>,
    ) -> Result<reqwest::Response> {
        let url = url.ok_or_else(|| UpstreamError::new(service, "pipeline URL not configured"))?;

        let mut request = self.client.post(url).json(body);
        if let Some(auth) = authorization {
            request = request.header("Authorization", auth);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::new(service, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::new(
                service,
                format!(
                    "HTTP {}: {}",
                    status,
                    body_text.chars().take(500).collect::<String>()
                ),
            )
            .into());
        }
        Ok(response)
    }
}

#[async_trait]
impl Pipelines for HttpPipelines {
    async fn notify_document(&self, notification: &DocumentNotification) -> Result<()> {
        self.post("notifier", self.config.notifier_url.as_ref(), notification, None)
            .await?;
        Ok(())
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        let response = self
            .post(
                "generation",
                self.config.generation_url.as_ref(),
                request,
                self.generation_auth.as_deref(),
            )
            .await?;
        let reply: GenerationReply = response
            .json()
            .await
            .map_err(|e| UpstreamError::new("generation", format!("invalid reply: {}", e)))?;
        reply
            .output
            .ok_or_else(|| UpstreamError::new("generation", "reply has no output").into())
    }

    async fn chat(&self, dossier_id: &str, message: &str) -> Result<String> {
        let body = serde_json::json!({
            "notebook_id": dossier_id,
            "message": message,
        });
        let response = self
            .post("chat", self.config.chat_url.as_ref(), &body, None)
            .await?;
        Ok(response
            .text()
            .await
            .map_err(|e| UpstreamError::new("chat", e.to_string()))?)
    }

    async fn start_analysis(&self, dossier_id: &str) -> Result<()> {
        let body = serde_json::json!({ "notebook_id": dossier_id });
        self.post("analysis", self.config.analysis_url.as_ref(), &body, None)
            .await?;
        Ok(())
    }
}
