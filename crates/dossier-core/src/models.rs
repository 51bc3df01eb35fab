//! Core data models used throughout Dossier Intake.
//!
//! A [`Dossier`] owns many [`Source`]s. Sources move through the processing
//! lifecycle described in [`crate::lifecycle`]; dossiers carry the one-time
//! generated metadata and the denormalized upload/processed counters.
//!
//! Timestamps are Unix epoch seconds, matching the SQLite schema.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LifecycleError;

pub const DEFAULT_ICON: &str = "📝";
pub const DEFAULT_COLOR: &str = "bg-gray-100";

/// Generation status of a dossier's auto-produced metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Pending,
    Generating,
    Completed,
    Failed,
}

/// Processing status of a single source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Pending,
    Uploading,
    Processing,
    Completed,
    Failed,
}

/// Kind of content a source carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Pdf,
    Text,
    Website,
    Youtube,
    Audio,
}

/// Legal role of a document inside an auction dossier.
///
/// `processo` is the judicial process, `edital` the auction notice and
/// `matricula` the property registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Processo,
    Edital,
    Matricula,
}

/// Status reported by a pipeline through the status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    Processing,
    Completed,
    Failed,
}

/// Delivery state of an outbound job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Delivered,
    Dead,
}

/// What an outbound job delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    DocumentNotification,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Generating => "generating",
            GenerationStatus::Completed => "completed",
            GenerationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationStatus {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(GenerationStatus::Pending),
            "generating" => Ok(GenerationStatus::Generating),
            "completed" => Ok(GenerationStatus::Completed),
            "failed" => Ok(GenerationStatus::Failed),
            other => Err(LifecycleError::Validation(format!("unknown generation status: '{}'", other))),
        }
    }
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Pending => "pending",
            SourceStatus::Uploading => "uploading",
            SourceStatus::Processing => "processing",
            SourceStatus::Completed => "completed",
            SourceStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceStatus {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SourceStatus::Pending),
            "uploading" => Ok(SourceStatus::Uploading),
            "processing" => Ok(SourceStatus::Processing),
            "completed" => Ok(SourceStatus::Completed),
            "failed" => Ok(SourceStatus::Failed),
            other => Err(LifecycleError::Validation(format!("unknown processing status: '{}'", other))),
        }
    }
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Pdf => "pdf",
            SourceType::Text => "text",
            SourceType::Website => "website",
            SourceType::Youtube => "youtube",
            SourceType::Audio => "audio",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pdf" => Ok(SourceType::Pdf),
            "text" => Ok(SourceType::Text),
            "website" => Ok(SourceType::Website),
            "youtube" => Ok(SourceType::Youtube),
            "audio" => Ok(SourceType::Audio),
            other => Err(LifecycleError::Validation(format!("unknown source type: '{}'", other))),
        }
    }
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Processo => "processo",
            DocumentType::Edital => "edital",
            DocumentType::Matricula => "matricula",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processo" => Ok(DocumentType::Processo),
            "edital" => Ok(DocumentType::Edital),
            "matricula" => Ok(DocumentType::Matricula),
            other => Err(LifecycleError::Validation(format!("unknown document type: '{}'", other))),
        }
    }
}

impl CallbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackStatus::Processing => "processing",
            CallbackStatus::Completed => "completed",
            CallbackStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CallbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallbackStatus {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(CallbackStatus::Processing),
            "completed" => Ok(CallbackStatus::Completed),
            "failed" => Ok(CallbackStatus::Failed),
            other => Err(LifecycleError::Validation(format!("unknown callback status: '{}'", other))),
        }
    }
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Delivered => "delivered",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "delivered" => Ok(JobState::Delivered),
            "dead" => Ok(JobState::Dead),
            other => Err(LifecycleError::Validation(format!("unknown job state: '{}'", other))),
        }
    }
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::DocumentNotification => "document_notification",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document_notification" => Ok(JobKind::DocumentNotification),
            other => Err(LifecycleError::Validation(format!("unknown job kind: '{}'", other))),
        }
    }
}

/// A user-facing case file grouping sources and their analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dossier {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub description: Option<String>,
    pub generation_status: GenerationStatus,
    pub icon: String,
    pub color: String,
    pub example_questions: Vec<String>,
    pub sources_uploaded: i64,
    pub sources_processed: i64,
    /// Source that claimed the dossier's one-time generation slot.
    pub first_source_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for creating a dossier.
#[derive(Debug, Clone)]
pub struct NewDossier {
    pub owner_id: String,
    pub title: Option<String>,
}

/// One ingested document or link within a dossier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub id: String,
    pub dossier_id: String,
    pub title: String,
    pub source_type: SourceType,
    pub document_type: Option<DocumentType>,
    pub processing_status: SourceStatus,
    pub file_path: Option<String>,
    pub content: Option<String>,
    pub url: Option<String>,
    pub metadata: serde_json::Value,
    pub file_size: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for creating a source. New sources always start `pending`.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub dossier_id: String,
    pub title: String,
    pub source_type: SourceType,
    pub document_type: Option<DocumentType>,
    pub content: Option<String>,
    pub url: Option<String>,
    pub metadata: serde_json::Value,
    pub file_size: Option<i64>,
}

impl NewSource {
    pub fn new(dossier_id: impl Into<String>, title: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            dossier_id: dossier_id.into(),
            title: title.into(),
            source_type,
            document_type: None,
            content: None,
            url: None,
            metadata: serde_json::json!({}),
            file_size: None,
        }
    }
}

/// Result of [`Store::create_source`](crate::store::Store::create_source).
#[derive(Debug, Clone)]
pub struct SourceCreated {
    pub source: Source,
    /// True when this source claimed the dossier's first-source slot and
    /// must fire the generation trigger.
    pub claimed_first: bool,
}

/// Partial update applied to a source. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct SourceUpdate {
    pub title: Option<String>,
    pub processing_status: Option<SourceStatus>,
    pub file_path: Option<String>,
    pub content: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl SourceUpdate {
    pub fn status(status: SourceStatus) -> Self {
        Self {
            processing_status: Some(status),
            ..Default::default()
        }
    }
}

/// Metadata produced by the generation pipeline, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedContent {
    pub title: String,
    pub description: Option<String>,
    pub icon: String,
    pub color: String,
    pub example_questions: Vec<String>,
}

/// Effect of one status callback on a dossier's sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallbackOutcome {
    /// Sources whose status changed.
    pub updated: Vec<String>,
    /// Sources that already had the reported status.
    pub unchanged: Vec<String>,
    /// Sources left alone because they were terminal.
    pub skipped: Vec<String>,
}

/// One analysis finding for a dossier, joined with its checklist topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub id: String,
    pub checklist_topic: String,
    pub summary: String,
    pub confidence_score: Option<f64>,
    #[serde(skip)]
    pub created_at: i64,
}

/// Input for recording an analysis result.
#[derive(Debug, Clone)]
pub struct NewAnalysisResult {
    pub dossier_id: String,
    pub checklist_topic: String,
    pub summary: String,
    pub confidence_score: Option<f64>,
}

/// A persisted outbound delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxJob {
    pub id: String,
    pub kind: JobKind,
    pub dossier_id: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub attempts: i64,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Current time as Unix epoch seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Generate a fresh identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
