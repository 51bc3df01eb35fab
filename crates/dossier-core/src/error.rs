//! Lifecycle error types.
//!
//! Store implementations return `anyhow::Result` and wrap these variants so
//! callers (notably the HTTP layer) can downcast and pick a status code.

use thiserror::Error;

use crate::models::{DocumentType, SourceStatus};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// Requested dossier, source or job does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A source status change that the lifecycle does not allow.
    #[error("invalid source transition: {from} -> {to}")]
    InvalidTransition { from: SourceStatus, to: SourceStatus },

    /// The dossier already holds a source of this document type.
    #[error("dossier {dossier_id} already has a {document_type} document")]
    DuplicateDocumentType {
        dossier_id: String,
        document_type: DocumentType,
    },

    /// Missing or malformed input.
    #[error("invalid input: {0}")]
    Validation(String),
}

impl LifecycleError {
    pub fn dossier_not_found(id: impl Into<String>) -> Self {
        LifecycleError::NotFound {
            kind: "dossier",
            id: id.into(),
        }
    }

    pub fn source_not_found(id: impl Into<String>) -> Self {
        LifecycleError::NotFound {
            kind: "source",
            id: id.into(),
        }
    }

    pub fn job_not_found(id: impl Into<String>) -> Self {
        LifecycleError::NotFound {
            kind: "outbox job",
            id: id.into(),
        }
    }
}
