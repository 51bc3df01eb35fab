//! Source and generation lifecycle rules.
//!
//! ```text
//! pending ──▶ uploading ──▶ processing ──▶ completed
//!    │            │              │
//!    └────────────┴──────────────┴───────▶ failed
//! ```
//!
//! Sources only move forward. `completed` and `failed` are terminal: no
//! transition leaves them. Non-file sources (pasted text, links) may skip
//! `uploading` and go straight to `processing`.
//!
//! Dossier generation follows `pending → generating → {completed|failed}`
//! when driven by the generation trigger. Status callbacks may revisit the
//! generation status of a dossier at any time.

use crate::error::LifecycleError;
use crate::models::{CallbackStatus, GenerationStatus, SourceStatus, SourceType};

impl SourceStatus {
    fn rank(&self) -> u8 {
        match self {
            SourceStatus::Pending => 0,
            SourceStatus::Uploading => 1,
            SourceStatus::Processing => 2,
            SourceStatus::Completed | SourceStatus::Failed => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SourceStatus::Completed | SourceStatus::Failed)
    }

    /// Whether a source in this status may move to `next`.
    ///
    /// Writing the current status again is not a transition and returns
    /// `false`; callers treat it as a no-op.
    pub fn can_transition_to(&self, next: SourceStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Validate a requested status change.
    ///
    /// Returns `Ok(true)` when the status changes, `Ok(false)` for a
    /// same-status no-op, and an error for anything else.
    pub fn check_transition(&self, next: SourceStatus) -> Result<bool, LifecycleError> {
        if *self == next {
            Ok(false)
        } else if self.can_transition_to(next) {
            Ok(true)
        } else {
            Err(LifecycleError::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl SourceType {
    /// Types whose first arrival fires dossier generation.
    pub fn is_processable(&self) -> bool {
        !matches!(self, SourceType::Youtube)
    }

    /// Classify an uploaded file by its MIME type.
    pub fn from_mime(mime: &str) -> SourceType {
        if mime.contains("pdf") {
            SourceType::Pdf
        } else if mime.contains("audio") {
            SourceType::Audio
        } else {
            SourceType::Text
        }
    }
}

impl CallbackStatus {
    pub fn source_status(&self) -> SourceStatus {
        match self {
            CallbackStatus::Processing => SourceStatus::Processing,
            CallbackStatus::Completed => SourceStatus::Completed,
            CallbackStatus::Failed => SourceStatus::Failed,
        }
    }

    pub fn generation_status(&self) -> GenerationStatus {
        match self {
            CallbackStatus::Processing => GenerationStatus::Generating,
            CallbackStatus::Completed => GenerationStatus::Completed,
            CallbackStatus::Failed => GenerationStatus::Failed,
        }
    }
}

/// How a callback applies to one source currently in `current`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackEffect {
    Update,
    Unchanged,
    Skip,
}

pub fn callback_effect(current: SourceStatus, reported: CallbackStatus) -> CallbackEffect {
    let target = reported.source_status();
    if current == target {
        CallbackEffect::Unchanged
    } else if current.can_transition_to(target) {
        CallbackEffect::Update
    } else {
        CallbackEffect::Skip
    }
}
