//! Inbound status reports from the processing pipelines.
//!
//! A report names a dossier, a document type and a status. Every live
//! source of that type moves to the reported status, finished ones are left
//! alone, and the dossier's generation status mirrors the report.

use anyhow::Result;
use serde::Deserialize;
use tracing::info;

use dossier_core::error::LifecycleError;
use dossier_core::models::{CallbackOutcome, CallbackStatus, DocumentType};
use dossier_core::store::Store;

/// Raw callback body. Fields are optional so missing ones can be reported
/// as validation errors instead of parse failures.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRequest {
    #[serde(default, alias = "notebookId")]
    pub dossier_id: Option<String>,
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// A callback that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub dossier_id: String,
    pub document_type: DocumentType,
    pub status: CallbackStatus,
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, LifecycleError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| LifecycleError::Validation(format!("{} is required", name)))
}

impl CallbackRequest {
    pub fn validate(&self) -> Result<StatusReport, LifecycleError> {
        let dossier_id = required(&self.dossier_id, "dossierId")?;
        let document_type = required(&self.document_type, "documentType")?.parse()?;
        let status = required(&self.status, "status")?.parse()?;
        Ok(StatusReport {
            dossier_id: dossier_id.to_string(),
            document_type,
            status,
        })
    }
}

/// Validate and apply a status callback in one store transaction.
pub async fn handle(store: &dyn Store, request: &CallbackRequest) -> Result<CallbackOutcome> {
    let report = request.validate()?;
    let outcome = store
        .apply_callback(&report.dossier_id, report.document_type, report.status)
        .await?;
    info!(
        dossier_id = %report.dossier_id,
        document_type = %report.document_type,
        status = %report.status,
        updated = outcome.updated.len(),
        unchanged = outcome.unchanged.len(),
        skipped = outcome.skipped.len(),
        "status callback applied"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(d: Option<&str>, t: Option<&str>, s: Option<&str>) -> CallbackRequest {
        CallbackRequest {
            dossier_id: d.map(Into::into),
            document_type: t.map(Into::into),
            status: s.map(Into::into),
        }
    }

    #[test]
    fn test_valid_report() {
        let r = req(Some("d1"), Some("edital"), Some("completed"))
            .validate()
            .unwrap();
        assert_eq!(r.document_type, DocumentType::Edital);
        assert_eq!(r.status, CallbackStatus::Completed);
    }

    #[test]
    fn test_missing_and_blank_fields() {
        for r in [
            req(None, Some("edital"), Some("completed")),
            req(Some("d1"), Some(" "), Some("completed")),
            req(Some("d1"), Some("edital"), None),
        ] {
            assert!(matches!(r.validate(), Err(LifecycleError::Validation(_))));
        }
    }

    #[test]
    fn test_unknown_status_rejected() {
        let err = req(Some("d1"), Some("edital"), Some("pending"))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("pending"));
    }

    #[test]
    fn test_accepts_notebook_id_alias() {
        let r: CallbackRequest = serde_json::from_str(
            r#"{"notebookId": "d1", "documentType": "processo", "status": "failed"}"#,
        )
        .unwrap();
        assert_eq!(r.validate().unwrap().dossier_id, "d1");
    }
}
