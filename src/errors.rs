//! Typed error hierarchy for the Trilha pipeline.
//!
//! - `ValidationError`: a stage or request input was rejected before any write
//! - `PipelineError`: everything the engine can return to a caller
//!
//! The HTTP layer maps each `PipelineError` variant onto a status code; see
//! `server::api::ApiError`.

use serde::Serialize;
use thiserror::Error;
use trilha_common::{DomainError, StageKey};

/// A rejected input, optionally naming the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{message}")]
pub struct ValidationError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }

    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Case {id} not found")]
    CaseNotFound { id: String },

    #[error("Session {id} not found")]
    SessionNotFound { id: String },

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// A persisted status that no stage module is registered for.
    #[error("No stage module registered for status '{status}'")]
    RegistryMismatch { status: String },

    #[error("Stage '{status}' has no save action")]
    SaveUnavailable { status: StageKey },

    #[error("Case store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    /// The case write committed; a follow-up step did not.
    #[error("Case {case_id} was updated but a follow-up step failed: {source}")]
    SideEffectFailed {
        case_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// Whether persisted state changed before the error was raised.
    pub fn changed_state(&self) -> bool {
        matches!(self, Self::SideEffectFailed { .. })
    }

    /// Classify an error coming out of the database layer. Typed pipeline
    /// errors raised inside a DB closure survive the trip through `anyhow`;
    /// anything else means the store itself failed.
    pub fn from_store(err: anyhow::Error) -> Self {
        match err.downcast::<PipelineError>() {
            Ok(typed) => typed,
            Err(err) => match err.downcast::<DomainError>() {
                Ok(domain) => domain.into(),
                Err(err) => Self::StoreUnavailable(err),
            },
        }
    }
}

impl From<DomainError> for PipelineError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::UnknownStatus(status) => Self::RegistryMismatch { status },
            other => Self::Validation(ValidationError::new(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn only_side_effect_failures_report_changed_state() {
        let side = PipelineError::SideEffectFailed {
            case_id: "c1".into(),
            source: anyhow::anyhow!("ledger offline"),
        };
        assert!(side.changed_state());
        assert!(side.to_string().contains("c1"));

        let not_found = PipelineError::CaseNotFound { id: "c1".into() };
        assert!(!not_found.changed_state());
        assert!(!PipelineError::SaveUnavailable { status: StageKey::Discharged }.changed_state());
    }

    #[test]
    fn from_store_recovers_typed_errors_through_context() {
        let err = anyhow::Error::new(PipelineError::CaseNotFound { id: "c9".into() })
            .context("loading case");
        assert!(matches!(
            PipelineError::from_store(err),
            PipelineError::CaseNotFound { ref id } if id == "c9"
        ));

        let domain: anyhow::Result<()> =
            Err(DomainError::SecondActiveAssignment { staff_id: "s1".into() }).context("update");
        assert!(matches!(
            PipelineError::from_store(domain.unwrap_err()),
            PipelineError::Validation(_)
        ));
    }

    #[test]
    fn from_store_treats_unknown_errors_as_unavailable() {
        let err = PipelineError::from_store(anyhow::anyhow!("disk I/O error"));
        assert!(matches!(err, PipelineError::StoreUnavailable(_)));
    }

    #[test]
    fn unknown_status_maps_to_registry_mismatch() {
        let err: PipelineError = DomainError::UnknownStatus("limbo".into()).into();
        assert!(matches!(err, PipelineError::RegistryMismatch { ref status } if status == "limbo"));
    }

    #[test]
    fn validation_error_carries_field() {
        let err = ValidationError::field("room", "In-person sessions need a room");
        assert_eq!(err.field.as_deref(), Some("room"));
        assert_eq!(err.to_string(), "In-person sessions need a room");
    }
}
