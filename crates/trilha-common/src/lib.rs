//! Shared domain types for the Trilha patient-case pipeline.
//!
//! - `stage`: the closed set of pipeline stage keys
//! - `case`: the `Case` aggregate and its sub-records
//! - `patch`: field-scoped partial updates (`CasePatch`)
//! - `session`: per-case `Session` records and their ordering rules

pub mod case;
pub mod patch;
pub mod session;
pub mod stage;

pub use case::*;
pub use patch::*;
pub use session::*;
pub use stage::StageKey;

use thiserror::Error;

/// Violations of the domain model itself, independent of storage.
#[derive(Debug, Error, PartialEq)]
pub enum DomainError {
    #[error("Unknown case status '{0}'")]
    UnknownStatus(String),

    #[error("Treatment assignment {0} not found on case")]
    UnknownAssignment(String),

    #[error("Treatment assignment {0} already exists on case")]
    DuplicateAssignment(String),

    #[error("Staff member {staff_id} already has an active assignment on this case")]
    SecondActiveAssignment { staff_id: String },
}
