//! Error types for the spotgrid state store.

use thiserror::Error;

use crate::lifecycle::TransitionError;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("capacity exceeded on resource {resource_id}: {detail}")]
    CapacityExceeded { resource_id: u64, detail: String },

    #[error("conflict: {0}")]
    Conflict(String),
}

impl StateError {
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, StateError::InvalidTransition(_))
    }
}
