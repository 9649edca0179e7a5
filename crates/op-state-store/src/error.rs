use thiserror::Error;

use crate::execution_record::ExecutionStatus;

#[derive(Error, Debug)]
pub enum StateStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Execution not found: {0}")]
    NotFound(String),
    /// The record was not in the expected status when the transition was attempted.
    #[error("Stale state for execution {id}: expected {expected}, found {actual}")]
    StaleState {
        id: String,
        expected: ExecutionStatus,
        actual: ExecutionStatus,
    },
    #[error("Illegal transition: {from} -> {to}")]
    IllegalTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StateStoreError {
    /// Label used for the `error_type` metric dimension
    pub fn kind(&self) -> &'static str {
        match self {
            StateStoreError::Database(_) => "database",
            StateStoreError::Serialization(_) => "serialization",
            StateStoreError::NotFound(_) => "not_found",
            StateStoreError::StaleState { .. } => "stale_state",
            StateStoreError::IllegalTransition { .. } => "illegal_transition",
            StateStoreError::Corrupt(_) => "corrupt",
        }
    }
}

pub type Result<T> = std::result::Result<T, StateStoreError>;
