use op_state_store::StateStoreError;
use thiserror::Error;

/// Errors surfaced to callers of the execution manager.
///
/// Failures of the work itself are never reported here; they are recorded
/// on the execution record and read back by polling.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Execution not found: {0}")]
    NotFound(String),

    #[error("Execution {execution_id} rejected by executor: {reason}")]
    Rejected { execution_id: String, reason: String },

    #[error("Failed to decode result of execution {execution_id}: {reason}")]
    Decode { execution_id: String, reason: String },

    #[error("Store error: {0}")]
    Store(StateStoreError),
}

impl From<StateStoreError> for ExecutionError {
    fn from(err: StateStoreError) -> Self {
        match err {
            StateStoreError::NotFound(id) => ExecutionError::NotFound(id),
            other => ExecutionError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
