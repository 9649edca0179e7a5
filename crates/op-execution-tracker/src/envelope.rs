use chrono::{DateTime, Utc};
use serde::Serialize;

use op_state_store::{ExecutionRecord, ExecutionStatus};

/// Caller-facing view of an execution's outcome.
///
/// `PENDING` and `RUNNING` both read as `Pending`. `CANCELLED` and `TIMEOUT`
/// read as `Failed`; the exact status is kept on [`ExecutionView`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResultEnvelope {
    Pending {
        execution_id: String,
        create_time: DateTime<Utc>,
    },
    Success {
        execution_id: String,
        /// Encoded result exactly as stored
        result: Option<String>,
    },
    Failed {
        execution_id: String,
        error_message: String,
    },
}

impl ResultEnvelope {
    pub fn execution_id(&self) -> &str {
        match self {
            ResultEnvelope::Pending { execution_id, .. }
            | ResultEnvelope::Success { execution_id, .. }
            | ResultEnvelope::Failed { execution_id, .. } => execution_id,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ResultEnvelope::Pending { .. })
    }
}

impl From<&ExecutionRecord> for ResultEnvelope {
    fn from(record: &ExecutionRecord) -> Self {
        let execution_id = record.execution_id.clone();
        let error_or = |fallback: &str| {
            record
                .error_message
                .clone()
                .unwrap_or_else(|| fallback.to_string())
        };
        match record.status {
            ExecutionStatus::Pending | ExecutionStatus::Running => ResultEnvelope::Pending {
                execution_id,
                create_time: record.create_time,
            },
            ExecutionStatus::Success => ResultEnvelope::Success {
                execution_id,
                result: record.result_encoded.clone(),
            },
            ExecutionStatus::Failed => ResultEnvelope::Failed {
                execution_id,
                error_message: error_or("execution failed"),
            },
            ExecutionStatus::Timeout => ResultEnvelope::Failed {
                execution_id,
                error_message: error_or("execution timed out"),
            },
            ExecutionStatus::Cancelled => ResultEnvelope::Failed {
                execution_id,
                error_message: "execution cancelled".to_string(),
            },
        }
    }
}

/// Envelope plus the raw status it was derived from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionView {
    pub status: ExecutionStatus,
    pub envelope: ResultEnvelope,
}

impl From<&ExecutionRecord> for ExecutionView {
    fn from(record: &ExecutionRecord) -> Self {
        Self {
            status: record.status,
            envelope: ResultEnvelope::from(record),
        }
    }
}
