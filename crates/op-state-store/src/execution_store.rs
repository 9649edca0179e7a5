use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StateStoreError};
use crate::execution_record::{ExecutionRecord, ExecutionStatus};

/// Field changes applied together with a status transition
pub type RecordMutation = Box<dyn FnOnce(&mut ExecutionRecord) + Send>;

/// Keyed persistence for execution records.
///
/// `compare_and_transition` is the only way a status may change. It checks
/// the record's current status and applies the mutation as one atomic step,
/// so a cancel caller, a worker and a timeout supervisor can race on the
/// same record without lost updates.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Backend label used in metrics and logs
    fn store_type(&self) -> &'static str;

    /// Upsert by `execution_id`
    async fn save(&self, record: &ExecutionRecord) -> Result<()>;

    /// `NotFound` for unknown ids
    async fn find_by_id(&self, id: &str) -> Result<ExecutionRecord>;

    /// Move `id` from `expected` to `next`, applying `mutate` on the way.
    ///
    /// Fails without side effects:
    /// - `IllegalTransition` if `expected -> next` is not a state machine edge
    /// - `NotFound` if the id is unknown
    /// - `StaleState` if the current status is not `expected`
    ///
    /// Returns the record as persisted.
    async fn compare_and_transition(
        &self,
        id: &str,
        expected: ExecutionStatus,
        next: ExecutionStatus,
        mutate: RecordMutation,
    ) -> Result<ExecutionRecord>;

    /// Records in `status`, oldest first. `limit == 0` means no limit.
    async fn list_by_status(
        &self,
        status: ExecutionStatus,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>>;

    async fn count_by_status(&self) -> Result<StatusCounts>;

    /// Remove terminal records whose `finish_time` is before `cutoff`.
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Helpers for building [`RecordMutation`]s
pub mod mutation {
    use super::RecordMutation;

    /// A transition that only changes status and timestamps
    pub fn none() -> RecordMutation {
        Box::new(|_| {})
    }
}

/// Reject transitions that are not edges of the state machine.
pub(crate) fn check_transition(expected: ExecutionStatus, next: ExecutionStatus) -> Result<()> {
    if expected.can_transition_to(next) {
        Ok(())
    } else {
        Err(StateStoreError::IllegalTransition {
            from: expected,
            to: next,
        })
    }
}

/// Record counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub success: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timeout: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: ExecutionStatus, n: u64) {
        self.total += n;
        match status {
            ExecutionStatus::Pending => self.pending += n,
            ExecutionStatus::Running => self.running += n,
            ExecutionStatus::Success => self.success += n,
            ExecutionStatus::Failed => self.failed += n,
            ExecutionStatus::Cancelled => self.cancelled += n,
            ExecutionStatus::Timeout => self.timeout += n,
        }
    }

    pub fn get(&self, status: ExecutionStatus) -> u64 {
        match status {
            ExecutionStatus::Pending => self.pending,
            ExecutionStatus::Running => self.running,
            ExecutionStatus::Success => self.success,
            ExecutionStatus::Failed => self.failed,
            ExecutionStatus::Cancelled => self.cancelled,
            ExecutionStatus::Timeout => self.timeout,
        }
    }
}
