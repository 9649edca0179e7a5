//! Store wrapper that fails chosen transitions, for worker and monitor tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};

use op_state_store::{
    ExecutionRecord, ExecutionStatus, ExecutionStore, MemoryStore, RecordMutation, Result,
    StateStoreError, StatusCounts,
};

/// Delegates to a [`MemoryStore`], except that transitions into `failing`
/// return [`StateStoreError::Corrupt`] until `failures` of them have failed.
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    failing: ExecutionStatus,
    only_id: Option<String>,
    failures_left: AtomicUsize,
    failed: AtomicUsize,
}

impl FlakyStore {
    pub(crate) fn failing_into(failing: ExecutionStatus, failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failing,
            only_id: None,
            failures_left: AtomicUsize::new(failures),
            failed: AtomicUsize::new(0),
        }
    }

    /// Restrict failures to one execution
    pub(crate) fn only_for(mut self, execution_id: &str) -> Self {
        self.only_id = Some(execution_id.to_string());
        self
    }

    /// Transitions that were failed so far
    pub(crate) fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    fn should_fail(&self, id: &str, next: ExecutionStatus) -> bool {
        if next != self.failing || self.only_id.as_deref().is_some_and(|only| only != id) {
            return false;
        }
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ExecutionStore for FlakyStore {
    fn store_type(&self) -> &'static str {
        "flaky"
    }

    async fn save(&self, record: &ExecutionRecord) -> Result<()> {
        self.inner.save(record).await
    }

    async fn find_by_id(&self, id: &str) -> Result<ExecutionRecord> {
        self.inner.find_by_id(id).await
    }

    async fn compare_and_transition(
        &self,
        id: &str,
        expected: ExecutionStatus,
        next: ExecutionStatus,
        mutate: RecordMutation,
    ) -> Result<ExecutionRecord> {
        if self.should_fail(id, next) {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(StateStoreError::Corrupt(format!("write of {} failed", next)));
        }
        self.inner
            .compare_and_transition(id, expected, next, mutate)
            .await
    }

    async fn list_by_status(
        &self,
        status: ExecutionStatus,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        self.inner.list_by_status(status, limit).await
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        self.inner.count_by_status().await
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.inner.delete_finished_before(cutoff).await
    }
}
