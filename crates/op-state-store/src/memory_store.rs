//! In-process execution store
//!
//! A map behind a single `RwLock`. Compare-and-transition holds the write
//! lock across the status check and the mutation, which is what makes it
//! atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Result, StateStoreError};
use crate::execution_record::{record_now, ExecutionRecord, ExecutionStatus};
use crate::execution_store::{check_transition, ExecutionStore, RecordMutation, StatusCounts};
use crate::metrics::{self, OperationTimer};

const STORE_TYPE: &str = "memory";

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, ExecutionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    fn store_type(&self) -> &'static str {
        STORE_TYPE
    }

    async fn save(&self, record: &ExecutionRecord) -> Result<()> {
        let _timer = OperationTimer::new("save", STORE_TYPE);
        let mut records = self.records.write().await;
        records.insert(record.execution_id.clone(), record.clone());
        metrics::record_save();
        debug!(
            execution_id = %record.execution_id,
            status = %record.status,
            "Saved execution record"
        );
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<ExecutionRecord> {
        let _timer = OperationTimer::new("find_by_id", STORE_TYPE);
        let records = self.records.read().await;
        records
            .get(id)
            .cloned()
            .ok_or_else(|| StateStoreError::NotFound(id.to_string()))
    }

    async fn compare_and_transition(
        &self,
        id: &str,
        expected: ExecutionStatus,
        next: ExecutionStatus,
        mutate: RecordMutation,
    ) -> Result<ExecutionRecord> {
        let _timer = OperationTimer::new("compare_and_transition", STORE_TYPE);
        check_transition(expected, next)?;

        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StateStoreError::NotFound(id.to_string()))?;

        if record.status != expected {
            metrics::record_stale_transition(expected, next);
            return Err(StateStoreError::StaleState {
                id: id.to_string(),
                expected,
                actual: record.status,
            });
        }

        record.apply_transition(next, mutate, record_now());
        metrics::record_transition(expected, next);
        debug!(execution_id = %id, from = %expected, to = %next, "Execution transitioned");
        Ok(record.clone())
    }

    async fn list_by_status(
        &self,
        status: ExecutionStatus,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        let _timer = OperationTimer::new("list_by_status", STORE_TYPE);
        let records = self.records.read().await;
        let mut matching: Vec<ExecutionRecord> = records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.create_time);
        if limit > 0 {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        let _timer = OperationTimer::new("count_by_status", STORE_TYPE);
        let records = self.records.read().await;
        let mut counts = StatusCounts::default();
        for record in records.values() {
            counts.add(record.status, 1);
        }
        metrics::update_status_counts(&counts);
        Ok(counts)
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let _timer = OperationTimer::new("delete_finished_before", STORE_TYPE);
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| {
            !(r.is_terminal() && r.finish_time.map(|f| f < cutoff).unwrap_or(false))
        });
        let deleted = (before - records.len()) as u64;
        metrics::record_deleted(deleted);
        Ok(deleted)
    }
}
