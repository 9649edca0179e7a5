//! SQLite-based persistent execution store
//!
//! One row per execution in `execution_records`. Compare-and-transition is a
//! conditional `UPDATE ... WHERE execution_id = ? AND status = ?`; the
//! status predicate is evaluated by SQLite together with the write, so two
//! actors racing on one record cannot both succeed.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::{Result, StateStoreError};
use crate::execution_record::{record_now, ExecutionRecord, ExecutionStatus};
use crate::execution_store::{check_transition, ExecutionStore, RecordMutation, StatusCounts};
use crate::metrics::{self, OperationTimer};

const STORE_TYPE: &str = "sqlite";

const SELECT_COLUMNS: &str = "execution_id, target_name, operation_name, status, \
     arguments, result, create_time, start_time, finish_time, error_message, error_stack, \
     metadata";

/// SQLite-backed execution store
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store with the given database URL
    ///
    /// URL format: `sqlite:///path/to/db.sqlite?mode=rwc` or `sqlite::memory:`
    pub async fn new(url: &str) -> Result<Self> {
        info!("Initializing SQLite execution store: {}", url);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;

        info!("SQLite execution store initialized successfully");
        Ok(store)
    }

    /// Create an in-memory store for testing
    ///
    /// Every SQLite connection to `:memory:` opens its own database, so the
    /// pool is pinned to one connection that is never recycled.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<()> {
        debug!("Initializing execution store schema");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_records (
                execution_id TEXT PRIMARY KEY,
                target_name TEXT NOT NULL,
                operation_name TEXT NOT NULL,
                status TEXT NOT NULL,
                arguments TEXT,
                result TEXT,
                create_time TEXT NOT NULL,
                start_time TEXT,
                finish_time TEXT,
                error_message TEXT,
                error_stack TEXT,
                metadata TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_status ON execution_records(status)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_records_finish ON execution_records(finish_time)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM execution_records WHERE execution_id = ?",
            SELECT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row_to_record(&row)).transpose()
    }

    fn observe<T>(&self, operation: &'static str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            metrics::record_store_error(operation, STORE_TYPE, e.kind());
        }
        result
    }

    async fn save_inner(&self, record: &ExecutionRecord) -> Result<()> {
        let metadata_json = serde_json::to_string(&record.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO execution_records (
                execution_id, target_name, operation_name, status, arguments, result,
                create_time, start_time, finish_time, error_message, error_stack, metadata
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(execution_id) DO UPDATE SET
                target_name = excluded.target_name,
                operation_name = excluded.operation_name,
                status = excluded.status,
                arguments = excluded.arguments,
                result = excluded.result,
                create_time = excluded.create_time,
                start_time = excluded.start_time,
                finish_time = excluded.finish_time,
                error_message = excluded.error_message,
                error_stack = excluded.error_stack,
                metadata = excluded.metadata
            "#,
        )
        .bind(&record.execution_id)
        .bind(&record.target_name)
        .bind(&record.operation_name)
        .bind(record.status.as_str())
        .bind(&record.arguments_encoded)
        .bind(&record.result_encoded)
        .bind(format_time(record.create_time))
        .bind(record.start_time.map(format_time))
        .bind(record.finish_time.map(format_time))
        .bind(&record.error_message)
        .bind(&record.error_stack)
        .bind(&metadata_json)
        .execute(&self.pool)
        .await?;

        metrics::record_save();
        debug!(
            execution_id = %record.execution_id,
            status = %record.status,
            "Saved execution record"
        );
        Ok(())
    }

    async fn transition_inner(
        &self,
        id: &str,
        expected: ExecutionStatus,
        next: ExecutionStatus,
        mutate: RecordMutation,
    ) -> Result<ExecutionRecord> {
        check_transition(expected, next)?;

        let current = self
            .fetch(id)
            .await?
            .ok_or_else(|| StateStoreError::NotFound(id.to_string()))?;
        if current.status != expected {
            metrics::record_stale_transition(expected, next);
            return Err(StateStoreError::StaleState {
                id: id.to_string(),
                expected,
                actual: current.status,
            });
        }

        let mut updated = current;
        updated.apply_transition(next, mutate, record_now());
        let metadata_json = serde_json::to_string(&updated.metadata)?;

        let result = sqlx::query(
            r#"
            UPDATE execution_records
            SET status = ?, arguments = ?, result = ?, start_time = ?, finish_time = ?,
                error_message = ?, error_stack = ?, metadata = ?
            WHERE execution_id = ? AND status = ?
            "#,
        )
        .bind(updated.status.as_str())
        .bind(&updated.arguments_encoded)
        .bind(&updated.result_encoded)
        .bind(updated.start_time.map(format_time))
        .bind(updated.finish_time.map(format_time))
        .bind(&updated.error_message)
        .bind(&updated.error_stack)
        .bind(&metadata_json)
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Lost the race between our read and our write.
            metrics::record_stale_transition(expected, next);
            return match self.fetch(id).await? {
                Some(record) => Err(StateStoreError::StaleState {
                    id: id.to_string(),
                    expected,
                    actual: record.status,
                }),
                None => Err(StateStoreError::NotFound(id.to_string())),
            };
        }

        metrics::record_transition(expected, next);
        debug!(execution_id = %id, from = %expected, to = %next, "Execution transitioned");
        Ok(updated)
    }

    async fn list_inner(
        &self,
        status: ExecutionStatus,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = if limit == 0 { -1 } else { limit as i64 };
        let rows = sqlx::query(&format!(
            "SELECT {} FROM execution_records WHERE status = ? ORDER BY create_time ASC LIMIT ?",
            SELECT_COLUMNS
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn count_inner(&self) -> Result<StatusCounts> {
        let rows =
            sqlx::query("SELECT status, COUNT(*) AS n FROM execution_records GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status_str: String = row.get("status");
            let n: i64 = row.get("n");
            counts.add(parse_status(&status_str)?, n as u64);
        }
        metrics::update_status_counts(&counts);
        Ok(counts)
    }

    async fn delete_inner(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM execution_records
            WHERE finish_time IS NOT NULL AND finish_time < ?
              AND status IN ('SUCCESS', 'FAILED', 'CANCELLED', 'TIMEOUT')
            "#,
        )
        .bind(format_time(cutoff))
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        metrics::record_deleted(deleted);
        debug!(deleted, cutoff = %format_time(cutoff), "Deleted finished executions");
        Ok(deleted)
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    fn store_type(&self) -> &'static str {
        STORE_TYPE
    }

    async fn save(&self, record: &ExecutionRecord) -> Result<()> {
        let _timer = OperationTimer::new("save", STORE_TYPE);
        let result = self.save_inner(record).await;
        self.observe("save", result)
    }

    async fn find_by_id(&self, id: &str) -> Result<ExecutionRecord> {
        let _timer = OperationTimer::new("find_by_id", STORE_TYPE);
        let result = self
            .fetch(id)
            .await
            .and_then(|r| r.ok_or_else(|| StateStoreError::NotFound(id.to_string())));
        self.observe("find_by_id", result)
    }

    async fn compare_and_transition(
        &self,
        id: &str,
        expected: ExecutionStatus,
        next: ExecutionStatus,
        mutate: RecordMutation,
    ) -> Result<ExecutionRecord> {
        let _timer = OperationTimer::new("compare_and_transition", STORE_TYPE);
        let result = self.transition_inner(id, expected, next, mutate).await;
        self.observe("compare_and_transition", result)
    }

    async fn list_by_status(
        &self,
        status: ExecutionStatus,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        let _timer = OperationTimer::new("list_by_status", STORE_TYPE);
        let result = self.list_inner(status, limit).await;
        self.observe("list_by_status", result)
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        let _timer = OperationTimer::new("count_by_status", STORE_TYPE);
        let result = self.count_inner().await;
        self.observe("count_by_status", result)
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let _timer = OperationTimer::new("delete_finished_before", STORE_TYPE);
        let result = self.delete_inner(cutoff).await;
        self.observe("delete_finished_before", result)
    }
}

/// Fixed-width UTC timestamps, so text comparison in SQL matches time order
fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StateStoreError::Corrupt(format!("bad timestamp {:?}: {}", s, e)))
}

fn parse_status(s: &str) -> Result<ExecutionStatus> {
    s.parse().map_err(StateStoreError::Corrupt)
}

fn row_to_record(row: &SqliteRow) -> Result<ExecutionRecord> {
    let status_str: String = row.get("status");
    let create_time_str: String = row.get("create_time");
    let start_time_str: Option<String> = row.get("start_time");
    let finish_time_str: Option<String> = row.get("finish_time");
    let metadata_json: String = row.get("metadata");

    Ok(ExecutionRecord {
        execution_id: row.get("execution_id"),
        target_name: row.get("target_name"),
        operation_name: row.get("operation_name"),
        status: parse_status(&status_str)?,
        arguments_encoded: row.get("arguments"),
        result_encoded: row.get("result"),
        create_time: parse_time(&create_time_str)?,
        start_time: start_time_str.as_deref().map(parse_time).transpose()?,
        finish_time: finish_time_str.as_deref().map(parse_time).transpose()?,
        error_message: row.get("error_message"),
        error_stack: row.get("error_stack"),
        metadata: serde_json::from_str::<HashMap<String, String>>(&metadata_json)?,
    })
}
