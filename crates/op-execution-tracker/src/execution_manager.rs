use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use op_core::{IdGenerator, JsonCodec, PayloadCodec, UuidIdGenerator};
use op_state_store::{
    mutation, ExecutionRecord, ExecutionStatus, ExecutionStore, RecordMutation, StateStoreError,
    StatusCounts,
};

use crate::envelope::ExecutionView;
use crate::error::{ExecutionError, Result};
use crate::executor::WorkExecutor;
use crate::failure::{truncate_on_char_boundary, WorkFailure};
use crate::metrics::ExecutionMetrics;
use crate::telemetry::ExecutionTelemetry;

/// Stored in place of arguments that could not be encoded
pub const ARGUMENTS_PLACEHOLDER: &str = "[]";
/// Stored in place of a result that could not be encoded
pub const RESULT_PLACEHOLDER: &str = "null";

pub const CANCEL_REASON_KEY: &str = "cancel_reason";
pub const RESULT_ENCODING_ERROR_KEY: &str = "result_encoding_error";

/// `cancel_reason` values written by the manager
pub const CANCEL_REQUESTED: &str = "requested";
pub const CANCEL_EXECUTOR_REJECTED: &str = "executor_rejected";
pub const CANCEL_START_FAILED: &str = "start_failed";

const ENCODING_ERROR_MAX_LEN: usize = 512;

/// Tunables for the manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Upper bound on `error_stack`, in bytes
    pub max_error_stack_len: usize,
    /// Extra attempts for a worker-side store write that failed for a
    /// reason other than a lost race
    pub write_retries: u32,
    /// Delay before the first retry; doubles on each further attempt
    pub write_retry_backoff: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_error_stack_len: 4000,
            write_retries: 3,
            write_retry_backoff: Duration::from_millis(20),
        }
    }
}

impl From<&op_core::config::FailureSettings> for ManagerConfig {
    fn from(settings: &op_core::config::FailureSettings) -> Self {
        Self {
            max_error_stack_len: settings.max_error_stack_len,
            ..Self::default()
        }
    }
}

/// What the worker writes when the record leaves `RUNNING`.
///
/// A [`RecordMutation`] is consumed by the store, so each write attempt
/// builds a fresh one from this.
#[derive(Debug, Clone)]
enum Outcome {
    Success {
        encoded: String,
        encoding_error: Option<String>,
    },
    Failed(WorkFailure),
}

impl Outcome {
    fn status(&self) -> ExecutionStatus {
        match self {
            Outcome::Success { .. } => ExecutionStatus::Success,
            Outcome::Failed(_) => ExecutionStatus::Failed,
        }
    }

    fn mutation(&self) -> RecordMutation {
        match self.clone() {
            Outcome::Success {
                encoded,
                encoding_error,
            } => Box::new(move |r| {
                r.result_encoded = Some(encoded);
                if let Some(reason) = encoding_error {
                    r.metadata
                        .insert(RESULT_ENCODING_ERROR_KEY.to_string(), reason);
                }
            }),
            Outcome::Failed(failure) => failure.into_mutation(),
        }
    }
}

fn cancel_reason(reason: &'static str) -> RecordMutation {
    Box::new(move |r| {
        r.metadata
            .insert(CANCEL_REASON_KEY.to_string(), reason.to_string());
    })
}

/// Lost races, unknown ids and illegal moves come out the same on every
/// attempt.
fn is_retryable(err: &StateStoreError) -> bool {
    !matches!(
        err,
        StateStoreError::StaleState { .. }
            | StateStoreError::NotFound(_)
            | StateStoreError::IllegalTransition { .. }
    )
}

/// Submits work, drives its lifecycle, and answers polls and cancels.
///
/// Every status change goes through [`ExecutionStore::compare_and_transition`].
/// Cheap to clone; clones share the same store, executor and metrics.
#[derive(Clone)]
pub struct ExecutionManager {
    store: Arc<dyn ExecutionStore>,
    executor: Arc<dyn WorkExecutor>,
    codec: Arc<dyn PayloadCodec>,
    ids: Arc<dyn IdGenerator>,
    metrics: ExecutionMetrics,
    telemetry: Arc<ExecutionTelemetry>,
    config: ManagerConfig,
}

impl ExecutionManager {
    pub fn new(store: Arc<dyn ExecutionStore>, executor: Arc<dyn WorkExecutor>) -> Self {
        Self {
            store,
            executor,
            codec: Arc::new(JsonCodec),
            ids: Arc::new(UuidIdGenerator),
            metrics: ExecutionMetrics::default(),
            telemetry: Arc::new(ExecutionTelemetry::default()),
            config: ManagerConfig::default(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_metrics(mut self, metrics: ExecutionMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<ExecutionTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn metrics(&self) -> &ExecutionMetrics {
        &self.metrics
    }

    /// Submit `work` and return its `PENDING` record without waiting for it.
    pub async fn submit<A, T, F, Fut>(
        &self,
        target: &str,
        operation: &str,
        args: &A,
        work: F,
    ) -> Result<ExecutionRecord>
    where
        A: Serialize + Sync + ?Sized,
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.submit_with_metadata(target, operation, args, HashMap::new(), work)
            .await
    }

    /// [`submit`](Self::submit) with caller-supplied tags on the record.
    ///
    /// Fails only if the record cannot be persisted, or if the executor
    /// refuses the work. A refused record is moved to `CANCELLED` before
    /// `Rejected` is returned.
    #[instrument(skip(self, args, metadata, work))]
    pub async fn submit_with_metadata<A, T, F, Fut>(
        &self,
        target: &str,
        operation: &str,
        args: &A,
        metadata: HashMap<String, String>,
        work: F,
    ) -> Result<ExecutionRecord>
    where
        A: Serialize + Sync + ?Sized,
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let execution_id = self.ids.new_id();

        let arguments = match self.encode_payload(args) {
            Ok(encoded) => encoded,
            Err(reason) => {
                warn!(
                    execution_id = %execution_id,
                    codec = self.codec.name(),
                    error = %reason,
                    "Failed to encode arguments; storing placeholder"
                );
                self.metrics.encoding_failed("arguments");
                ARGUMENTS_PLACEHOLDER.to_string()
            }
        };

        let record = ExecutionRecord::new(execution_id.clone(), target, operation)
            .with_arguments(arguments)
            .with_metadata(metadata);
        self.store.save(&record).await?;

        self.metrics.execution_submitted();
        self.telemetry.submitted(&record);

        let worker = self.clone();
        let worker_id = execution_id.clone();
        let task = async move { worker.run_execution(worker_id, work).await }.boxed();

        if let Err(rejection) = self.executor.execute(task) {
            self.metrics.execution_rejected();
            warn!(
                execution_id = %execution_id,
                reason = %rejection,
                "Executor rejected execution"
            );

            if let Err(e) = self
                .cancel_unstarted(&execution_id, CANCEL_EXECUTOR_REJECTED)
                .await
            {
                error!(
                    execution_id = %execution_id,
                    error = %e,
                    "Failed to cancel rejected execution"
                );
            }

            return Err(ExecutionError::Rejected {
                execution_id,
                reason: rejection.to_string(),
            });
        }

        debug!(execution_id = %execution_id, "Execution scheduled");
        Ok(record)
    }

    /// Worker side: claim the record, run the work, record the outcome.
    #[instrument(skip(self, work))]
    async fn run_execution<T, F, Fut>(&self, execution_id: String, work: F)
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let claimed = self
            .write_with_retry(
                &execution_id,
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                mutation::none,
            )
            .await;
        match claimed {
            Ok(running) => {
                self.metrics.execution_started();
                self.telemetry.started(&running);
            }
            Err(StateStoreError::StaleState { actual, .. }) => {
                debug!(
                    execution_id = %execution_id,
                    status = %actual,
                    "Execution no longer pending; skipping work"
                );
                self.metrics.execution_skipped();
                return;
            }
            Err(e) => {
                error!(
                    execution_id = %execution_id,
                    error = %e,
                    "Failed to start execution; cancelling it"
                );
                if let Err(e) = self
                    .cancel_unstarted(&execution_id, CANCEL_START_FAILED)
                    .await
                {
                    error!(
                        execution_id = %execution_id,
                        error = %e,
                        "Failed to cancel unstartable execution"
                    );
                }
                return;
            }
        }

        let result = AssertUnwindSafe(async move { work().await })
            .catch_unwind()
            .await;
        self.metrics.work_finished();

        let max_stack = self.config.max_error_stack_len;
        let outcome = match result {
            Ok(Ok(value)) => self.success_outcome(&execution_id, &value),
            Ok(Err(err)) => Outcome::Failed(WorkFailure::from_error(&err, max_stack)),
            Err(payload) => Outcome::Failed(WorkFailure::from_panic(payload.as_ref(), max_stack)),
        };
        self.record_outcome(&execution_id, outcome).await;
    }

    /// Move a `RUNNING` record to its outcome.
    ///
    /// If a result cannot be written, a failure naming the store error is
    /// written instead so the record still leaves `RUNNING`.
    async fn record_outcome(&self, execution_id: &str, mut outcome: Outcome) {
        loop {
            let next = outcome.status();
            let written = self
                .write_with_retry(execution_id, ExecutionStatus::Running, next, || {
                    outcome.mutation()
                })
                .await;

            match written {
                Ok(finished) => {
                    if finished.status == ExecutionStatus::Success {
                        self.metrics.execution_succeeded(finished.duration_ms());
                    } else {
                        self.metrics.execution_failed(finished.duration_ms());
                    }
                    self.telemetry.finished(&finished);
                    return;
                }
                Err(StateStoreError::StaleState { actual, .. }) => {
                    self.metrics.result_discarded();
                    self.telemetry.outcome_discarded(execution_id, actual);
                    return;
                }
                Err(e) if next == ExecutionStatus::Success && is_retryable(&e) => {
                    warn!(
                        execution_id = %execution_id,
                        error = %e,
                        "Failed to record result; recording a failure instead"
                    );
                    let message = format!("failed to record result: {}", e);
                    outcome = Outcome::Failed(WorkFailure {
                        stack: message.clone(),
                        message,
                    });
                }
                Err(e) => {
                    error!(
                        execution_id = %execution_id,
                        status = %next,
                        error = %e,
                        "Failed to record execution outcome"
                    );
                    return;
                }
            }
        }
    }

    /// Compare-and-transition with a bounded backoff on store errors.
    ///
    /// `build` supplies a fresh mutation for every attempt.
    async fn write_with_retry<M>(
        &self,
        execution_id: &str,
        expected: ExecutionStatus,
        next: ExecutionStatus,
        build: M,
    ) -> std::result::Result<ExecutionRecord, StateStoreError>
    where
        M: Fn() -> RecordMutation + Send + Sync,
    {
        let mut delay = self.config.write_retry_backoff;
        let mut attempt = 0;
        loop {
            match self
                .store
                .compare_and_transition(execution_id, expected, next, build())
                .await
            {
                Err(e) if is_retryable(&e) && attempt < self.config.write_retries => {
                    attempt += 1;
                    warn!(
                        execution_id = %execution_id,
                        status = %next,
                        attempt,
                        error = %e,
                        "Store write failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                written => return written,
            }
        }
    }

    /// `PENDING -> CANCELLED` for work that never ran
    async fn cancel_unstarted(
        &self,
        execution_id: &str,
        reason: &'static str,
    ) -> std::result::Result<ExecutionRecord, StateStoreError> {
        let cancelled = self
            .write_with_retry(
                execution_id,
                ExecutionStatus::Pending,
                ExecutionStatus::Cancelled,
                || cancel_reason(reason),
            )
            .await?;
        self.metrics.execution_cancelled();
        self.telemetry.finished(&cancelled);
        Ok(cancelled)
    }

    fn success_outcome<T: Serialize>(&self, execution_id: &str, value: &T) -> Outcome {
        match self.encode_payload(value) {
            Ok(encoded) => Outcome::Success {
                encoded,
                encoding_error: None,
            },
            Err(reason) => {
                warn!(
                    execution_id = %execution_id,
                    codec = self.codec.name(),
                    error = %reason,
                    "Failed to encode result; storing placeholder"
                );
                self.metrics.encoding_failed("result");
                Outcome::Success {
                    encoded: RESULT_PLACEHOLDER.to_string(),
                    encoding_error: Some(reason),
                }
            }
        }
    }

    /// Serialize through the codec. A panicking `Serialize` impl counts as a
    /// failure.
    fn encode_payload<T: Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> std::result::Result<String, String> {
        let encoded = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let value = serde_json::to_value(value).map_err(|e| e.to_string())?;
            self.codec.encode(&value).map_err(|e| e.to_string())
        }));
        match encoded {
            Ok(result) => {
                result.map_err(|e| truncate_on_char_boundary(e, ENCODING_ERROR_MAX_LEN))
            }
            Err(_) => Err("serializer panicked".to_string()),
        }
    }

    /// Current record for `execution_id`
    #[instrument(skip(self))]
    pub async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord> {
        Ok(self.store.find_by_id(execution_id).await?)
    }

    /// Cancel an execution that has not started.
    ///
    /// `Ok(true)` only if this call moved the record from `PENDING` to
    /// `CANCELLED`. Unknown ids and records past `PENDING` give `Ok(false)`.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: &str) -> Result<bool> {
        match self
            .store
            .compare_and_transition(
                execution_id,
                ExecutionStatus::Pending,
                ExecutionStatus::Cancelled,
                cancel_reason(CANCEL_REQUESTED),
            )
            .await
        {
            Ok(cancelled) => {
                self.metrics.execution_cancelled();
                self.telemetry.finished(&cancelled);
                Ok(true)
            }
            Err(StateStoreError::NotFound(_)) => {
                debug!(execution_id = %execution_id, "Cancel requested for unknown execution");
                Ok(false)
            }
            Err(StateStoreError::StaleState { actual, .. }) => {
                info!(
                    execution_id = %execution_id,
                    status = %actual,
                    "Cancel rejected; execution already past PENDING"
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Status and client-facing envelope for `execution_id`
    pub async fn envelope(&self, execution_id: &str) -> Result<ExecutionView> {
        let record = self.get_execution(execution_id).await?;
        Ok(ExecutionView::from(&record))
    }

    /// Decoded result, `Some` only once the execution is `SUCCESS`.
    pub async fn fetch_result<T: DeserializeOwned>(
        &self,
        execution_id: &str,
    ) -> Result<Option<T>> {
        let record = self.get_execution(execution_id).await?;
        if record.status != ExecutionStatus::Success {
            return Ok(None);
        }

        let encoded = record.result_encoded.as_deref().unwrap_or(RESULT_PLACEHOLDER);
        let decode_error = |reason: String| ExecutionError::Decode {
            execution_id: execution_id.to_string(),
            reason,
        };
        let value = self
            .codec
            .decode(encoded)
            .map_err(|e| decode_error(e.to_string()))?;
        let typed = serde_json::from_value(value).map_err(|e| decode_error(e.to_string()))?;
        Ok(Some(typed))
    }

    /// Poll until the execution is terminal.
    ///
    /// Waits indefinitely; wrap in `tokio::time::timeout` to bound it.
    pub async fn wait_for_terminal(
        &self,
        execution_id: &str,
        poll_interval: Duration,
    ) -> Result<ExecutionRecord> {
        loop {
            let record = self.get_execution(execution_id).await?;
            if record.is_terminal() {
                return Ok(record);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Records in `status`, oldest first. `limit == 0` means no limit.
    pub async fn list(
        &self,
        status: ExecutionStatus,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        Ok(self.store.list_by_status(status, limit).await?)
    }

    pub async fn counts(&self) -> Result<StatusCounts> {
        Ok(self.store.count_by_status().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorError, Task, TokioWorkExecutor};
    use crate::test_support::FlakyStore;
    use op_core::SequentialIdGenerator;
    use op_state_store::MemoryStore;
    use std::collections::BTreeMap;

    const POLL: Duration = Duration::from_millis(5);
    const WAIT: Duration = Duration::from_secs(5);

    struct RejectingExecutor;

    impl WorkExecutor for RejectingExecutor {
        fn execute(&self, _task: Task) -> std::result::Result<(), ExecutorError> {
            Err(ExecutorError::QueueFull(0))
        }
    }

    fn manager() -> ExecutionManager {
        ExecutionManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(TokioWorkExecutor::with_defaults()),
        )
        .with_id_generator(Arc::new(SequentialIdGenerator::new("exec")))
    }

    fn flaky_manager(store: Arc<FlakyStore>) -> ExecutionManager {
        ExecutionManager::new(store, Arc::new(TokioWorkExecutor::with_defaults()))
            .with_id_generator(Arc::new(SequentialIdGenerator::new("exec")))
            .with_config(ManagerConfig {
                write_retry_backoff: Duration::from_millis(1),
                ..ManagerConfig::default()
            })
    }

    async fn finish(manager: &ExecutionManager, id: &str) -> ExecutionRecord {
        tokio::time::timeout(WAIT, manager.wait_for_terminal(id, POLL))
            .await
            .unwrap()
            .unwrap()
    }

    /// Map keys must be strings in JSON
    fn unencodable() -> BTreeMap<(u8, u8), u8> {
        BTreeMap::from([((1, 2), 3)])
    }

    #[tokio::test]
    async fn test_submit_uses_generated_id_and_encoded_args() {
        let manager = manager();
        let record = manager
            .submit("OrderService", "place", &("A-1", 2), || async { Ok("OK") })
            .await
            .unwrap();
        assert_eq!(record.execution_id, "exec-1");
        assert_eq!(record.arguments_encoded.as_deref(), Some(r#"["A-1",2]"#));
        finish(&manager, "exec-1").await;
    }

    #[tokio::test]
    async fn test_unencodable_arguments_use_placeholder() {
        let manager = manager();
        let record = manager
            .submit("OrderService", "place", &unencodable(), || async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(record.arguments_encoded.as_deref(), Some(ARGUMENTS_PLACEHOLDER));
        assert_eq!(manager.metrics().encoding_failures("arguments"), 1);

        let done = finish(&manager, &record.execution_id).await;
        assert_eq!(done.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_unencodable_result_still_succeeds() {
        let manager = manager();
        let record = manager
            .submit("OrderService", "snapshot", &(), || async { Ok(unencodable()) })
            .await
            .unwrap();

        let done = finish(&manager, &record.execution_id).await;
        assert_eq!(done.status, ExecutionStatus::Success);
        assert_eq!(done.result_encoded.as_deref(), Some(RESULT_PLACEHOLDER));
        assert!(done.metadata.contains_key(RESULT_ENCODING_ERROR_KEY));
        assert_eq!(manager.metrics().encoding_failures("result"), 1);
    }

    #[tokio::test]
    async fn test_panic_is_recorded_as_failure() {
        let manager = manager();
        let record = manager
            .submit("OrderService", "place", &(), || async {
                if true {
                    panic!("inventory index corrupted");
                }
                Ok(())
            })
            .await
            .unwrap();

        let done = finish(&manager, &record.execution_id).await;
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(
            done.error_message.as_deref(),
            Some("work panicked: inventory index corrupted")
        );
        assert!(done.error_stack.is_some());
        assert_eq!(manager.metrics().active(), 0);
    }

    #[tokio::test]
    async fn test_error_stack_is_bounded() {
        let manager = manager().with_config(ManagerConfig {
            max_error_stack_len: 64,
            ..ManagerConfig::default()
        });
        let record = manager
            .submit("OrderService", "place", &(), || async {
                Err::<(), _>(anyhow::anyhow!("{}", "e".repeat(1000)))
            })
            .await
            .unwrap();

        let done = finish(&manager, &record.execution_id).await;
        assert!(done.error_stack.unwrap().len() <= 64);
    }

    #[tokio::test]
    async fn test_rejected_submission_is_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let manager = ExecutionManager::new(store.clone(), Arc::new(RejectingExecutor))
            .with_id_generator(Arc::new(SequentialIdGenerator::new("exec")));

        let err = manager
            .submit("OrderService", "place", &(), || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Rejected { ref execution_id, .. } if execution_id == "exec-1"
        ));

        let record = manager.get_execution("exec-1").await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert_eq!(
            record.metadata.get(CANCEL_REASON_KEY).map(String::as_str),
            Some(CANCEL_EXECUTOR_REJECTED)
        );
        assert!(record.finish_time.is_some());
        assert_eq!(manager.metrics().rejected(), 1);
    }

    #[tokio::test]
    async fn test_fetch_result_decode_mismatch() {
        let manager = manager();
        let record = manager
            .submit("OrderService", "place", &(), || async { Ok("not a number") })
            .await
            .unwrap();
        finish(&manager, &record.execution_id).await;

        let as_text: Option<String> = manager.fetch_result(&record.execution_id).await.unwrap();
        assert_eq!(as_text.as_deref(), Some("not a number"));

        let err = manager
            .fetch_result::<u32>(&record.execution_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_cancel_unknown_is_false() {
        let manager = manager();
        assert!(!manager.cancel("nonexistent-id").await.unwrap());
        assert!(matches!(
            manager.get_execution("nonexistent-id").await,
            Err(ExecutionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_with_metadata_keeps_tags() {
        let manager = manager();
        let tags = HashMap::from([("tenant".to_string(), "acme".to_string())]);
        let record = manager
            .submit_with_metadata("OrderService", "place", &(), tags, || async { Ok(()) })
            .await
            .unwrap();

        let done = finish(&manager, &record.execution_id).await;
        assert_eq!(done.metadata.get("tenant").map(String::as_str), Some("acme"));
        assert!(!done.metadata.contains_key(CANCEL_REASON_KEY));
    }

    #[tokio::test]
    async fn test_outcome_write_is_retried_after_store_error() {
        let store = Arc::new(FlakyStore::failing_into(ExecutionStatus::Success, 1));
        let manager = flaky_manager(store.clone());
        let record = manager
            .submit("OrderService", "place", &(), || async { Ok("OK") })
            .await
            .unwrap();

        let done = finish(&manager, &record.execution_id).await;
        assert_eq!(done.status, ExecutionStatus::Success);
        assert_eq!(done.result_encoded.as_deref(), Some(r#""OK""#));
        assert_eq!(store.failed(), 1);
        assert_eq!(manager.metrics().succeeded(), 1);
    }

    #[tokio::test]
    async fn test_unwritable_result_is_recorded_as_failure() {
        let store = Arc::new(FlakyStore::failing_into(ExecutionStatus::Success, usize::MAX));
        let manager = flaky_manager(store.clone());
        let record = manager
            .submit("OrderService", "place", &(), || async { Ok("OK") })
            .await
            .unwrap();

        let done = finish(&manager, &record.execution_id).await;
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert!(done
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("failed to record result"));
        assert!(done.result_encoded.is_none());
        // First attempt plus every retry
        assert_eq!(store.failed(), 4);
    }

    #[tokio::test]
    async fn test_start_failure_cancels_without_running_work() {
        let store = Arc::new(FlakyStore::failing_into(ExecutionStatus::Running, usize::MAX));
        let manager = flaky_manager(store.clone());
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        let record = manager
            .submit("OrderService", "place", &(), move || async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        let done = finish(&manager, &record.execution_id).await;
        assert_eq!(done.status, ExecutionStatus::Cancelled);
        assert_eq!(
            done.metadata.get(CANCEL_REASON_KEY).map(String::as_str),
            Some(CANCEL_START_FAILED)
        );
        assert!(done.start_time.is_none());
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(manager.metrics().cancelled(), 1);
    }

    #[tokio::test]
    async fn test_start_succeeds_after_transient_error() {
        let store = Arc::new(FlakyStore::failing_into(ExecutionStatus::Running, 2));
        let manager = flaky_manager(store.clone());
        let record = manager
            .submit("OrderService", "place", &(), || async { Ok(7) })
            .await
            .unwrap();

        let done = finish(&manager, &record.execution_id).await;
        assert_eq!(done.status, ExecutionStatus::Success);
        assert!(!done.metadata.contains_key(CANCEL_REASON_KEY));
        assert_eq!(store.failed(), 2);
    }
}
