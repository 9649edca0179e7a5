use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use op_core::config::TimeoutSettings;
use op_state_store::{ExecutionStatus, ExecutionStore, RecordMutation, StateStoreError};

use crate::metrics::ExecutionMetrics;

/// Marks `RUNNING` executions that outlive their deadline as `TIMEOUT`.
///
/// The work itself is not interrupted. When it eventually returns, its
/// `RUNNING -> SUCCESS/FAILED` transition loses the race and the outcome is
/// dropped.
pub struct TimeoutMonitor {
    store: Arc<dyn ExecutionStore>,
    deadline: Duration,
    scan_interval: Duration,
    metrics: Option<ExecutionMetrics>,
}

impl TimeoutMonitor {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        deadline: Duration,
        scan_interval: Duration,
    ) -> Self {
        Self {
            store,
            deadline,
            scan_interval,
            metrics: None,
        }
    }

    pub fn from_settings(store: Arc<dyn ExecutionStore>, settings: &TimeoutSettings) -> Self {
        Self::new(
            store,
            Duration::from_secs(settings.deadline_secs),
            Duration::from_secs(settings.scan_interval_secs),
        )
    }

    pub fn with_metrics(mut self, metrics: ExecutionMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// One scan. Returns how many executions were moved to `TIMEOUT`.
    ///
    /// A store error on one record does not stop the scan. The first such
    /// error is returned once every overdue record has been tried.
    pub async fn run_once(&self) -> Result<usize, StateStoreError> {
        let Ok(deadline) = chrono::Duration::from_std(self.deadline) else {
            return Ok(0);
        };
        let cutoff = Utc::now() - deadline;
        let running = self
            .store
            .list_by_status(ExecutionStatus::Running, 0)
            .await?;

        let mut timed_out = 0;
        let mut failed = 0;
        let mut first_error = None;
        for record in running {
            let started = record.start_time.unwrap_or(record.create_time);
            if started >= cutoff {
                continue;
            }

            let message = format!("execution exceeded deadline of {}s", self.deadline.as_secs());
            let mutate: RecordMutation = Box::new(move |r| r.error_message = Some(message));
            match self
                .store
                .compare_and_transition(
                    &record.execution_id,
                    ExecutionStatus::Running,
                    ExecutionStatus::Timeout,
                    mutate,
                )
                .await
            {
                Ok(_) => {
                    timed_out += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.execution_timed_out();
                    }
                    warn!(
                        execution_id = %record.execution_id,
                        target = %record.target_name,
                        operation = %record.operation_name,
                        "Execution timed out"
                    );
                }
                // Finished between the scan and the transition
                Err(StateStoreError::StaleState { actual, .. }) => {
                    debug!(
                        execution_id = %record.execution_id,
                        status = %actual,
                        "Execution finished before timeout"
                    )
                }
                Err(StateStoreError::NotFound(_)) => {}
                Err(e) => {
                    warn!(
                        execution_id = %record.execution_id,
                        error = %e,
                        "Failed to time out execution"
                    );
                    failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => {
                warn!(timed_out, failed, "Timeout scan finished with errors");
                Err(e)
            }
            None => Ok(timed_out),
        }
    }

    /// Run `run_once` every scan interval until the handle is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            deadline_secs = self.deadline.as_secs(),
            scan_interval_secs = self.scan_interval.as_secs(),
            "Starting timeout monitor"
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.scan_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match self.run_once().await {
                    Ok(0) => {}
                    Ok(n) => info!(timed_out = n, "Timeout scan complete"),
                    Err(e) => warn!(error = %e, "Timeout scan failed"),
                }
            }
        })
    }
}
