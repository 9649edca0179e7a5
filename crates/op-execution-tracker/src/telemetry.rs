use tracing::{info, instrument, warn};

use op_state_store::{ExecutionRecord, ExecutionStatus};

/// Lifecycle events for executions, emitted through `tracing`
pub struct ExecutionTelemetry {
    /// Service name attached to every event
    service_name: String,
}

impl ExecutionTelemetry {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    #[instrument(skip(self, record), fields(
        execution_id = %record.execution_id,
        target = %record.target_name,
        operation = %record.operation_name,
        service = %self.service_name
    ))]
    pub fn submitted(&self, record: &ExecutionRecord) {
        info!(metadata = ?record.metadata, "Execution submitted");
    }

    #[instrument(skip(self, record), fields(
        execution_id = %record.execution_id,
        target = %record.target_name,
        operation = %record.operation_name,
        service = %self.service_name
    ))]
    pub fn started(&self, record: &ExecutionRecord) {
        info!(start_time = ?record.start_time, "Execution started");
    }

    #[instrument(skip(self, record), fields(
        execution_id = %record.execution_id,
        target = %record.target_name,
        operation = %record.operation_name,
        status = %record.status,
        service = %self.service_name
    ))]
    pub fn finished(&self, record: &ExecutionRecord) {
        match record.status {
            ExecutionStatus::Success => {
                info!(duration_ms = ?record.duration_ms(), "Execution completed successfully")
            }
            ExecutionStatus::Cancelled => info!("Execution cancelled"),
            _ => warn!(
                duration_ms = ?record.duration_ms(),
                error = ?record.error_message,
                "Execution did not succeed"
            ),
        }
    }

    #[instrument(skip(self), fields(service = %self.service_name))]
    pub fn outcome_discarded(&self, execution_id: &str, status: ExecutionStatus) {
        warn!(
            execution_id = %execution_id,
            status = %status,
            "Execution left RUNNING before its work finished; outcome discarded"
        );
    }
}

impl Default for ExecutionTelemetry {
    fn default() -> Self {
        Self::new("op-exec")
    }
}
