//! OP Execution Tracker - Asynchronous Execution Engine
//!
//! Accepts a unit of work, hands it to a background worker without blocking
//! the caller, and tracks its lifecycle in an [`ExecutionStore`]:
//! - `submit` persists a `PENDING` record and schedules the work
//! - the worker claims the record (`PENDING -> RUNNING`), runs the work and
//!   records the outcome (`SUCCESS` / `FAILED`)
//! - `get_execution`, `envelope` and `fetch_result` poll the record
//! - `cancel` succeeds only while the record is still `PENDING`
//!
//! Running work is never interrupted. [`TimeoutMonitor`] is the optional
//! supervisor that marks overdue `RUNNING` records `TIMEOUT`;
//! [`RetentionSweeper`] removes old finished records.
//!
//! [`ExecutionStore`]: op_state_store::ExecutionStore

pub mod envelope;
pub mod error;
pub mod execution_manager;
pub mod executor;
pub mod failure;
pub mod metrics;
pub mod retention;
pub mod telemetry;
pub mod timeout_monitor;

#[cfg(test)]
mod test_support;

pub use envelope::{ExecutionView, ResultEnvelope};
pub use error::{ExecutionError, Result};
pub use execution_manager::{ExecutionManager, ManagerConfig};
pub use executor::{ExecutorConfig, ExecutorError, Task, TokioWorkExecutor, WorkExecutor};
pub use failure::WorkFailure;
pub use metrics::ExecutionMetrics;
pub use retention::RetentionSweeper;
pub use telemetry::ExecutionTelemetry;
pub use timeout_monitor::TimeoutMonitor;

pub use op_state_store::{ExecutionRecord, ExecutionStatus};
