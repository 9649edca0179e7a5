//! Prometheus metrics for execution store operations
//!
//! Provides observability into store operations including:
//! - Operation latencies by backend
//! - Error rates by error kind
//! - Status transitions and lost compare-and-transition races
//! - Record counts by status

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Once;
use tracing::{info, warn};

use crate::execution_store::StatusCounts;
use crate::execution_record::ExecutionStatus;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Records written through `save`
    pub static ref RECORDS_SAVED_TOTAL: Counter = Counter::new(
        "op_store_records_saved_total",
        "Total number of execution records saved"
    ).unwrap();

    /// Records removed by retention
    pub static ref RECORDS_DELETED_TOTAL: Counter = Counter::new(
        "op_store_records_deleted_total",
        "Total number of execution records deleted by retention"
    ).unwrap();

    /// Records by status, as of the last count
    pub static ref RECORDS_BY_STATUS: GaugeVec = GaugeVec::new(
        Opts::new("op_store_records_by_status", "Number of execution records by status"),
        &["status"]
    ).unwrap();

    /// Successful status transitions
    pub static ref STATUS_TRANSITIONS: CounterVec = CounterVec::new(
        Opts::new("op_store_transitions_total", "Execution status transitions"),
        &["from_status", "to_status"]
    ).unwrap();

    /// Compare-and-transition attempts that found a different status
    pub static ref STALE_TRANSITIONS: CounterVec = CounterVec::new(
        Opts::new(
            "op_store_stale_transitions_total",
            "Transitions rejected because the expected status no longer held"
        ),
        &["expected_status", "to_status"]
    ).unwrap();

    /// Store operation latency
    pub static ref STORE_OP_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("op_store_operation_seconds", "Store operation duration")
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["operation", "store_type"]
    ).unwrap();

    /// Store operation errors
    pub static ref STORE_OP_ERRORS: CounterVec = CounterVec::new(
        Opts::new("op_store_errors_total", "Store operation errors"),
        &["operation", "store_type", "error_type"]
    ).unwrap();
}

static INIT: Once = Once::new();

/// Register all metrics with the global registry
pub fn register_metrics() {
    INIT.call_once(|| {
        info!("Registering execution store metrics");

        REGISTRY.register(Box::new(RECORDS_SAVED_TOTAL.clone())).ok();
        REGISTRY.register(Box::new(RECORDS_DELETED_TOTAL.clone())).ok();
        REGISTRY.register(Box::new(RECORDS_BY_STATUS.clone())).ok();
        REGISTRY.register(Box::new(STATUS_TRANSITIONS.clone())).ok();
        REGISTRY.register(Box::new(STALE_TRANSITIONS.clone())).ok();
        REGISTRY.register(Box::new(STORE_OP_DURATION.clone())).ok();
        REGISTRY.register(Box::new(STORE_OP_ERRORS.clone())).ok();
    });
}

/// Helper to time a store operation
pub struct OperationTimer {
    operation: &'static str,
    store_type: &'static str,
    start: std::time::Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str, store_type: &'static str) -> Self {
        Self {
            operation,
            store_type,
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        STORE_OP_DURATION
            .with_label_values(&[self.operation, self.store_type])
            .observe(duration);
    }
}

pub fn record_save() {
    RECORDS_SAVED_TOTAL.inc();
}

pub fn record_deleted(count: u64) {
    RECORDS_DELETED_TOTAL.inc_by(count as f64);
}

pub fn record_transition(from: ExecutionStatus, to: ExecutionStatus) {
    STATUS_TRANSITIONS
        .with_label_values(&[from.as_str(), to.as_str()])
        .inc();
}

pub fn record_stale_transition(expected: ExecutionStatus, to: ExecutionStatus) {
    STALE_TRANSITIONS
        .with_label_values(&[expected.as_str(), to.as_str()])
        .inc();
}

pub fn record_store_error(operation: &str, store_type: &str, error_type: &str) {
    STORE_OP_ERRORS
        .with_label_values(&[operation, store_type, error_type])
        .inc();
}

pub fn update_status_counts(counts: &StatusCounts) {
    for status in ExecutionStatus::ALL {
        RECORDS_BY_STATUS
            .with_label_values(&[status.as_str()])
            .set(counts.get(status) as f64);
    }
}

/// Get metrics as text for Prometheus scraping
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode store metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics() {
        register_metrics();
        // Should not panic on duplicate registration
        register_metrics();
    }

    #[test]
    fn test_operation_timer() {
        register_metrics();
        {
            let _timer = OperationTimer::new("save", "memory");
        }
        let count = STORE_OP_DURATION
            .with_label_values(&["save", "memory"])
            .get_sample_count();
        assert!(count >= 1);
    }

    #[test]
    fn test_gather_includes_transitions() {
        register_metrics();
        record_transition(ExecutionStatus::Pending, ExecutionStatus::Running);
        record_stale_transition(ExecutionStatus::Pending, ExecutionStatus::Cancelled);

        let text = gather_metrics();
        assert!(text.contains("op_store_transitions_total"));
        assert!(text.contains("op_store_stale_transitions_total"));
    }
}
