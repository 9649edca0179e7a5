use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use tracing::warn;

/// Execution metrics collector
#[derive(Clone)]
pub struct ExecutionMetrics {
    /// Records accepted by `submit`
    executions_submitted: IntCounter,

    /// Records claimed by a worker
    executions_started: IntCounter,

    /// Work currently running
    active_executions: IntGauge,

    executions_succeeded: IntCounter,

    executions_failed: IntCounter,

    executions_cancelled: IntCounter,

    executions_timed_out: IntCounter,

    /// Submissions the executor refused
    executions_rejected: IntCounter,

    /// Workers that found their record no longer pending
    executions_skipped: IntCounter,

    /// Outcomes dropped because the record left RUNNING first
    results_discarded: IntCounter,

    /// Payloads that could not be encoded, by kind
    encoding_failures: IntCounterVec,

    /// Execution duration histogram
    execution_duration: Histogram,

    registry: Registry,
}

impl ExecutionMetrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let executions_submitted = IntCounter::new(
            "op_executions_submitted_total",
            "Total number of executions submitted",
        )?;
        registry.register(Box::new(executions_submitted.clone()))?;

        let executions_started = IntCounter::new(
            "op_executions_started_total",
            "Total number of executions claimed by a worker",
        )?;
        registry.register(Box::new(executions_started.clone()))?;

        let active_executions = IntGauge::new(
            "op_active_executions",
            "Number of executions currently running",
        )?;
        registry.register(Box::new(active_executions.clone()))?;

        let executions_succeeded = IntCounter::new(
            "op_executions_succeeded_total",
            "Total number of executions that finished successfully",
        )?;
        registry.register(Box::new(executions_succeeded.clone()))?;

        let executions_failed = IntCounter::new(
            "op_executions_failed_total",
            "Total number of executions whose work failed",
        )?;
        registry.register(Box::new(executions_failed.clone()))?;

        let executions_cancelled = IntCounter::new(
            "op_executions_cancelled_total",
            "Total number of executions cancelled before starting",
        )?;
        registry.register(Box::new(executions_cancelled.clone()))?;

        let executions_timed_out = IntCounter::new(
            "op_executions_timed_out_total",
            "Total number of executions marked as timed out",
        )?;
        registry.register(Box::new(executions_timed_out.clone()))?;

        let executions_rejected = IntCounter::new(
            "op_executions_rejected_total",
            "Total number of submissions rejected by the executor",
        )?;
        registry.register(Box::new(executions_rejected.clone()))?;

        let executions_skipped = IntCounter::new(
            "op_executions_skipped_total",
            "Total number of scheduled executions skipped because they were no longer pending",
        )?;
        registry.register(Box::new(executions_skipped.clone()))?;

        let results_discarded = IntCounter::new(
            "op_execution_results_discarded_total",
            "Total number of outcomes discarded because the execution left RUNNING first",
        )?;
        registry.register(Box::new(results_discarded.clone()))?;

        let encoding_failures = IntCounterVec::new(
            Opts::new(
                "op_execution_encoding_failures_total",
                "Payloads that could not be encoded",
            ),
            &["payload"],
        )?;
        registry.register(Box::new(encoding_failures.clone()))?;

        let execution_duration = Histogram::with_opts(
            HistogramOpts::new(
                "op_execution_duration_seconds",
                "Execution duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        )?;
        registry.register(Box::new(execution_duration.clone()))?;

        Ok(Self {
            executions_submitted,
            executions_started,
            active_executions,
            executions_succeeded,
            executions_failed,
            executions_cancelled,
            executions_timed_out,
            executions_rejected,
            executions_skipped,
            results_discarded,
            encoding_failures,
            execution_duration,
            registry,
        })
    }

    pub fn execution_submitted(&self) {
        self.executions_submitted.inc();
    }

    pub fn execution_started(&self) {
        self.executions_started.inc();
        self.active_executions.inc();
    }

    pub fn execution_succeeded(&self, duration_ms: Option<u64>) {
        self.executions_succeeded.inc();
        self.observe_duration(duration_ms);
    }

    pub fn execution_failed(&self, duration_ms: Option<u64>) {
        self.executions_failed.inc();
        self.observe_duration(duration_ms);
    }

    pub fn execution_cancelled(&self) {
        self.executions_cancelled.inc();
    }

    /// A RUNNING record was moved to TIMEOUT by a supervisor. The work keeps
    /// running, so the active gauge is left to the worker.
    pub fn execution_timed_out(&self) {
        self.executions_timed_out.inc();
    }

    pub fn execution_rejected(&self) {
        self.executions_rejected.inc();
    }

    pub fn execution_skipped(&self) {
        self.executions_skipped.inc();
    }

    pub fn result_discarded(&self) {
        self.results_discarded.inc();
    }

    /// The worker is done with its work, whatever became of the record
    pub fn work_finished(&self) {
        self.active_executions.dec();
    }

    pub fn encoding_failed(&self, payload: &str) {
        self.encoding_failures.with_label_values(&[payload]).inc();
    }

    fn observe_duration(&self, duration_ms: Option<u64>) {
        if let Some(ms) = duration_ms {
            self.execution_duration.observe(ms as f64 / 1000.0);
        }
    }

    pub fn submitted(&self) -> u64 {
        self.executions_submitted.get()
    }

    pub fn succeeded(&self) -> u64 {
        self.executions_succeeded.get()
    }

    pub fn failed(&self) -> u64 {
        self.executions_failed.get()
    }

    pub fn cancelled(&self) -> u64 {
        self.executions_cancelled.get()
    }

    pub fn timed_out(&self) -> u64 {
        self.executions_timed_out.get()
    }

    pub fn rejected(&self) -> u64 {
        self.executions_rejected.get()
    }

    pub fn discarded(&self) -> u64 {
        self.results_discarded.get()
    }

    pub fn active(&self) -> i64 {
        self.active_executions.get()
    }

    pub fn encoding_failures(&self, payload: &str) -> u64 {
        self.encoding_failures.with_label_values(&[payload]).get()
    }

    /// Get metrics registry for scraping
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of this collector's metrics
    pub fn gather_text(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!("Failed to encode execution metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for ExecutionMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
