use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Submitted, waiting for a worker
    Pending,
    /// A worker has claimed the record and is running the work
    Running,
    /// Work returned normally
    Success,
    /// Work returned an error or panicked
    Failed,
    /// Cancelled before a worker claimed it
    Cancelled,
    /// Marked by a supervisor after exceeding its deadline
    Timeout,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 6] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Running,
        ExecutionStatus::Success,
        ExecutionStatus::Failed,
        ExecutionStatus::Cancelled,
        ExecutionStatus::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
            ExecutionStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Timeout)
        )
    }

    /// Statuses that carry `error_message` / `error_stack`
    pub fn carries_error(&self) -> bool {
        matches!(self, ExecutionStatus::Failed | ExecutionStatus::Timeout)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown execution status: {}", s))
    }
}

/// Persisted lifecycle of one submitted unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Opaque unique id, the only way to address the record
    pub execution_id: String,
    /// What was invoked (observability only)
    pub target_name: String,
    pub operation_name: String,
    pub status: ExecutionStatus,
    pub arguments_encoded: Option<String>,
    pub result_encoded: Option<String>,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    /// Caller-supplied tags
    pub metadata: HashMap<String, String>,
}

/// Current time at the microsecond precision every store keeps
pub fn record_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

impl ExecutionRecord {
    /// Create a new record in `PENDING`
    pub fn new(execution_id: String, target_name: &str, operation_name: &str) -> Self {
        Self {
            execution_id,
            target_name: target_name.to_string(),
            operation_name: operation_name.to_string(),
            status: ExecutionStatus::Pending,
            arguments_encoded: None,
            result_encoded: None,
            create_time: record_now(),
            start_time: None,
            finish_time: None,
            error_message: None,
            error_stack: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_arguments(mut self, arguments_encoded: String) -> Self {
        self.arguments_encoded = Some(arguments_encoded);
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall time between start and finish, when both are known
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.start_time, self.finish_time) {
            (Some(start), Some(finish)) => Some((finish - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }

    /// Apply a status change the caller has already validated.
    ///
    /// Runs `mutate`, then restores the fields that never change after
    /// creation, sets `next`, and normalizes timestamps: `start_time` and
    /// `finish_time` are set once, `finish_time` only on terminal statuses,
    /// and `create_time <= start_time <= finish_time` holds afterwards.
    /// Error fields are dropped unless `next` carries an error.
    pub fn apply_transition<F>(&mut self, next: ExecutionStatus, mutate: F, now: DateTime<Utc>)
    where
        F: FnOnce(&mut ExecutionRecord),
    {
        let execution_id = self.execution_id.clone();
        let target_name = self.target_name.clone();
        let operation_name = self.operation_name.clone();
        let create_time = self.create_time;
        let prior_start = self.start_time;
        let prior_finish = self.finish_time;

        mutate(self);

        self.execution_id = execution_id;
        self.target_name = target_name;
        self.operation_name = operation_name;
        self.create_time = create_time;
        self.status = next;

        if prior_start.is_some() {
            self.start_time = prior_start;
        } else if next == ExecutionStatus::Running && self.start_time.is_none() {
            self.start_time = Some(now);
        }
        if prior_finish.is_some() {
            self.finish_time = prior_finish;
        }

        if next.is_terminal() {
            if self.finish_time.is_none() {
                self.finish_time = Some(now);
            }
        } else {
            self.finish_time = None;
        }

        if !next.carries_error() {
            self.error_message = None;
            self.error_stack = None;
        }

        // Clock skew must not produce a start before creation or a finish before start.
        if let Some(start) = self.start_time {
            self.start_time = Some(start.max(create_time));
        }
        if let Some(finish) = self.finish_time {
            let floor = self.start_time.unwrap_or(create_time);
            self.finish_time = Some(finish.max(floor));
        }
    }
}
