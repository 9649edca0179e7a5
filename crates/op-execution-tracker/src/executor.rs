//! Work executor with concurrency and queue limits

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info};

/// A scheduled unit of work
pub type Task = BoxFuture<'static, ()>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("executor queue is full ({0} tasks in flight)")]
    QueueFull(usize),
    #[error("executor is shut down")]
    Shutdown,
}

/// Fire-and-forget scheduling onto a concurrent pool.
///
/// `execute` must not wait for the task; an `Err` means the task was
/// dropped without running.
pub trait WorkExecutor: Send + Sync {
    fn execute(&self, task: Task) -> Result<(), ExecutorError>;
}

/// Configuration for the tokio executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum tasks running at once
    pub max_concurrent: usize,
    /// Maximum tasks waiting for a free slot
    pub queue_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            queue_capacity: 200,
        }
    }
}

impl From<&op_core::config::ExecutorSettings> for ExecutorConfig {
    fn from(settings: &op_core::config::ExecutorSettings) -> Self {
        Self {
            max_concurrent: settings.max_concurrent,
            queue_capacity: settings.queue_capacity,
        }
    }
}

/// Runs tasks on the tokio runtime, at most `max_concurrent` at a time.
///
/// Must be used from within a tokio runtime.
pub struct TokioWorkExecutor {
    config: ExecutorConfig,
    semaphore: Arc<Semaphore>,
    /// Tasks accepted and not yet finished (waiting + running)
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    closed: AtomicBool,
}

impl TokioWorkExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        info!(
            max_concurrent = config.max_concurrent,
            queue_capacity = config.queue_capacity,
            "Configured work executor"
        );
        Self {
            config,
            semaphore,
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ExecutorConfig::default())
    }

    /// Tasks currently running
    pub fn active(&self) -> usize {
        self.config.max_concurrent - self.semaphore.available_permits()
    }

    /// Tasks accepted but still waiting for a slot
    pub fn queued(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst).saturating_sub(self.active())
    }

    /// Stop accepting tasks. Tasks already accepted still run.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        info!("Work executor shut down; draining {} tasks", self.in_flight.load(Ordering::SeqCst));
    }

    /// Wait until every accepted task has finished
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Releases an in-flight slot when the task finishes or unwinds
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl WorkExecutor for TokioWorkExecutor {
    fn execute(&self, task: Task) -> Result<(), ExecutorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExecutorError::Shutdown);
        }

        let limit = self.config.max_concurrent + self.config.queue_capacity;
        let reserved = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1));
        if let Err(current) = reserved {
            return Err(ExecutorError::QueueFull(current));
        }

        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            idle: self.idle.clone(),
        };
        let semaphore = self.semaphore.clone();

        tokio::spawn(async move {
            let _guard = guard;
            // The semaphore is never closed, so acquire only fails if it were.
            let Ok(_permit) = semaphore.acquire_owned().await else {
                debug!("Executor semaphore closed; task dropped");
                return;
            };
            task.await;
        });

        Ok(())
    }
}
