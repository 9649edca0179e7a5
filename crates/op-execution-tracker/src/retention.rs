use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use op_core::config::CleanupSettings;
use op_state_store::{ExecutionStore, StateStoreError};

/// Periodically removes finished executions older than the retention window
pub struct RetentionSweeper {
    store: Arc<dyn ExecutionStore>,
    retention: Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn ExecutionStore>, retention: Duration, interval: Duration) -> Self {
        Self {
            store,
            retention,
            interval,
        }
    }

    pub fn from_settings(store: Arc<dyn ExecutionStore>, settings: &CleanupSettings) -> Self {
        Self::new(
            store,
            Duration::from_secs(u64::from(settings.retention_days) * 24 * 60 * 60),
            Duration::from_secs(settings.interval_secs),
        )
    }

    /// One sweep. Returns the number of records removed.
    pub async fn run_once(&self) -> Result<u64, StateStoreError> {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return Ok(0);
        };
        let cutoff = Utc::now() - retention;
        let deleted = self.store.delete_finished_before(cutoff).await?;
        if deleted > 0 {
            info!(
                deleted,
                cutoff = %cutoff,
                store_type = self.store.store_type(),
                "Removed expired executions"
            );
        }
        Ok(deleted)
    }

    /// Sweep every interval until the handle is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            retention_secs = self.retention.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Starting retention sweeper"
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(e) = self.run_once().await {
                    warn!(error = %e, "Retention sweep failed");
                }
            }
        })
    }
}
