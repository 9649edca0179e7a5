//! OP State Store - Execution Record Persistence
//!
//! Stores one record per submitted unit of work and moves it through the
//! execution state machine:
//!
//! ```text
//! PENDING --start--> RUNNING --succeed--> SUCCESS
//!    |                  |-----fail-----> FAILED
//!    |                  `----timeout---> TIMEOUT
//!    `------cancel----> CANCELLED
//! ```
//!
//! Every status change goes through [`ExecutionStore::compare_and_transition`],
//! which checks the current status and applies the change as one atomic step.
//!
//! Backends:
//! - [`MemoryStore`]: process-local map
//! - [`SqliteStore`]: SQLx/SQLite table
//!
//! Store operations are timed and counted through the Prometheus metrics in
//! [`metrics`].

pub mod error;
pub mod execution_record;
pub mod execution_store;
pub mod memory_store;
pub mod metrics;
pub mod sqlite_store;

#[cfg(test)]
mod store_tests;

pub use error::{Result, StateStoreError};
pub use execution_record::{record_now, ExecutionRecord, ExecutionStatus};
pub use execution_store::{mutation, ExecutionStore, RecordMutation, StatusCounts};
pub use memory_store::MemoryStore;
pub use sqlite_store::SqliteStore;
