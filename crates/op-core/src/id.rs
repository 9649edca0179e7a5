//! Execution identity generation
//!
//! Ids are opaque strings. The only promise is uniqueness for the life of
//! the process; nothing may rely on their ordering.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Produces unique execution identifiers
pub trait IdGenerator: Send + Sync {
    fn new_id(&self) -> String;
}

/// Random 128-bit ids rendered as 32 lowercase hex characters
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn new_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}

/// Deterministic `prefix-N` ids, for tests and reproducible demos
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn new_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}
