//! Core types and utilities for op-exec
//!
//! # Modules
//!
//! - `codec`: Payload serialization used for execution arguments and results
//! - `config`: Environment loading and typed service settings
//! - `error`: Error types and Result alias
//! - `id`: Execution identity generation

pub mod codec;
pub mod config;
pub mod error;
pub mod id;

// Re-exports
pub use codec::{JsonCodec, PayloadCodec};
pub use config::Settings;
pub use error::{Error, Result};
pub use id::{IdGenerator, SequentialIdGenerator, UuidIdGenerator};
