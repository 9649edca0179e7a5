//! Payload codec for execution arguments and results
//!
//! Payloads are carried as opaque strings on the execution record. The codec
//! works on `serde_json::Value` so it stays object safe; typed conversion
//! happens at the call site through serde.

use crate::error::{Error, Result};
use serde_json::Value;

/// Encodes and decodes opaque payloads
pub trait PayloadCodec: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    fn encode(&self, value: &Value) -> Result<String>;

    fn decode(&self, encoded: &str) -> Result<Value>;
}

/// Compact JSON codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode(&self, encoded: &str) -> Result<Value> {
        serde_json::from_str(encoded)
            .map_err(|e| Error::codec(format!("invalid JSON payload: {}", e)))
    }
}
