//! Configuration loading
//!
//! Two layers, applied in order:
//!
//! 1. `load_environment()` reads a `KEY=VALUE` environment file
//!    (`/etc/op-exec/environment`, then `.env`) without overriding
//!    variables that are already set.
//! 2. `Settings::load()` reads an optional TOML file and then `OPX_`
//!    environment overrides (`OPX_EXECUTOR__MAX_CONCURRENT=32`).
//!
//! ```rust,no_run
//! use op_core::config::{load_environment, Settings};
//!
//! load_environment();
//! let settings = Settings::load(Some("config/op-exec.toml")).unwrap();
//! assert!(settings.executor.max_concurrent > 0);
//! ```

use config::{Config, Environment, File};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Environment files to check (in order of priority)
pub const ENV_FILE_PATHS: &[&str] = &["/etc/op-exec/environment", ".env"];

/// Prefix for environment overrides of `Settings`
pub const ENV_PREFIX: &str = "OPX";

/// Load environment variables from the first environment file found.
///
/// `OP_EXEC_ENV_FILE` takes precedence over the default paths. Existing
/// variables are never overridden. Returns the path that was loaded.
pub fn load_environment() -> Option<String> {
    if let Ok(custom_path) = std::env::var("OP_EXEC_ENV_FILE") {
        if let Some(path) = try_load_env_file(&custom_path) {
            return Some(path);
        }
    }

    for path in ENV_FILE_PATHS {
        if let Some(loaded_path) = try_load_env_file(path) {
            return Some(loaded_path);
        }
    }

    debug!("No environment file found, using existing environment");
    None
}

fn try_load_env_file(path: &str) -> Option<String> {
    let path_obj = Path::new(path);
    if !path_obj.exists() {
        return None;
    }

    match fs::read_to_string(path_obj) {
        Ok(content) => {
            let mut loaded = 0;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = parse_env_line(line) {
                    if std::env::var(&key).is_err() {
                        std::env::set_var(&key, &value);
                        loaded += 1;
                    }
                }
            }
            info!("Loaded {} environment variables from {}", loaded, path);
            Some(path.to_string())
        }
        Err(e) => {
            warn!("Failed to read environment file {}: {}", path, e);
            None
        }
    }
}

/// Parse `KEY=VALUE`, `KEY="VALUE"` or `KEY='VALUE'`.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    let value = value.trim();

    if key.is_empty() {
        return None;
    }

    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);

    Some((key.to_string(), value.to_string()))
}

/// Top-level service settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub service: ServiceSettings,
    pub executor: ExecutorSettings,
    pub storage: StorageSettings,
    pub failure: FailureSettings,
    pub timeout: TimeoutSettings,
    pub cleanup: CleanupSettings,
}

impl Settings {
    /// Load settings from an optional TOML file plus `OPX_` overrides.
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.executor.max_concurrent == 0 {
            return Err(Error::invalid_argument("executor.max_concurrent must be > 0"));
        }
        if self.timeout.enabled && self.timeout.deadline_secs == 0 {
            return Err(Error::invalid_argument("timeout.deadline_secs must be > 0"));
        }
        if self.timeout.enabled && self.timeout.scan_interval_secs == 0 {
            return Err(Error::invalid_argument("timeout.scan_interval_secs must be > 0"));
        }
        if self.cleanup.enabled && self.cleanup.interval_secs == 0 {
            return Err(Error::invalid_argument("cleanup.interval_secs must be > 0"));
        }
        if self.storage.kind == StorageKind::Sqlite && self.storage.sqlite_url.is_empty() {
            return Err(Error::invalid_argument("storage.sqlite_url is required for sqlite"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub name: String,
    pub log_format: LogFormat,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "op-exec-service".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Work items allowed to run at once
    pub max_concurrent: usize,
    /// Work items allowed to wait for a free slot before submissions are rejected
    pub queue_capacity: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            queue_capacity: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    #[serde(rename = "type")]
    pub kind: StorageKind,
    pub sqlite_url: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            kind: StorageKind::Memory,
            sqlite_url: "sqlite://op-exec.db?mode=rwc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FailureSettings {
    /// Upper bound, in bytes, for the captured error stack
    pub max_error_stack_len: usize,
}

impl Default for FailureSettings {
    fn default() -> Self {
        Self {
            max_error_stack_len: 4000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub enabled: bool,
    pub deadline_secs: u64,
    pub scan_interval_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            deadline_secs: 300,
            scan_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupSettings {
    pub enabled: bool,
    pub retention_days: u32,
    pub interval_secs: u64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 7,
            interval_secs: 3600,
        }
    }
}
