//! Platform configuration.
//!
//! Loaded from a TOML file. Credentials may be overridden from the
//! environment (`HSB_EMAIL`, `HSB_PASSWORD`) so they need not live in the
//! file.
//!
//! ```toml
//! email = "user@example.com"
//! password = "secret"
//! debug = false
//! poll_interval_secs = 30
//! request_timeout_ms = 5000
//!
//! [worker]
//! interpreter = "vendor/python/.venv/bin/python"
//! script = "vendor/python/hubspace_cli.py"
//! required_modules = ["requests"]
//! terminate_grace_ms = 3000
//! preflight_timeout_ms = 30000
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "HSB_CONFIG";

/// Environment variable overriding the account email.
pub const EMAIL_ENV: &str = "HSB_EMAIL";

/// Environment variable overriding the account password.
pub const PASSWORD_ENV: &str = "HSB_PASSWORD";

/// Default reconciliation interval in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Default per-request timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Default time the worker gets to exit after SIGTERM.
pub const DEFAULT_TERMINATE_GRACE_MS: u64 = 3_000;

/// Default limit for each preflight check.
pub const DEFAULT_PREFLIGHT_TIMEOUT_MS: u64 = 30_000;

/// Longest accepted reconciliation interval (one day).
pub const MAX_POLL_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Longest accepted per-request timeout (ten minutes).
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 10 * 60 * 1_000;

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("failed to read config {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("failed to parse config {path}: {error}")]
    Parse { path: PathBuf, error: String },
}

// ============================================================================
// Config structs
// ============================================================================

/// Top-level platform configuration.
#[derive(Clone, Deserialize, Serialize)]
pub struct PlatformConfig {
    /// Hubspace account email.
    #[serde(default)]
    pub email: String,

    /// Hubspace account password.
    #[serde(default)]
    pub password: String,

    /// Enables debug-level logging for the bridge crates.
    #[serde(default)]
    pub debug: bool,

    /// Seconds between reconciliation polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Milliseconds to wait for each worker reply.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Worker process settings.
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// How to find and run the worker process.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Interpreter used to run the worker script.
    #[serde(default = "default_interpreter")]
    pub interpreter: PathBuf,

    /// Worker script path.
    #[serde(default = "default_script")]
    pub script: PathBuf,

    /// Modules that must import cleanly before the worker is started.
    #[serde(default = "default_required_modules")]
    pub required_modules: Vec<String>,

    /// Milliseconds between SIGTERM and a forced kill on shutdown.
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,

    /// Milliseconds each preflight check may run before it is killed.
    #[serde(default = "default_preflight_timeout_ms")]
    pub preflight_timeout_ms: u64,
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}
fn default_terminate_grace_ms() -> u64 {
    DEFAULT_TERMINATE_GRACE_MS
}
fn default_preflight_timeout_ms() -> u64 {
    DEFAULT_PREFLIGHT_TIMEOUT_MS
}
fn default_interpreter() -> PathBuf {
    PathBuf::from("vendor/python/.venv/bin/python")
}
fn default_script() -> PathBuf {
    PathBuf::from("vendor/python/hubspace_cli.py")
}
fn default_required_modules() -> Vec<String> {
    vec!["requests".to_string()]
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            script: default_script(),
            required_modules: default_required_modules(),
            terminate_grace_ms: default_terminate_grace_ms(),
            preflight_timeout_ms: default_preflight_timeout_ms(),
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            password: String::new(),
            debug: false,
            poll_interval_secs: default_poll_interval_secs(),
            request_timeout_ms: default_request_timeout_ms(),
            worker: WorkerConfig::default(),
        }
    }
}

// Keeps the password out of `{:?}` output.
impl fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("debug", &self.debug)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("worker", &self.worker)
            .finish()
    }
}

impl PlatformConfig {
    /// Reconciliation interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// `ConfigError::Parse` if the text is not valid for this schema.
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Reads and parses the file and applies environment overrides,
    /// without validating.
    ///
    /// # Errors
    ///
    /// `ConfigError::Read` or `ConfigError::Parse`.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let mut config = Self::from_toml(&text, path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reads, applies environment overrides, and validates.
    ///
    /// # Errors
    ///
    /// Any `ConfigError` from reading, parsing or validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Replaces credentials with `HSB_EMAIL` / `HSB_PASSWORD` when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(email) = std::env::var(EMAIL_ENV) {
            self.email = email;
        }
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            self.password = password;
        }
    }

    /// Checks that the platform can start with this configuration.
    ///
    /// # Errors
    ///
    /// `ConfigError::Validation` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.email.trim().is_empty() {
            return Err(ConfigError::Validation {
                field: "email",
                reason: "must not be empty".to_string(),
            });
        }
        if self.password.is_empty() {
            return Err(ConfigError::Validation {
                field: "password",
                reason: "must not be empty".to_string(),
            });
        }
        check_range(
            "poll_interval_secs",
            self.poll_interval_secs,
            MAX_POLL_INTERVAL_SECS,
        )?;
        check_range(
            "request_timeout_ms",
            self.request_timeout_ms,
            MAX_REQUEST_TIMEOUT_MS,
        )?;
        if self.worker.preflight_timeout_ms == 0 {
            return Err(ConfigError::Validation {
                field: "worker.preflight_timeout_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn check_range(field: &'static str, value: u64, max: u64) -> Result<(), ConfigError> {
    if value == 0 || value > max {
        return Err(ConfigError::Validation {
            field,
            reason: format!("must be between 1 and {max}, got {value}"),
        });
    }
    Ok(())
}

/// Resolves the config file path.
///
/// Order: explicit argument, `HSB_CONFIG`, then
/// `<config dir>/hsb/config.toml`.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hsb")
        .join("config.toml")
}
