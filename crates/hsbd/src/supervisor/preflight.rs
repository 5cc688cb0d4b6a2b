//! Environment preflight for the worker process.
//!
//! Runs short-lived checks before the long-lived worker is spawned:
//! 1. the worker script exists
//! 2. the interpreter runs (`--version`)
//! 3. each required module imports
//! 4. the script answers `--sanity-check` with `{"status":"ok"}`
//!
//! Each check process is killed if it runs longer than the worker's
//! `preflight_timeout_ms`.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;

/// Flag that puts the worker script into sanity-check mode.
pub const SANITY_CHECK_FLAG: &str = "--sanity-check";

// ============================================================================
// Error Types
// ============================================================================

/// A preflight check failed; the worker is never spawned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentError {
    /// The worker script file does not exist
    #[error("worker script not found: {}", .0.display())]
    ScriptMissing(PathBuf),

    /// The interpreter could not be executed
    #[error("interpreter {} unavailable: {reason}", .interpreter.display())]
    InterpreterUnavailable { interpreter: PathBuf, reason: String },

    /// A required module failed to import
    #[error("missing module '{module}': {reason}")]
    MissingModule { module: String, reason: String },

    /// The script's sanity-check mode did not report ok
    #[error("sanity check failed: {0}")]
    SanityCheckFailed(String),

    /// A check process did not finish in time and was killed
    #[error("{check} did not finish within {timeout_ms}ms")]
    CheckTimedOut { check: &'static str, timeout_ms: u64 },
}

// ============================================================================
// Report
// ============================================================================

/// Outcome of a successful preflight.
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    /// Interpreter version string, as printed by `--version`
    pub interpreter_version: String,
    /// Message returned by the sanity check
    pub sanity_message: String,
    /// One human-readable line per passed check
    pub diagnostics: Vec<String>,
}

impl PreflightReport {
    fn pass(&mut self, line: String) {
        info!("{line}");
        self.diagnostics.push(line);
    }
}

/// Reply printed by the worker in sanity-check mode.
#[derive(Debug, Deserialize)]
struct SanityReply {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

// ============================================================================
// Checks
// ============================================================================

/// Runs every preflight check in order, stopping at the first failure.
///
/// # Errors
///
/// The `EnvironmentError` of the first failing check.
pub async fn verify(worker: &WorkerConfig) -> Result<PreflightReport, EnvironmentError> {
    let result = run_checks(worker).await;
    if let Err(e) = &result {
        error!(error = %e, "Worker environment check failed");
    }
    result
}

async fn run_checks(worker: &WorkerConfig) -> Result<PreflightReport, EnvironmentError> {
    let limit = Duration::from_millis(worker.preflight_timeout_ms);
    let mut report = PreflightReport::default();

    check_script(&worker.script)?;
    report.pass(format!("Worker script {} exists", worker.script.display()));

    report.interpreter_version = check_interpreter(&worker.interpreter, limit).await?;
    report.pass(format!("Interpreter version: {}", report.interpreter_version));

    for module in &worker.required_modules {
        check_module(&worker.interpreter, module, limit).await?;
        report.pass(format!("Module '{module}' is installed"));
    }

    report.sanity_message = check_sanity(&worker.interpreter, &worker.script, limit).await?;
    report.pass(format!("Sanity check passed: {}", report.sanity_message));

    Ok(report)
}

/// Runs one check process to completion, killing it once `limit` passes.
///
/// The outer error is the timeout; the inner one is from spawning or
/// collecting output.
async fn run_check_process(
    command: &mut Command,
    check: &'static str,
    limit: Duration,
) -> Result<io::Result<Output>, EnvironmentError> {
    command.stdin(Stdio::null()).kill_on_drop(true);
    match tokio::time::timeout(limit, command.output()).await {
        Ok(output) => Ok(output),
        Err(_) => {
            let timeout_ms = limit.as_millis() as u64;
            warn!(check, timeout_ms, "Preflight check timed out, killed");
            Err(EnvironmentError::CheckTimedOut { check, timeout_ms })
        }
    }
}

fn check_script(script: &Path) -> Result<(), EnvironmentError> {
    if script.is_file() {
        Ok(())
    } else {
        Err(EnvironmentError::ScriptMissing(script.to_path_buf()))
    }
}

async fn check_interpreter(interpreter: &Path, limit: Duration) -> Result<String, EnvironmentError> {
    let unavailable = |reason: String| EnvironmentError::InterpreterUnavailable {
        interpreter: interpreter.to_path_buf(),
        reason,
    };

    let output = run_check_process(
        Command::new(interpreter).arg("--version"),
        "interpreter version check",
        limit,
    )
    .await?
    .map_err(|e| unavailable(e.to_string()))?;

    if !output.status.success() {
        return Err(unavailable(failure_text(&output)));
    }

    // Older interpreters print the version on stderr
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() {
        Ok(String::from_utf8_lossy(&output.stderr).trim().to_string())
    } else {
        Ok(stdout)
    }
}

async fn check_module(
    interpreter: &Path,
    module: &str,
    limit: Duration,
) -> Result<(), EnvironmentError> {
    let missing = |reason: String| EnvironmentError::MissingModule {
        module: module.to_string(),
        reason,
    };

    if !is_module_name(module) {
        return Err(missing("not a valid module name".to_string()));
    }

    let output = run_check_process(
        Command::new(interpreter)
            .arg("-c")
            .arg(format!("import {module}")),
        "module import check",
        limit,
    )
    .await?
    .map_err(|e| missing(e.to_string()))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(missing(failure_text(&output)))
    }
}

async fn check_sanity(
    interpreter: &Path,
    script: &Path,
    limit: Duration,
) -> Result<String, EnvironmentError> {
    let output = run_check_process(
        Command::new(interpreter).arg(script).arg(SANITY_CHECK_FLAG),
        "sanity check",
        limit,
    )
    .await?
    .map_err(|e| EnvironmentError::SanityCheckFailed(e.to_string()))?;

    if !output.status.success() {
        return Err(EnvironmentError::SanityCheckFailed(failure_text(&output)));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_sanity_reply(&stdout)
}

/// Interprets sanity-check output: the first non-empty line must be
/// `{"status":"ok","message":...}`.
fn parse_sanity_reply(stdout: &str) -> Result<String, EnvironmentError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| EnvironmentError::SanityCheckFailed("no output".to_string()))?;

    let reply: SanityReply = serde_json::from_str(line)
        .map_err(|e| EnvironmentError::SanityCheckFailed(format!("{e}: {line}")))?;

    if reply.status != "ok" {
        return Err(EnvironmentError::SanityCheckFailed(format!("got: {line}")));
    }

    Ok(reply.message.unwrap_or_default())
}

fn is_module_name(module: &str) -> bool {
    !module.is_empty()
        && module
            .split('.')
            .all(|part| {
                !part.is_empty()
                    && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                    && !part.starts_with(|c: char| c.is_ascii_digit())
            })
}

fn failure_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sanity_reply_ok() {
        let msg = parse_sanity_reply(
            "\n{\"status\": \"ok\", \"message\": \"Hubspace CLI is responsive.\"}\n",
        )
        .unwrap();
        assert_eq!(msg, "Hubspace CLI is responsive.");
    }

    #[test]
    fn test_parse_sanity_reply_without_message() {
        assert_eq!(parse_sanity_reply("{\"status\":\"ok\"}").unwrap(), "");
    }

    #[test]
    fn test_parse_sanity_reply_failures() {
        assert!(matches!(
            parse_sanity_reply(""),
            Err(EnvironmentError::SanityCheckFailed(_))
        ));
        assert!(matches!(
            parse_sanity_reply("Traceback (most recent call last):"),
            Err(EnvironmentError::SanityCheckFailed(_))
        ));
        assert!(matches!(
            parse_sanity_reply("{\"status\":\"degraded\"}"),
            Err(EnvironmentError::SanityCheckFailed(_))
        ));
    }

    #[test]
    fn test_module_names() {
        assert!(is_module_name("requests"));
        assert!(is_module_name("aioafero.v1"));
        assert!(is_module_name("_private"));
        assert!(!is_module_name(""));
        assert!(!is_module_name("os; import sys"));
        assert!(!is_module_name("a..b"));
        assert!(!is_module_name("1abc"));
    }

    #[tokio::test]
    async fn test_missing_script_fails_first() {
        let worker = WorkerConfig {
            interpreter: PathBuf::from("definitely-not-an-interpreter-hsb"),
            script: PathBuf::from("/definitely/not/a/script.py"),
            ..Default::default()
        };
        assert_eq!(
            verify(&worker).await.unwrap_err(),
            EnvironmentError::ScriptMissing(PathBuf::from("/definitely/not/a/script.py"))
        );
    }

    #[tokio::test]
    async fn test_missing_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("worker.py");
        std::fs::write(&script, "print('hi')\n").unwrap();

        let worker = WorkerConfig {
            interpreter: PathBuf::from("definitely-not-an-interpreter-hsb"),
            script,
            ..Default::default()
        };
        assert!(matches!(
            verify(&worker).await,
            Err(EnvironmentError::InterpreterUnavailable { .. })
        ));
    }

    #[test]
    fn test_error_display() {
        let err = EnvironmentError::ScriptMissing(PathBuf::from("/x/worker.py"));
        assert_eq!(err.to_string(), "worker script not found: /x/worker.py");

        let err = EnvironmentError::MissingModule {
            module: "requests".to_string(),
            reason: "No module named 'requests'".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "missing module 'requests': No module named 'requests'"
        );

        let err = EnvironmentError::CheckTimedOut {
            check: "sanity check",
            timeout_ms: 250,
        };
        assert_eq!(err.to_string(), "sanity check did not finish within 250ms");
    }
}
