//! Worker process supervision.
//!
//! Owns exactly one worker child process: preflight, spawn with piped
//! stdio, stderr and exit watching, and graceful termination.
//!
//! # Lifecycle
//!
//! ```text
//! preflight ──▶ spawn ──▶ running ──┬──▶ exited (on its own)
//!                                   │
//!                     shutdown() ───┴──▶ SIGTERM ──▶ grace ──▶ kill
//! ```
//!
//! Every observation is reported as a [`WorkerEvent`]; the bridge decides
//! what each one means for in-flight requests.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Missing stdio handles and spawn failures map to `BridgeError::Spawn`
//! - Event channel send failures are ignored (the bridge has gone away)

pub mod preflight;

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::BridgeError;
use crate::config::{PlatformConfig, WorkerConfig};

pub use preflight::{verify, EnvironmentError, PreflightReport};

/// Read buffer size for the stderr watcher.
const STDERR_CHUNK: usize = 4096;

// ============================================================================
// Events
// ============================================================================

/// Something the supervisor observed about the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The worker wrote to stderr
    Stderr(String),
    /// The worker process has exited
    Exited(ExitInfo),
}

/// How the worker exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, if it exited normally
    pub code: Option<i32>,
    /// Terminating signal, if it was killed (Unix only)
    pub signal: Option<i32>,
    /// True if the exit followed `shutdown()`
    pub requested: bool,
    /// Set if waiting on the child failed
    pub wait_error: Option<String>,
}

impl ExitInfo {
    fn from_status(status: ExitStatus, requested: bool) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            requested,
            wait_error: None,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(err) = &self.wait_error {
            return write!(f, "wait failed: {err}");
        }
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {code}")?,
            (None, Some(signal)) => write!(f, "killed by signal {signal}")?,
            (None, None) => f.write_str("exited")?,
        }
        if self.requested {
            f.write_str(" (shutdown requested)")?;
        }
        Ok(())
    }
}

/// Streams handed to the bridge after a successful spawn.
pub struct WorkerIo {
    /// Worker stdin; commands are written here
    pub stdin: ChildStdin,
    /// Worker stdout; replies are read from here
    pub stdout: ChildStdout,
    /// Stderr output and exit notifications
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
}

// ============================================================================
// Supervisor
// ============================================================================

/// Owns the worker child process.
pub struct WorkerSupervisor {
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
    exit_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerSupervisor {
    /// Runs the preflight and spawns the worker with the platform's
    /// credentials and poll interval as arguments.
    ///
    /// # Errors
    ///
    /// - `BridgeError::Environment` if any preflight check fails
    /// - `BridgeError::Spawn` if the process cannot be started
    pub async fn start(config: &PlatformConfig) -> Result<(Self, WorkerIo), BridgeError> {
        verify(&config.worker).await?;
        Self::spawn(&config.worker, &worker_args(config))
    }

    /// Spawns `interpreter script args...` without a preflight.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// `BridgeError::Spawn` if the process cannot be started or a stdio
    /// pipe was not captured.
    pub fn spawn(worker: &WorkerConfig, args: &[String]) -> Result<(Self, WorkerIo), BridgeError> {
        let mut child = Command::new(&worker.interpreter)
            .arg(&worker.script)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BridgeError::Spawn(format!("{}: {e}", worker.interpreter.display()))
            })?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Spawn("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Spawn("worker stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::Spawn("worker stderr not captured".to_string()))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let grace = Duration::from_millis(worker.terminate_grace_ms);

        tokio::spawn(watch_stderr(stderr, event_tx.clone()));
        let exit_task = tokio::spawn(watch_exit(
            child,
            pid,
            Arc::clone(&alive),
            cancel.clone(),
            grace,
            event_tx,
        ));

        info!(
            pid = ?pid,
            script = %worker.script.display(),
            "Worker process started"
        );

        let supervisor = Self {
            pid,
            alive,
            cancel,
            exit_task: Mutex::new(Some(exit_task)),
        };
        let io = WorkerIo {
            stdin,
            stdout,
            events: event_rx,
        };
        Ok((supervisor, io))
    }

    /// OS process id, if the platform reported one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True until the worker has been observed to exit.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Terminates the worker and waits for it to exit.
    ///
    /// Sends SIGTERM, waits the configured grace period, then kills.
    /// Calling this again, or after the worker already exited, is a no-op.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let task = self.exit_task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Worker exit watcher failed");
            }
        }
    }
}

impl fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Positional worker arguments: email, password, poll interval in seconds.
fn worker_args(config: &PlatformConfig) -> Vec<String> {
    vec![
        config.email.clone(),
        config.password.clone(),
        config.poll_interval_secs.to_string(),
    ]
}

// ============================================================================
// Watcher tasks
// ============================================================================

/// Forwards every stderr chunk as an event until the pipe closes.
async fn watch_stderr(mut stderr: ChildStderr, events: mpsc::UnboundedSender<WorkerEvent>) {
    let mut buf = vec![0u8; STDERR_CHUNK];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = buf
                    .get(..n)
                    .map(|chunk| String::from_utf8_lossy(chunk).trim_end().to_string())
                    .unwrap_or_default();
                error!(stderr = %text, "Worker wrote to stderr");
                // Keep draining even with no listener so the child never blocks
                let _ = events.send(WorkerEvent::Stderr(text));
            }
            Err(e) => {
                debug!(error = %e, "Worker stderr read failed");
                break;
            }
        }
    }
}

/// Waits for the child to exit, or terminates it on cancellation.
async fn watch_exit(
    mut child: Child,
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
    grace: Duration,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let (status, requested) = tokio::select! {
        status = child.wait() => (status, false),
        _ = cancel.cancelled() => {
            request_termination(&mut child, pid);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => (status, true),
                Err(_) => {
                    warn!(pid = ?pid, grace_ms = grace.as_millis() as u64, "Worker ignored SIGTERM, killing");
                    if let Err(e) = child.start_kill() {
                        debug!(error = %e, "Worker kill failed");
                    }
                    (child.wait().await, true)
                }
            }
        }
    };

    alive.store(false, Ordering::SeqCst);

    let info = match status {
        Ok(status) => ExitInfo::from_status(status, requested),
        Err(e) => ExitInfo {
            requested,
            wait_error: Some(e.to_string()),
            ..Default::default()
        },
    };

    if requested {
        info!(pid = ?pid, exit = %info, "Worker process stopped");
    } else {
        warn!(pid = ?pid, exit = %info, "Worker process exited unexpectedly");
    }

    let _ = events.send(WorkerEvent::Exited(info));
}

/// Asks the worker to exit. The child has not been reaped yet, so the pid
/// still refers to it.
#[cfg(unix)]
fn request_termination(child: &mut Child, pid: Option<u32>) {
    let Some(pid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        // Already reaped or unrepresentable; fall back to a hard kill
        let _ = child.start_kill();
        return;
    };
    debug!(pid, "Sending SIGTERM to worker");
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}
