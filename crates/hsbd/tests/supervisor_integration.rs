//! Supervisor and bridge tests against real child processes.
//!
//! Workers are small shell scripts. The "interpreter" is a shell wrapper
//! that answers `--version` and `-c "import ..."` like a Python would and
//! runs everything else with `/bin/sh`.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hsb_protocol::Command;
use hsbd::bridge::{Bridge, BridgeError, CorrelationQueue, ProtocolError};
use hsbd::config::{PlatformConfig, WorkerConfig};
use hsbd::supervisor::{verify, EnvironmentError, WorkerEvent, WorkerSupervisor};
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{timeout, Instant};

const DEADLINE: Duration = Duration::from_secs(10);

const FAKE_INTERPRETER: &str = r#"#!/bin/sh
case "$1" in
  --version) echo "Python 3.11.4"; exit 0 ;;
  -c)
    case "$2" in
      "import requests") exit 0 ;;
      *) echo "ModuleNotFoundError: No module named '${2#import }'" >&2; exit 1 ;;
    esac ;;
esac
exec /bin/sh "$@"
"#;

const SANITY_PREAMBLE: &str = r#"if [ "$1" = "--sanity-check" ]; then
  echo '{"status": "ok", "message": "worker is responsive"}'
  exit 0
fi
"#;

// ============================================================================
// Test Helpers
// ============================================================================

struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp dir"),
        }
    }

    fn write(&self, name: &str, body: &str, executable: bool) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, body).expect("write script");
        if executable {
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .expect("chmod");
        }
        path
    }

    fn worker(&self, interpreter: &Path, script_body: &str) -> WorkerConfig {
        WorkerConfig {
            interpreter: interpreter.to_path_buf(),
            script: self.write("worker.sh", script_body, false),
            required_modules: vec!["requests".to_string()],
            terminate_grace_ms: 500,
            preflight_timeout_ms: 5_000,
        }
    }

    fn fake_interpreter(&self) -> PathBuf {
        self.write("python", FAKE_INTERPRETER, true)
    }
}

fn platform_config(worker: WorkerConfig) -> PlatformConfig {
    PlatformConfig {
        email: "me@example.com".to_string(),
        password: "pw".to_string(),
        request_timeout_ms: 2_000,
        worker,
        ..Default::default()
    }
}

async fn next_exit(events: &mut tokio::sync::mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEvent {
    loop {
        let event = timeout(DEADLINE, events.recv())
            .await
            .expect("event within deadline")
            .expect("event channel open");
        if matches!(event, WorkerEvent::Exited(_)) {
            return event;
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

#[tokio::test]
async fn test_spawned_worker_answers_and_terminates_on_shutdown() {
    let sandbox = Sandbox::new();
    let worker = sandbox.worker(
        Path::new("/bin/sh"),
        "while IFS= read -r line; do echo '{\"status\":\"ok\"}'; done\n",
    );

    let (supervisor, mut io) = WorkerSupervisor::spawn(&worker, &[]).unwrap();
    assert!(supervisor.is_alive());
    assert!(supervisor.pid().is_some());

    let queue = CorrelationQueue::new(io.stdin, io.stdout);
    let reply = queue
        .request(&Command::list_devices(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply, json!({"status": "ok"}));

    supervisor.shutdown().await;
    assert!(!supervisor.is_alive());

    match next_exit(&mut io.events).await {
        WorkerEvent::Exited(info) => assert!(info.requested),
        other => panic!("Expected exit, got {other:?}"),
    }

    // Second shutdown is a no-op
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_worker_ignoring_sigterm_is_killed() {
    let sandbox = Sandbox::new();
    let worker = sandbox.worker(
        Path::new("/bin/sh"),
        "trap '' TERM\necho ready\nwhile true; do sleep 1; done\n",
    );

    let (supervisor, mut io) = WorkerSupervisor::spawn(&worker, &[]).unwrap();

    // SIGTERM must not arrive before the trap is installed
    let mut stdout = BufReader::new(io.stdout).lines();
    let ready = timeout(DEADLINE, stdout.next_line()).await.unwrap().unwrap();
    assert_eq!(ready.as_deref(), Some("ready"));

    timeout(DEADLINE, supervisor.shutdown())
        .await
        .expect("shutdown within deadline");
    assert!(!supervisor.is_alive());

    match next_exit(&mut io.events).await {
        WorkerEvent::Exited(info) => {
            assert!(info.requested);
            assert_eq!(info.signal, Some(libc::SIGKILL));
        }
        other => panic!("Expected exit, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unexpected_exit_is_reported() {
    let sandbox = Sandbox::new();
    let worker = sandbox.worker(Path::new("/bin/sh"), "exit 3\n");

    let (supervisor, mut io) = WorkerSupervisor::spawn(&worker, &[]).unwrap();

    match next_exit(&mut io.events).await {
        WorkerEvent::Exited(info) => {
            assert_eq!(info.code, Some(3));
            assert!(!info.requested);
        }
        other => panic!("Expected exit, got {other:?}"),
    }
    assert!(!supervisor.is_alive());
}

// ============================================================================
// Preflight
// ============================================================================

#[tokio::test]
async fn test_preflight_passes_with_healthy_worker() {
    let sandbox = Sandbox::new();
    let interpreter = sandbox.fake_interpreter();
    let worker = sandbox.worker(&interpreter, SANITY_PREAMBLE);

    let report = verify(&worker).await.unwrap();
    assert_eq!(report.interpreter_version, "Python 3.11.4");
    assert_eq!(report.sanity_message, "worker is responsive");
    assert_eq!(report.diagnostics.len(), 4);
}

#[tokio::test]
async fn test_preflight_reports_missing_module() {
    let sandbox = Sandbox::new();
    let interpreter = sandbox.fake_interpreter();
    let mut worker = sandbox.worker(&interpreter, SANITY_PREAMBLE);
    worker.required_modules.push("aioafero".to_string());

    match verify(&worker).await {
        Err(EnvironmentError::MissingModule { module, reason }) => {
            assert_eq!(module, "aioafero");
            assert!(reason.contains("No module named"));
        }
        other => panic!("Expected missing module, got {other:?}"),
    }
}

#[tokio::test]
async fn test_preflight_reports_failed_sanity_check() {
    let sandbox = Sandbox::new();
    let interpreter = sandbox.fake_interpreter();
    let worker = sandbox.worker(&interpreter, "echo '{\"status\": \"error\"}'\n");

    assert!(matches!(
        verify(&worker).await,
        Err(EnvironmentError::SanityCheckFailed(_))
    ));
}

#[tokio::test]
async fn test_preflight_kills_hung_sanity_check() {
    let sandbox = Sandbox::new();
    let interpreter = sandbox.fake_interpreter();
    let mut worker = sandbox.worker(&interpreter, "sleep 30\n");
    worker.preflight_timeout_ms = 300;

    let started = Instant::now();
    let result = verify(&worker).await;

    assert_eq!(
        result.unwrap_err(),
        EnvironmentError::CheckTimedOut {
            check: "sanity check",
            timeout_ms: 300,
        }
    );
    assert!(started.elapsed() < Duration::from_secs(5));
}

// ============================================================================
// Bridge over a real worker
// ============================================================================

#[tokio::test]
async fn test_bridge_start_rejects_broken_environment() {
    let sandbox = Sandbox::new();
    let mut worker = sandbox.worker(&sandbox.fake_interpreter(), SANITY_PREAMBLE);
    worker.script = sandbox.dir.path().join("missing.py");

    let err = Bridge::start(&platform_config(worker)).await.err().unwrap();
    assert!(
        matches!(err, BridgeError::Environment(EnvironmentError::ScriptMissing(_))),
        "got {err:?}"
    );
}

#[tokio::test]
async fn test_stderr_output_fails_pending_request() {
    let sandbox = Sandbox::new();
    let script = format!(
        "{SANITY_PREAMBLE}{}",
        r#"while IFS= read -r line; do
  case "$line" in
    *'"command":"login"'*) echo '{"status":"ok"}' ;;
    *) echo 'Traceback (most recent call last):' >&2 ;;
  esac
done
"#
    );
    let worker = sandbox.worker(&sandbox.fake_interpreter(), &script);

    let bridge = Bridge::start(&platform_config(worker)).await.unwrap();
    bridge.authenticate("me@example.com", "pw").await.unwrap();

    let err = bridge.list_devices().await.unwrap_err();
    assert!(
        matches!(err, BridgeError::Protocol(ProtocolError::Stderr(_))),
        "got {err:?}"
    );
    assert!(bridge.is_closed());

    timeout(DEADLINE, bridge.shutdown())
        .await
        .expect("shutdown within deadline");
}

#[tokio::test]
async fn test_worker_exit_fails_pending_request() {
    let sandbox = Sandbox::new();
    let script = format!("{SANITY_PREAMBLE}read -r line\nexit 0\n");
    let worker = sandbox.worker(&sandbox.fake_interpreter(), &script);

    let bridge = Bridge::start(&platform_config(worker)).await.unwrap();
    let err = bridge.list_devices().await.unwrap_err();
    assert!(matches!(err, BridgeError::WorkerTerminated(_)), "got {err:?}");

    bridge.shutdown().await;
}
