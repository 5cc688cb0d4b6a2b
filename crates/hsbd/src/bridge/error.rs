//! Bridge error taxonomy.

use std::time::Duration;

use hsb_protocol::LineError;
use thiserror::Error;

use crate::supervisor::EnvironmentError;

/// Worker output that violates the line protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A stdout line could not be decoded
    #[error("undecodable worker output: {0}")]
    Decode(LineError),

    /// The worker wrote to stderr, which it never does while healthy
    #[error("worker wrote to stderr: {0}")]
    Stderr(String),

    /// A reply arrived with no request pending
    #[error("unsolicited worker reply: {0}")]
    Unsolicited(String),

    /// Replies stopped lining up with requests
    #[error("worker replies out of sync after {timeouts} consecutive timeouts")]
    Desynchronized { timeouts: u32 },
}

/// Errors surfaced to bridge callers.
///
/// Clone so one fatal cause can settle every pending request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Preflight failed; the worker was never started
    #[error("worker environment check failed: {0}")]
    Environment(#[from] EnvironmentError),

    /// The worker process could not be spawned
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// Login was rejected
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// No reply within the per-request deadline
    #[error("no reply from worker within {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The worker broke the protocol; fatal for the bridge
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The worker exited or closed its output
    #[error("worker terminated: {0}")]
    WorkerTerminated(String),

    /// The worker answered but reported failure for this command
    #[error("{command} failed: {reason}")]
    Command {
        command: &'static str,
        reason: String,
    },

    /// `shutdown()` was called
    #[error("bridge is shut down")]
    ShutDown,

    /// Writing to or reading from the worker pipes failed
    #[error("worker I/O error: {0}")]
    Io(String),
}

impl BridgeError {
    /// True if the error means the bridge can no longer serve requests.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Timeout(_) | Self::Command { .. } | Self::Authentication(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            BridgeError::Timeout(Duration::from_millis(5000)).to_string(),
            "no reply from worker within 5000ms"
        );
        assert_eq!(
            BridgeError::Command {
                command: "set_device_state",
                reason: "worker reported: offline".to_string(),
            }
            .to_string(),
            "set_device_state failed: worker reported: offline"
        );
        assert_eq!(
            BridgeError::from(ProtocolError::Stderr("Traceback".to_string())).to_string(),
            "protocol error: worker wrote to stderr: Traceback"
        );
    }

    #[test]
    fn test_fatality() {
        assert!(!BridgeError::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(!BridgeError::Authentication("bad".to_string()).is_fatal());
        assert!(BridgeError::ShutDown.is_fatal());
        assert!(BridgeError::WorkerTerminated("exited with code 1".to_string()).is_fatal());
        assert!(BridgeError::Protocol(ProtocolError::Stderr(String::new())).is_fatal());
        assert!(BridgeError::Protocol(ProtocolError::Desynchronized { timeouts: 3 }).is_fatal());
    }
}
