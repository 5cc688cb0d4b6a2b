//! Typed command surface over the worker.
//!
//! [`Bridge`] combines the supervisor and the correlation queue and turns
//! raw replies into domain results. The rest of the daemon only sees the
//! [`DeviceSource`] and [`DeviceControl`] traits, so reconciliation and
//! accessories can be driven by fakes in tests.

mod error;
mod queue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hsb_core::{DeviceId, DeviceSnapshot, PowerState};
use hsb_protocol::{check_ack, parse_device_list, Command};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::PlatformConfig;
use crate::supervisor::{WorkerEvent, WorkerSupervisor};

pub use error::{BridgeError, ProtocolError};
pub use queue::{CorrelationQueue, MAX_CONSECUTIVE_TIMEOUTS};

// ============================================================================
// Seams
// ============================================================================

/// Something that can report the current device list.
#[async_trait]
pub trait DeviceSource: Send + Sync {
    /// Fetches a fresh snapshot of every device.
    async fn list_devices(&self) -> Result<Vec<DeviceSnapshot>, BridgeError>;
}

/// Something that can change a device's power state.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    /// Requests a power change; returns the worker's acknowledgement.
    async fn set_power(&self, device_id: &DeviceId, power: PowerState)
        -> Result<Value, BridgeError>;
}

// ============================================================================
// Bridge
// ============================================================================

/// Handle to a running worker.
///
/// Cheap to clone; all clones share one worker and one queue.
#[derive(Clone)]
pub struct Bridge {
    queue: CorrelationQueue,
    supervisor: Option<Arc<WorkerSupervisor>>,
    request_timeout: Duration,
}

impl Bridge {
    /// Preflights and spawns the worker, then starts correlating.
    ///
    /// # Errors
    ///
    /// `BridgeError::Environment` or `BridgeError::Spawn`.
    pub async fn start(config: &PlatformConfig) -> Result<Self, BridgeError> {
        let (supervisor, io) = WorkerSupervisor::start(config).await?;
        let queue = CorrelationQueue::new(io.stdin, io.stdout);
        spawn_worker_monitor(io.events, queue.clone());

        Ok(Self {
            queue,
            supervisor: Some(Arc::new(supervisor)),
            request_timeout: config.request_timeout(),
        })
    }

    /// Builds a bridge over arbitrary streams with no child process.
    pub fn from_transport<W, R>(writer: W, reader: R, request_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            queue: CorrelationQueue::new(writer, reader),
            supervisor: None,
            request_timeout,
        }
    }

    /// Sends a raw command and returns the raw reply.
    ///
    /// # Errors
    ///
    /// See [`CorrelationQueue::request`].
    pub async fn request(&self, command: &Command) -> Result<Value, BridgeError> {
        self.queue.request(command, self.request_timeout).await
    }

    /// Logs the worker into the cloud account.
    ///
    /// # Errors
    ///
    /// `BridgeError::Authentication` if the worker rejects the login, or any
    /// transport error.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<(), BridgeError> {
        let reply = self.request(&Command::login(email, password)).await?;
        if let Err(e) = check_ack(&reply) {
            error!(error = %e, "Login failed");
            return Err(BridgeError::Authentication(e.to_string()));
        }
        info!("Login successful");
        Ok(())
    }

    /// Fetches the device list. Malformed entries are logged and skipped.
    ///
    /// # Errors
    ///
    /// `BridgeError::Command` if the reply is an error or the wrong shape,
    /// or any transport error.
    pub async fn list_devices(&self) -> Result<Vec<DeviceSnapshot>, BridgeError> {
        let command = Command::list_devices();
        let reply = self.request(&command).await?;
        let list = parse_device_list(reply).map_err(|e| BridgeError::Command {
            command: command.name(),
            reason: e.to_string(),
        })?;

        for skipped in &list.skipped {
            warn!(index = skipped.index, reason = %skipped.reason, "Skipping malformed device entry");
        }
        Ok(list.devices)
    }

    /// Applies a partial state map to one device.
    ///
    /// # Errors
    ///
    /// `BridgeError::Command` if the worker reports failure, or any
    /// transport error.
    pub async fn set_device_state(
        &self,
        device_id: &DeviceId,
        state: Map<String, Value>,
    ) -> Result<Value, BridgeError> {
        self.send_ack(Command::set_device_state(device_id.clone(), state))
            .await
    }

    async fn send_ack(&self, command: Command) -> Result<Value, BridgeError> {
        let reply = self.request(&command).await?;
        check_ack(&reply).map_err(|e| BridgeError::Command {
            command: command.name(),
            reason: e.to_string(),
        })?;
        Ok(reply)
    }

    /// Fails pending requests, closes the worker's stdin, and terminates
    /// the worker. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.queue.close(BridgeError::ShutDown).await {
            info!("Shutting down bridge");
        }
        self.queue.close_writer().await;
        if let Some(supervisor) = &self.supervisor {
            supervisor.shutdown().await;
        }
        self.queue.stop_reader().await;
    }

    /// Completes once the bridge can no longer serve requests.
    pub async fn closed(&self) -> BridgeError {
        self.queue.closed().await
    }

    /// True once the bridge can no longer serve requests.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Number of replies still owed by the worker.
    pub async fn pending_requests(&self) -> usize {
        self.queue.pending_len().await
    }

    /// Worker process id, if a worker was spawned.
    pub fn worker_pid(&self) -> Option<u32> {
        self.supervisor.as_ref().and_then(|s| s.pid())
    }
}

#[async_trait]
impl DeviceSource for Bridge {
    async fn list_devices(&self) -> Result<Vec<DeviceSnapshot>, BridgeError> {
        Bridge::list_devices(self).await
    }
}

#[async_trait]
impl DeviceControl for Bridge {
    async fn set_power(
        &self,
        device_id: &DeviceId,
        power: PowerState,
    ) -> Result<Value, BridgeError> {
        self.send_ack(Command::set_power(device_id.clone(), power))
            .await
    }
}

/// Turns supervisor events into queue closure.
fn spawn_worker_monitor(mut events: mpsc::UnboundedReceiver<WorkerEvent>, queue: CorrelationQueue) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let reason = match event {
                WorkerEvent::Stderr(text) => BridgeError::Protocol(ProtocolError::Stderr(text)),
                WorkerEvent::Exited(info) => BridgeError::WorkerTerminated(info.to_string()),
            };
            if queue.close(reason.clone()).await {
                error!(error = %reason, "Bridge closed");
            }
        }
    });
}
