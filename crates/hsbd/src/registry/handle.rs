//! Client interface for the registry actor.
//!
//! Channel errors map to `RegistryError::ChannelClosed`.

use std::sync::Arc;

use hsb_core::{DeviceId, DeviceSnapshot};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::commands::{AccessoryEvent, ReconcileSummary, RegistryCommand, RegistryError};
use crate::accessory::AccessoryHandle;

/// Cheap-to-clone handle to the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
    event_sender: broadcast::Sender<AccessoryEvent>,
}

impl RegistryHandle {
    /// Create a new registry handle.
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<AccessoryEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Register an accessory.
    ///
    /// # Errors
    ///
    /// - `RegistryError::AlreadyRegistered` if the device id is taken
    /// - `RegistryError::RegistryFull` if at maximum capacity
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn register(&self, accessory: Arc<dyn AccessoryHandle>) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.send(RegistryCommand::Register {
            accessory,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Get the accessory for a device, if registered.
    ///
    /// # Errors
    ///
    /// `RegistryError::ChannelClosed` if the actor has shut down.
    pub async fn get(
        &self,
        device_id: &DeviceId,
    ) -> Result<Option<Arc<dyn AccessoryHandle>>, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.send(RegistryCommand::Get {
            device_id: device_id.clone(),
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Registered device ids, sorted.
    ///
    /// Returns an empty list if the actor has shut down.
    pub async fn list_ids(&self) -> Vec<DeviceId> {
        let (tx, rx) = oneshot::channel();
        if self
            .send(RegistryCommand::ListIds { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Apply one poll's snapshots.
    ///
    /// # Errors
    ///
    /// `RegistryError::ChannelClosed` if the actor has shut down.
    pub async fn reconcile(
        &self,
        snapshots: Vec<DeviceSnapshot>,
    ) -> Result<ReconcileSummary, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.send(RegistryCommand::Reconcile {
            snapshots,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Subscribe to registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<AccessoryEvent> {
        self.event_sender.subscribe()
    }

    /// True while the actor is running.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn send(&self, cmd: RegistryCommand) -> Result<(), RegistryError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| RegistryError::ChannelClosed)
    }
}
