//! Platform startup and shutdown.
//!
//! Startup order:
//! 1. authenticate the worker
//! 2. list devices once
//! 3. register a switch accessory for every switch-type device
//! 4. start the reconciler
//!
//! Any failure before step 4 shuts the bridge down before returning, so no
//! worker is left running.

use std::collections::HashMap;
use std::sync::Arc;

use hsb_core::{DeviceId, DeviceSnapshot};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::accessory::SwitchAccessory;
use crate::bridge::{Bridge, BridgeError, DeviceSource};
use crate::config::PlatformConfig;
use crate::reconcile::spawn_reconciler;
use crate::registry::{spawn_registry, AccessoryEvent, RegistryError, RegistryHandle};

/// Errors from platform operations.
#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("no accessory for device {0}")]
    UnknownDevice(DeviceId),
}

/// A running bridge with its registered accessories and reconciler.
pub struct Platform {
    bridge: Bridge,
    registry: RegistryHandle,
    switches: HashMap<DeviceId, Arc<SwitchAccessory>>,
    cancel_token: CancellationToken,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl Platform {
    /// Starts the worker and launches the platform on it.
    ///
    /// # Errors
    ///
    /// Any `PlatformError` from starting the bridge or from [`Platform::launch`].
    pub async fn start(config: &PlatformConfig) -> Result<Self, PlatformError> {
        let bridge = Bridge::start(config).await?;
        Self::launch(config, bridge).await
    }

    /// Runs the startup sequence on an already started bridge.
    ///
    /// # Errors
    ///
    /// `PlatformError::Bridge` if login or the initial device list fails;
    /// the bridge is shut down first.
    pub async fn launch(config: &PlatformConfig, bridge: Bridge) -> Result<Self, PlatformError> {
        let devices = match initial_devices(config, &bridge).await {
            Ok(devices) => devices,
            Err(e) => {
                bridge.shutdown().await;
                return Err(e.into());
            }
        };

        let registry = spawn_registry();
        let switches = register_switches(&registry, &devices).await;
        info!(
            devices = devices.len(),
            switches = switches.len(),
            "Accessories registered"
        );

        let cancel_token = CancellationToken::new();
        let source: Arc<dyn DeviceSource> = Arc::new(bridge.clone());
        let reconciler = spawn_reconciler(
            source,
            registry.clone(),
            config.poll_interval(),
            cancel_token.clone(),
        );

        Ok(Self {
            bridge,
            registry,
            switches,
            cancel_token,
            reconciler: Mutex::new(Some(reconciler)),
        })
    }

    /// Turns a switch on or off from the accessory side.
    ///
    /// # Errors
    ///
    /// `PlatformError::UnknownDevice` if no switch has this id, or the
    /// bridge error from sending the command.
    pub async fn set_switch(&self, device_id: &DeviceId, on: bool) -> Result<(), PlatformError> {
        let switch = self
            .switches
            .get(device_id)
            .ok_or_else(|| PlatformError::UnknownDevice(device_id.clone()))?;
        switch.set_on(&self.bridge, on).await?;
        Ok(())
    }

    /// The switch accessory for a device.
    pub fn switch(&self, device_id: &DeviceId) -> Option<&Arc<SwitchAccessory>> {
        self.switches.get(device_id)
    }

    /// Every registered switch.
    pub fn switches(&self) -> impl Iterator<Item = &Arc<SwitchAccessory>> {
        self.switches.values()
    }

    /// Registry handle.
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Bridge handle.
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Subscribe to accessory events.
    pub fn subscribe(&self) -> broadcast::Receiver<AccessoryEvent> {
        self.registry.subscribe()
    }

    /// Completes once the bridge fails or is shut down.
    pub async fn closed(&self) -> BridgeError {
        self.bridge.closed().await
    }

    /// Stops the reconciler, then the bridge. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let task = self.reconciler.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Reconciler task failed");
            }
        }
        self.bridge.shutdown().await;
    }
}

async fn initial_devices(
    config: &PlatformConfig,
    bridge: &Bridge,
) -> Result<Vec<DeviceSnapshot>, BridgeError> {
    bridge.authenticate(&config.email, &config.password).await?;
    bridge.list_devices().await
}

async fn register_switches(
    registry: &RegistryHandle,
    devices: &[DeviceSnapshot],
) -> HashMap<DeviceId, Arc<SwitchAccessory>> {
    let mut switches = HashMap::new();

    for device in devices {
        let Some(switch) = SwitchAccessory::from_snapshot(device) else {
            warn!(
                device_id = %device.id,
                kind = %device.kind,
                name = %device.display_name(),
                "Unsupported device type, not exposed"
            );
            continue;
        };

        let switch = Arc::new(switch);
        match registry.register(switch.clone()).await {
            Ok(()) => {
                info!(device_id = %device.id, name = %device.display_name(), "Added switch");
                switches.insert(device.id.clone(), switch);
            }
            Err(e) => warn!(device_id = %device.id, error = %e, "Switch not registered"),
        }
    }

    switches
}
