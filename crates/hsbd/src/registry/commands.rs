//! Registry actor commands, errors, and events.
//!
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `AccessoryEvent`: Events published by the registry for subscribers
//! - `ReconcileSummary`: Outcome of applying one poll's snapshots

use std::sync::Arc;

use hsb_core::{DeviceId, DeviceSnapshot, PowerState};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::accessory::AccessoryHandle;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each command carries a oneshot channel for its response.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Register an accessory under its device id.
    ///
    /// # Errors
    /// - `RegistryError::AlreadyRegistered` if the id is taken
    /// - `RegistryError::RegistryFull` if at maximum capacity
    Register {
        accessory: Arc<dyn AccessoryHandle>,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Look up one accessory. `None` if unknown.
    Get {
        device_id: DeviceId,
        respond_to: oneshot::Sender<Option<Arc<dyn AccessoryHandle>>>,
    },

    /// List registered device ids, sorted.
    ListIds {
        respond_to: oneshot::Sender<Vec<DeviceId>>,
    },

    /// Apply one poll's snapshots to the registered accessories.
    ///
    /// Snapshots for unregistered devices are ignored; only accessories
    /// whose state differs are touched.
    Reconcile {
        snapshots: Vec<DeviceSnapshot>,
        respond_to: oneshot::Sender<ReconcileSummary>,
    },
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors from registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// An accessory for this device is already registered
    #[error("Accessory already registered: {0}")]
    AlreadyRegistered(DeviceId),

    /// The registry has reached its capacity
    #[error("Registry full: maximum {max} accessories")]
    RegistryFull { max: usize },

    /// The actor has shut down
    #[error("Registry channel closed")]
    ChannelClosed,
}

// ============================================================================
// Events
// ============================================================================

/// Published on every registry change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessoryEvent {
    /// A new accessory was registered
    Registered { device_id: DeviceId },

    /// Reconciliation changed an accessory's state
    StateChanged {
        device_id: DeviceId,
        power: PowerState,
    },
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Snapshots examined
    pub seen: usize,
    /// Accessories whose state changed
    pub updated: usize,
    /// Snapshots with no registered accessory
    pub unknown: usize,
    /// Snapshots skipped for an unreadable power value
    pub invalid: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            RegistryError::AlreadyRegistered(DeviceId::new("dev1")).to_string(),
            "Accessory already registered: dev1"
        );
        assert_eq!(
            RegistryError::RegistryFull { max: 256 }.to_string(),
            "Registry full: maximum 256 accessories"
        );
    }
}
