//! Accessory registry using the actor pattern.
//!
//! Accessories are keyed by device id. Commands arrive over an mpsc channel
//! and are processed one at a time, so registration and reconciliation never
//! race.
//!
//! ```text
//! ┌──────────────┐ RegistryCommand ┌───────────────┐ AccessoryEvent ┌─────────────┐
//! │  Platform /  │────────────────▶│ RegistryActor │───────────────▶│ subscribers │
//! │  Reconciler  │    (mpsc)       │               │  (broadcast)   │             │
//! └──────────────┘                 └───────────────┘                └─────────────┘
//!                                  HashMap<DeviceId,
//!                                   Arc<dyn AccessoryHandle>>
//! ```

use tokio::sync::{broadcast, mpsc};

mod actor;
mod commands;
mod handle;

pub use actor::{RegistryActor, MAX_ACCESSORIES};
pub use commands::{AccessoryEvent, ReconcileSummary, RegistryCommand, RegistryError};
pub use handle::RegistryHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Spawn the registry actor and return a handle to it.
///
/// The actor stops once every handle has been dropped.
pub fn spawn_registry() -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = RegistryActor::new(cmd_rx, event_tx.clone());
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx, event_tx)
}
