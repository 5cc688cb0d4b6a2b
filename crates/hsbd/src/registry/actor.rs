//! Registry actor - owns the accessory map and processes commands.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Response and event send failures are ignored (the receiver went away)

use std::collections::HashMap;
use std::sync::Arc;

use hsb_core::{DeviceId, DeviceSnapshot};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::commands::{AccessoryEvent, ReconcileSummary, RegistryCommand, RegistryError};
use crate::accessory::AccessoryHandle;

/// Maximum number of accessories the registry can hold.
pub const MAX_ACCESSORIES: usize = 256;

/// The registry actor.
///
/// Runs in a single task; every mutation of the accessory map happens here,
/// one command at a time.
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,
    accessories: HashMap<DeviceId, Arc<dyn AccessoryHandle>>,
    event_publisher: broadcast::Sender<AccessoryEvent>,
}

impl RegistryActor {
    /// Creates a new registry actor.
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<AccessoryEvent>,
    ) -> Self {
        Self {
            receiver,
            accessories: HashMap::new(),
            event_publisher,
        }
    }

    /// Processes commands until every handle is dropped.
    pub async fn run(mut self) {
        info!("Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            "Registry actor stopped (accessories: {})",
            self.accessories.len()
        );
    }

    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Register {
                accessory,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_register(accessory));
            }
            RegistryCommand::Get {
                device_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.accessories.get(&device_id).cloned());
            }
            RegistryCommand::ListIds { respond_to } => {
                let mut ids: Vec<DeviceId> = self.accessories.keys().cloned().collect();
                ids.sort();
                let _ = respond_to.send(ids);
            }
            RegistryCommand::Reconcile {
                snapshots,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_reconcile(snapshots));
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_register(&mut self, accessory: Arc<dyn AccessoryHandle>) -> Result<(), RegistryError> {
        let device_id = accessory.device_id().clone();

        if self.accessories.contains_key(&device_id) {
            return Err(RegistryError::AlreadyRegistered(device_id));
        }

        if self.accessories.len() >= MAX_ACCESSORIES {
            warn!(
                device_id = %device_id,
                max = MAX_ACCESSORIES,
                "Registry is full, rejecting accessory"
            );
            return Err(RegistryError::RegistryFull {
                max: MAX_ACCESSORIES,
            });
        }

        self.accessories.insert(device_id.clone(), accessory);
        debug!(device_id = %device_id, total = self.accessories.len(), "Accessory registered");

        let _ = self
            .event_publisher
            .send(AccessoryEvent::Registered { device_id });
        Ok(())
    }

    fn handle_reconcile(&mut self, snapshots: Vec<DeviceSnapshot>) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        for snapshot in snapshots {
            summary.seen += 1;

            let Some(accessory) = self.accessories.get(&snapshot.id) else {
                summary.unknown += 1;
                continue;
            };

            let power = match snapshot.power_state() {
                Ok(power) => power,
                Err(e) => {
                    warn!(device_id = %snapshot.id, error = %e, "Skipping device with unreadable power");
                    summary.invalid += 1;
                    continue;
                }
            };

            if accessory.apply_if_changed(power) {
                summary.updated += 1;
                let _ = self.event_publisher.send(AccessoryEvent::StateChanged {
                    device_id: snapshot.id,
                    power,
                });
            }
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessory::SwitchAccessory;
    use chrono::Utc;
    use hsb_core::{DeviceKind, DeviceState, PowerState};
    use serde_json::json;

    fn snapshot(id: &str, power: PowerState) -> DeviceSnapshot {
        DeviceSnapshot {
            id: DeviceId::new(id),
            kind: DeviceKind::Switch,
            name: id.to_string(),
            default_name: None,
            product_name: None,
            nickname: None,
            state: DeviceState::with_power(power),
            observed_at: Utc::now(),
        }
    }

    fn switch(id: &str, power: PowerState) -> Arc<dyn AccessoryHandle> {
        match SwitchAccessory::from_snapshot(&snapshot(id, power)) {
            Some(s) => Arc::new(s),
            None => panic!("switch snapshot rejected"),
        }
    }

    fn actor() -> (RegistryActor, broadcast::Receiver<AccessoryEvent>) {
        let (_tx, rx) = mpsc::channel(8);
        let (event_tx, event_rx) = broadcast::channel(64);
        (RegistryActor::new(rx, event_tx), event_rx)
    }

    #[test]
    fn test_register_and_duplicate() {
        let (mut actor, mut events) = actor();
        assert!(actor.handle_register(switch("a", PowerState::Off)).is_ok());
        assert_eq!(
            actor.handle_register(switch("a", PowerState::On)),
            Err(RegistryError::AlreadyRegistered(DeviceId::new("a")))
        );
        assert_eq!(
            events.try_recv().unwrap(),
            AccessoryEvent::Registered {
                device_id: DeviceId::new("a")
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_capacity_limit() {
        let (mut actor, _events) = actor();
        for i in 0..MAX_ACCESSORIES {
            assert!(actor
                .handle_register(switch(&format!("dev{i}"), PowerState::Off))
                .is_ok());
        }
        assert_eq!(
            actor.handle_register(switch("overflow", PowerState::Off)),
            Err(RegistryError::RegistryFull {
                max: MAX_ACCESSORIES
            })
        );
    }

    #[test]
    fn test_reconcile_applies_only_deltas() {
        let (mut actor, mut events) = actor();
        actor.handle_register(switch("a", PowerState::Off)).unwrap();
        actor.handle_register(switch("b", PowerState::On)).unwrap();
        while events.try_recv().is_ok() {}

        let summary = actor.handle_reconcile(vec![
            snapshot("a", PowerState::On),
            snapshot("b", PowerState::On),
            snapshot("ghost", PowerState::On),
        ]);
        assert_eq!(
            summary,
            ReconcileSummary {
                seen: 3,
                updated: 1,
                unknown: 1,
                invalid: 0
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            AccessoryEvent::StateChanged {
                device_id: DeviceId::new("a"),
                power: PowerState::On
            }
        );

        // Same snapshot again is a no-op
        let again = actor.handle_reconcile(vec![snapshot("a", PowerState::On)]);
        assert_eq!(again.updated, 0);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_reconcile_skips_invalid_power() {
        let (mut actor, _events) = actor();
        actor.handle_register(switch("a", PowerState::Off)).unwrap();

        let mut bad = snapshot("a", PowerState::On);
        bad.state.power = Some(json!({"level": 3}));

        let summary = actor.handle_reconcile(vec![bad]);
        assert_eq!(summary.invalid, 1);
        assert_eq!(summary.updated, 0);
        assert_eq!(
            actor.accessories.get(&DeviceId::new("a")).map(|a| a.power()),
            Some(PowerState::Off)
        );
    }
}
