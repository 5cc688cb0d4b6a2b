//! Accessories exposed for devices.
//!
//! An accessory holds the last state applied to it. Reconciliation only
//! touches an accessory when the polled state differs from that value.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use hsb_core::{DeviceId, DeviceSnapshot, PowerState};
use tracing::{debug, info, warn};

use crate::bridge::{BridgeError, DeviceControl};

/// Manufacturer reported for every accessory.
pub const MANUFACTURER: &str = "Hubspace";

/// Model reported when the device has no product name.
pub const DEFAULT_SWITCH_MODEL: &str = "Switch";

/// Registry-facing side of an accessory.
pub trait AccessoryHandle: Send + Sync + fmt::Debug {
    /// Device this accessory represents.
    fn device_id(&self) -> &DeviceId;

    /// Last power state applied.
    fn power(&self) -> PowerState;

    /// Applies `power` if it differs from the current value.
    ///
    /// Returns true if the accessory changed.
    fn apply_if_changed(&self, power: PowerState) -> bool;
}

/// Identity shown to the accessory host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessoryInfo {
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub display_name: String,
}

impl AccessoryInfo {
    /// Derives accessory identity from a device snapshot.
    pub fn from_snapshot(snapshot: &DeviceSnapshot) -> Self {
        Self {
            manufacturer: MANUFACTURER.to_string(),
            model: snapshot
                .product_name
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| DEFAULT_SWITCH_MODEL.to_string()),
            serial_number: snapshot.id.to_string(),
            display_name: snapshot.display_name().to_string(),
        }
    }
}

/// On/off switch accessory.
#[derive(Debug)]
pub struct SwitchAccessory {
    device_id: DeviceId,
    info: AccessoryInfo,
    on: AtomicBool,
}

impl SwitchAccessory {
    /// Builds a switch from a snapshot, or `None` for other device kinds.
    ///
    /// An unreadable power value starts the switch off.
    pub fn from_snapshot(snapshot: &DeviceSnapshot) -> Option<Self> {
        if !snapshot.kind.is_supported() {
            return None;
        }

        let power = snapshot.power_state().unwrap_or_else(|e| {
            warn!(device_id = %snapshot.id, error = %e, "Unreadable initial power, starting off");
            PowerState::Off
        });

        Some(Self {
            device_id: snapshot.id.clone(),
            info: AccessoryInfo::from_snapshot(snapshot),
            on: AtomicBool::new(power.is_on()),
        })
    }

    /// Accessory identity.
    pub fn info(&self) -> &AccessoryInfo {
        &self.info
    }

    /// Current on/off value.
    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    /// Handles a user-initiated change: records it locally, then asks the
    /// device to follow.
    ///
    /// The local value is kept even if the command fails; the next poll
    /// restores whatever the device actually reports.
    ///
    /// # Errors
    ///
    /// Any error from `control`.
    pub async fn set_on(&self, control: &dyn DeviceControl, on: bool) -> Result<(), BridgeError> {
        let power = PowerState::from_bool(on);
        self.on.store(on, Ordering::SeqCst);
        info!(device_id = %self.device_id, name = %self.info.display_name, %power, "Setting switch");

        control.set_power(&self.device_id, power).await.map(|_| ())
    }
}

impl AccessoryHandle for SwitchAccessory {
    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    fn power(&self) -> PowerState {
        PowerState::from_bool(self.is_on())
    }

    fn apply_if_changed(&self, power: PowerState) -> bool {
        let on = power.is_on();
        let changed = self
            .on
            .compare_exchange(!on, on, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if changed {
            debug!(device_id = %self.device_id, %power, "Switch state updated from device");
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use hsb_core::{DeviceKind, DeviceState};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    fn snapshot(id: &str, kind: DeviceKind, power: Option<PowerState>) -> DeviceSnapshot {
        DeviceSnapshot {
            id: DeviceId::new(id),
            kind,
            name: "Porch".to_string(),
            default_name: Some("Smart Switch".to_string()),
            product_name: None,
            nickname: None,
            state: power.map(DeviceState::with_power).unwrap_or_default(),
            observed_at: Utc::now(),
        }
    }

    #[derive(Default)]
    struct RecordingControl {
        calls: Mutex<Vec<(DeviceId, PowerState)>>,
    }

    #[async_trait]
    impl DeviceControl for RecordingControl {
        async fn set_power(
            &self,
            device_id: &DeviceId,
            power: PowerState,
        ) -> Result<Value, BridgeError> {
            self.calls.lock().unwrap().push((device_id.clone(), power));
            Ok(json!({"status": "ok"}))
        }
    }

    #[test]
    fn test_info_defaults() {
        let snap = snapshot("dev1", DeviceKind::Switch, None);
        let info = AccessoryInfo::from_snapshot(&snap);
        assert_eq!(info.manufacturer, "Hubspace");
        assert_eq!(info.model, "Switch");
        assert_eq!(info.serial_number, "dev1");
        assert_eq!(info.display_name, "Porch");
    }

    #[test]
    fn test_info_prefers_product_and_nickname() {
        let mut snap = snapshot("dev1", DeviceKind::Switch, None);
        snap.product_name = Some("HS-Switch-2".to_string());
        snap.nickname = Some("Garage".to_string());
        let info = AccessoryInfo::from_snapshot(&snap);
        assert_eq!(info.model, "HS-Switch-2");
        assert_eq!(info.display_name, "Garage");
    }

    #[test]
    fn test_only_switches_become_accessories() {
        assert!(SwitchAccessory::from_snapshot(&snapshot("a", DeviceKind::Switch, None)).is_some());
        assert!(SwitchAccessory::from_snapshot(&snapshot(
            "b",
            DeviceKind::Other("fan".to_string()),
            None
        ))
        .is_none());
    }

    #[test]
    fn test_apply_if_changed() {
        let switch =
            SwitchAccessory::from_snapshot(&snapshot("a", DeviceKind::Switch, Some(PowerState::Off)))
                .unwrap();
        assert_eq!(switch.power(), PowerState::Off);

        assert!(!switch.apply_if_changed(PowerState::Off));
        assert!(switch.apply_if_changed(PowerState::On));
        assert!(!switch.apply_if_changed(PowerState::On));
        assert!(switch.is_on());
    }

    #[test]
    fn test_invalid_initial_power_starts_off() {
        let mut snap = snapshot("a", DeviceKind::Switch, None);
        snap.state.power = Some(json!(42));
        let switch = SwitchAccessory::from_snapshot(&snap).unwrap();
        assert!(!switch.is_on());
    }

    #[tokio::test]
    async fn test_set_on_sends_command() {
        let control = RecordingControl::default();
        let switch =
            SwitchAccessory::from_snapshot(&snapshot("dev1", DeviceKind::Switch, None)).unwrap();

        switch.set_on(&control, true).await.unwrap();

        assert!(switch.is_on());
        assert_eq!(
            *control.calls.lock().unwrap(),
            vec![(DeviceId::new("dev1"), PowerState::On)]
        );
    }
}
