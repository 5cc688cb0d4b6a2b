//! Parsing worker device JSON structures.

use chrono::{DateTime, Utc};
use hsb_core::{DeviceId, DeviceKind, DeviceSnapshot, DeviceState, DomainError, DomainResult};
use serde::Deserialize;

/// Raw device entry as emitted by the worker's `list_devices` reply.
///
/// Every field is optional so that one incomplete entry can be reported
/// without failing the whole list. `id` is canonical; `device_id` is
/// accepted as a fallback because older worker revisions only sent that.
#[derive(Debug, Clone, Deserialize)]
pub struct RawDevice {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub default_name: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub state: Option<DeviceState>,
}

impl RawDevice {
    /// Returns the identifier, preferring `id` over `device_id`.
    pub fn device_id(&self) -> Option<DeviceId> {
        self.id
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.device_id.as_deref().filter(|s| !s.is_empty()))
            .map(DeviceId::new)
    }

    /// Converts the raw entry into an immutable snapshot.
    ///
    /// # Errors
    ///
    /// `DomainError::MissingDeviceId` if neither `id` nor `device_id` is set.
    pub fn into_snapshot(self, observed_at: DateTime<Utc>) -> DomainResult<DeviceSnapshot> {
        let id = self.device_id().ok_or(DomainError::MissingDeviceId)?;
        let kind = self
            .kind
            .map(DeviceKind::from)
            .unwrap_or_else(|| DeviceKind::Other("unknown".to_string()));

        Ok(DeviceSnapshot {
            id,
            kind,
            name: self.name.unwrap_or_default(),
            default_name: self.default_name,
            product_name: self.product_name,
            nickname: self.nickname,
            state: self.state.unwrap_or_default(),
            observed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsb_core::PowerState;
    use serde_json::json;

    #[test]
    fn test_parse_worker_entry() {
        let raw: RawDevice = serde_json::from_value(json!({
            "id": "abc",
            "device_id": "abc",
            "default_name": "Smart Switch",
            "name": "Porch",
            "type": "switch",
            "state": {"power": "on"}
        }))
        .unwrap();

        let snap = raw.into_snapshot(Utc::now()).unwrap();
        assert_eq!(snap.id.as_str(), "abc");
        assert_eq!(snap.kind, DeviceKind::Switch);
        assert_eq!(snap.name, "Porch");
        assert_eq!(snap.default_name.as_deref(), Some("Smart Switch"));
        assert_eq!(snap.power_state(), Ok(PowerState::On));
    }

    #[test]
    fn test_device_id_fallback() {
        let raw: RawDevice =
            serde_json::from_value(json!({"device_id": "legacy", "type": "switch"})).unwrap();
        assert_eq!(raw.device_id(), Some(DeviceId::new("legacy")));
    }

    #[test]
    fn test_missing_id_rejected() {
        let raw: RawDevice = serde_json::from_value(json!({"id": "", "type": "switch"})).unwrap();
        assert_eq!(
            raw.into_snapshot(Utc::now()).unwrap_err(),
            DomainError::MissingDeviceId
        );
    }

    #[test]
    fn test_missing_type_and_state_default() {
        let raw: RawDevice = serde_json::from_value(json!({"id": "x"})).unwrap();
        let snap = raw.into_snapshot(Utc::now()).unwrap();
        assert_eq!(snap.kind, DeviceKind::Other("unknown".to_string()));
        assert_eq!(snap.state, DeviceState::default());
        assert_eq!(snap.power_state(), Ok(PowerState::Off));
    }
}
