//! Device domain entities and value objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::{DomainError, DomainResult};

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Stable identifier for a Hubspace device.
///
/// Reported by the worker as `id` (older revisions also send `device_id`
/// with the same value). Used as the accessory registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a new DeviceId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the identifier is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Device Kind
// ============================================================================

/// Device class reported by the worker (`type` field).
///
/// Only switches are mapped to accessories; everything else is carried
/// through so it can be reported as unsupported.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceKind {
    /// On/off switch
    Switch,

    /// Any other device class, kept verbatim
    Other(String),
}

impl DeviceKind {
    /// Returns the wire tag for this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Switch => "switch",
            Self::Other(tag) => tag.as_str(),
        }
    }

    /// Returns true if the bridge exposes this kind as an accessory.
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Switch)
    }
}

impl From<String> for DeviceKind {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "switch" => Self::Switch,
            _ => Self::Other(s),
        }
    }
}

impl From<DeviceKind> for String {
    fn from(kind: DeviceKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Power State
// ============================================================================

/// Logical on/off value of a switch-type device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    /// Converts a boolean accessory value to a power state.
    pub fn from_bool(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }

    /// Returns true for `On`.
    pub fn is_on(self) -> bool {
        matches!(self, Self::On)
    }

    /// Returns the wire value sent to the worker.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Device State
// ============================================================================

/// Nested state map of a device snapshot.
///
/// `power` is pulled out because reconciliation depends on it; every other
/// key is preserved untouched in `other`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Raw power value: `"on"`, `"off"`, a boolean, or null when the worker
    /// could not read it.
    #[serde(default)]
    pub power: Option<Value>,

    /// Remaining state fields
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl DeviceState {
    /// Creates a state map carrying only a power value.
    pub fn with_power(power: PowerState) -> Self {
        Self {
            power: Some(Value::String(power.as_str().to_string())),
            other: Map::new(),
        }
    }

    /// Interprets the raw power value.
    ///
    /// Missing or null power reads as `Off`, matching how the accessory
    /// treats "not reported as on".
    ///
    /// # Errors
    ///
    /// `DomainError::InvalidPower` when the value is present but is neither a
    /// recognised string nor a boolean.
    pub fn power_state(&self, device_id: &DeviceId) -> DomainResult<PowerState> {
        match &self.power {
            None | Some(Value::Null) => Ok(PowerState::Off),
            Some(Value::Bool(on)) => Ok(PowerState::from_bool(*on)),
            Some(Value::String(s)) if s.eq_ignore_ascii_case("on") => Ok(PowerState::On),
            Some(Value::String(s)) if s.eq_ignore_ascii_case("off") => Ok(PowerState::Off),
            Some(other) => Err(DomainError::InvalidPower {
                device_id: device_id.clone(),
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// Device Snapshot
// ============================================================================

/// One device's reported state at poll time.
///
/// Produced fresh from every `list_devices` reply and never mutated.
/// Reconciliation diffs against the accessory's last-applied value, not
/// against an earlier snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub id: DeviceId,
    pub kind: DeviceKind,
    pub name: String,
    pub default_name: Option<String>,
    pub product_name: Option<String>,
    pub nickname: Option<String>,
    pub state: DeviceState,
    /// When the bridge decoded this snapshot
    pub observed_at: DateTime<Utc>,
}

impl DeviceSnapshot {
    /// Name shown to the user: nickname, then name, then default name,
    /// then the id.
    pub fn display_name(&self) -> &str {
        self.nickname
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(Some(self.name.as_str()).filter(|s| !s.is_empty()))
            .or(self.default_name.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or(self.id.as_str())
    }

    /// Logical power state of this snapshot.
    ///
    /// # Errors
    ///
    /// See [`DeviceState::power_state`].
    pub fn power_state(&self) -> DomainResult<PowerState> {
        self.state.power_state(&self.id)
    }
}
