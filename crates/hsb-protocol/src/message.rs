//! Command types sent from the bridge to the worker.

use std::fmt;

use hsb_core::{DeviceId, PowerState};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Commands understood by the worker.
///
/// Serialized as a single JSON object tagged by `command`:
///
/// ```text
/// {"command":"login","email":"...","password":"..."}
/// {"command":"list_devices"}
/// {"command":"set_device_state","device_id":"...","state":{"power":"on"}}
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Authenticate the worker's cloud session
    Login {
        email: String,
        password: String,
    },

    /// Request the current device list
    ListDevices,

    /// Apply a partial state map to one device
    SetDeviceState {
        device_id: DeviceId,
        state: Map<String, Value>,
    },
}

impl Command {
    /// Creates a login command.
    pub fn login(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Login {
            email: email.into(),
            password: password.into(),
        }
    }

    /// Creates a list devices command.
    pub fn list_devices() -> Self {
        Self::ListDevices
    }

    /// Creates a set device state command.
    pub fn set_device_state(device_id: DeviceId, state: Map<String, Value>) -> Self {
        Self::SetDeviceState { device_id, state }
    }

    /// Creates a set device state command that only changes power.
    pub fn set_power(device_id: DeviceId, power: PowerState) -> Self {
        let mut state = Map::new();
        state.insert("power".to_string(), Value::String(power.as_str().to_string()));
        Self::SetDeviceState { device_id, state }
    }

    /// Returns the wire name of this command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Login { .. } => "login",
            Self::ListDevices => "list_devices",
            Self::SetDeviceState { .. } => "set_device_state",
        }
    }
}

// Credentials must never reach the logs.
impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Login { email, .. } => f
                .debug_struct("Login")
                .field("email", email)
                .field("password", &"<redacted>")
                .finish(),
            Self::ListDevices => f.write_str("ListDevices"),
            Self::SetDeviceState { device_id, state } => f
                .debug_struct("SetDeviceState")
                .field("device_id", device_id)
                .field("state", state)
                .finish(),
        }
    }
}
