//! Interpretation of worker replies.
//!
//! Replies are arbitrary JSON. Success is `{"status":"ok", ...}`; failure is
//! signalled by an `error` field, a non-`"ok"` status, or one of the worker's
//! ad-hoc error keys (`"Unknown Error"`, `"JSON Error"`, ...), which all end
//! in `Error`.

use chrono::Utc;
use hsb_core::DeviceSnapshot;
use serde_json::Value;
use thiserror::Error;

use crate::parse::RawDevice;

/// Command-level failures decoded from a reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    /// The worker reported an error for this command
    #[error("worker reported: {0}")]
    Reported(String),

    /// The reply carried a status other than "ok"
    #[error("unexpected status: {0}")]
    Status(String),

    /// The reply had the wrong JSON shape for this command
    #[error("expected {expected}, got {got}")]
    Shape {
        expected: &'static str,
        got: String,
    },
}

/// A device entry that could not be turned into a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDevice {
    /// Position in the reply array
    pub index: usize,
    /// Why it was skipped
    pub reason: String,
}

/// Decoded `list_devices` reply.
#[derive(Debug, Clone, Default)]
pub struct DeviceList {
    /// Snapshots in reply order
    pub devices: Vec<DeviceSnapshot>,
    /// Entries that were malformed
    pub skipped: Vec<SkippedDevice>,
}

/// Returns the worker-reported error text, if the reply carries one.
///
/// Looks at `error` first, then at any top-level key ending in `Error`.
pub fn reported_error(reply: &Value) -> Option<String> {
    let obj = reply.as_object()?;

    if let Some(err) = obj.get("error").filter(|v| !v.is_null()) {
        return Some(value_text(err));
    }

    obj.iter()
        .find(|(key, value)| key.ends_with("Error") && !value.is_null())
        .map(|(key, value)| format!("{key}: {}", value_text(value)))
}

/// Checks an acknowledgement reply (`login`, `set_device_state`).
///
/// # Errors
///
/// - `ReplyError::Reported` if the reply carries an error
/// - `ReplyError::Status` if `status` is missing or not `"ok"`
/// - `ReplyError::Shape` if the reply is not an object
pub fn check_ack(reply: &Value) -> Result<(), ReplyError> {
    if let Some(err) = reported_error(reply) {
        return Err(ReplyError::Reported(err));
    }

    let obj = reply.as_object().ok_or_else(|| ReplyError::Shape {
        expected: "object",
        got: shape_of(reply).to_string(),
    })?;

    match obj.get("status") {
        Some(Value::String(s)) if s == "ok" => Ok(()),
        Some(other) => Err(ReplyError::Status(value_text(other))),
        None => Err(ReplyError::Status("<missing>".to_string())),
    }
}

/// Decodes a `list_devices` reply.
///
/// The canonical shape is a bare JSON array of device objects. An object
/// with a `devices` field is a different protocol revision and is rejected
/// rather than silently accepted.
///
/// # Errors
///
/// - `ReplyError::Reported` if the worker returned an error object
/// - `ReplyError::Shape` for any non-array reply
pub fn parse_device_list(reply: Value) -> Result<DeviceList, ReplyError> {
    let entries = match reply {
        Value::Array(entries) => entries,
        other => {
            if let Some(err) = reported_error(&other) {
                return Err(ReplyError::Reported(err));
            }
            let got = if other.get("devices").is_some() {
                "object with `devices` envelope".to_string()
            } else {
                shape_of(&other).to_string()
            };
            return Err(ReplyError::Shape {
                expected: "array of devices",
                got,
            });
        }
    };

    let observed_at = Utc::now();
    let mut list = DeviceList::default();

    for (index, entry) in entries.into_iter().enumerate() {
        let parsed = serde_json::from_value::<RawDevice>(entry)
            .map_err(|e| e.to_string())
            .and_then(|raw| raw.into_snapshot(observed_at).map_err(|e| e.to_string()));

        match parsed {
            Ok(snapshot) => list.devices.push(snapshot),
            Err(reason) => list.skipped.push(SkippedDevice { index, reason }),
        }
    }

    Ok(list)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn shape_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
