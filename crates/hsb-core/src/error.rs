//! Domain-specific error types following panic-free policy.

use crate::DeviceId;
use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Device snapshot without a usable identifier
    #[error("Device is missing an identifier")]
    MissingDeviceId,

    /// A power value that is neither "on"/"off" nor a boolean
    #[error("Invalid power value for {device_id}: {value}")]
    InvalidPower { device_id: DeviceId, value: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
