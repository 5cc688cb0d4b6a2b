//! HSB Core - Shared types for the Hubspace worker bridge
//!
//! This crate provides the device domain types shared between
//! the wire protocol (hsb-protocol) and the daemon (hsbd).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod device;
pub mod error;

// Re-exports for convenience
pub use device::{DeviceId, DeviceKind, DeviceSnapshot, DeviceState, PowerState};
pub use error::{DomainError, DomainResult};
