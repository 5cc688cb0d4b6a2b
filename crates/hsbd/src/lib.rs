//! HSB Daemon - Hubspace worker bridge
//!
//! This crate provides the infrastructure between the accessory platform
//! and the worker process that talks to the Hubspace cloud:
//! - `supervisor` - Environment preflight and worker process lifecycle
//! - `bridge` - FIFO correlation queue and the device command surface
//! - `registry` - Accessory registry actor keyed by device id
//! - `reconcile` - Periodic poll that applies state deltas to accessories
//! - `platform` - Startup orchestration tying the pieces together
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          hsbd                                │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────┐   request()   ┌──────────────────────┐     │
//! │  │  Reconciler  │──────────────▶│       Bridge         │     │
//! │  │ (interval)   │               │  (CorrelationQueue)  │     │
//! │  └──────┬───────┘               └──────────┬───────────┘     │
//! │         │ reconcile                        │ stdin / stdout  │
//! │         ▼                                  ▼                 │
//! │  ┌──────────────┐               ┌──────────────────────┐     │
//! │  │RegistryActor │               │  WorkerSupervisor    │     │
//! │  │ (accessories)│               │  (child process)     │     │
//! │  └──────────────┘               └──────────────────────┘     │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod accessory;
pub mod bridge;
pub mod config;
pub mod platform;
pub mod reconcile;
pub mod registry;
pub mod supervisor;
