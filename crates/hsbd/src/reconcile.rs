//! Periodic reconciliation of accessories with device state.
//!
//! Every interval the reconciler fetches a fresh device list and hands it to
//! the registry, which updates only accessories whose power differs. The
//! first poll happens one interval after start; startup already read the
//! list once.
//!
//! A poll that is still running when the next tick is due causes that tick
//! to be skipped, so polls never overlap.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Poll failures are logged and the loop keeps going

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeError, DeviceSource};
use crate::config::MAX_POLL_INTERVAL_SECS;
use crate::registry::{ReconcileSummary, RegistryError, RegistryHandle};

/// Why one reconciliation pass failed.
#[derive(Debug, Clone, Error)]
pub enum ReconcileError {
    #[error("device list unavailable: {0}")]
    Source(#[from] BridgeError),

    #[error("registry unavailable: {0}")]
    Registry(#[from] RegistryError),
}

/// Runs one poll and applies it.
///
/// # Errors
///
/// `ReconcileError` if the list could not be fetched or the registry is gone.
pub async fn reconcile_once(
    source: &dyn DeviceSource,
    registry: &RegistryHandle,
) -> Result<ReconcileSummary, ReconcileError> {
    let snapshots = source.list_devices().await?;
    Ok(registry.reconcile(snapshots).await?)
}

/// Spawns the reconciliation loop.
///
/// Stops when `cancel_token` is cancelled, abandoning any poll in flight.
/// `period` is clamped to between 1ms and [`MAX_POLL_INTERVAL_SECS`].
pub fn spawn_reconciler(
    source: Arc<dyn DeviceSource>,
    registry: RegistryHandle,
    period: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    let period = clamp_period(period);

    tokio::spawn(async move {
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = period.as_secs(), "Reconciler started");

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Reconciler shutting down");
                    break;
                }

                _ = tick.tick() => {
                    let outcome = tokio::select! {
                        biased;
                        _ = cancel_token.cancelled() => None,
                        result = reconcile_once(source.as_ref(), &registry) => Some(result),
                    };

                    match outcome {
                        None => {
                            info!("Reconciler shutting down during poll");
                            break;
                        }
                        Some(Ok(summary)) => log_summary(&summary),
                        Some(Err(e)) => warn!(error = %e, "Reconciliation poll failed"),
                    }
                }
            }
        }

        debug!("Reconciler task completed");
    })
}

fn clamp_period(period: Duration) -> Duration {
    period.clamp(
        Duration::from_millis(1),
        Duration::from_secs(MAX_POLL_INTERVAL_SECS),
    )
}

fn log_summary(summary: &ReconcileSummary) {
    if summary.updated > 0 {
        info!(
            seen = summary.seen,
            updated = summary.updated,
            "Applied device state changes"
        );
    } else {
        debug!(
            seen = summary.seen,
            unknown = summary.unknown,
            invalid = summary.invalid,
            "Poll complete, no changes"
        );
    }
}
