//! Opt-in background cancellation of expired transfers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TransferHandler;
use crate::backend::now_secs;

/// Cancel every expired transfer of `handler`. Returns the number cancelled.
pub fn sweep_expired(handler: &dyn TransferHandler, now: u64) -> usize {
    let mut cancelled = 0;
    for transfer_id in handler.expired_transfers(now) {
        match handler.cancel_transfer(&transfer_id) {
            Ok(_) => {
                info!(transfer_id = %transfer_id, "Cancelled expired transfer");
                cancelled += 1;
            }
            // Completed or cancelled by the client in the meantime.
            Err(e) => debug!(transfer_id = %transfer_id, error = %e, "Expired transfer not cancelled"),
        }
    }
    cancelled
}

/// Spawn a task that sweeps `handler` every `interval` until `shutdown`
/// is cancelled.
pub fn spawn_expiry_sweeper(
    handler: Arc<dyn TransferHandler>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if interval.is_zero() {
            warn!("Expiry sweeper disabled: zero interval");
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Expiry sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let handler = Arc::clone(&handler);
                    // Cancelling touches the backend; keep it off the runtime threads.
                    let swept = tokio::task::spawn_blocking(move || {
                        sweep_expired(handler.as_ref(), now_secs())
                    })
                    .await;
                    if let Err(e) = swept {
                        warn!(error = %e, "Expiry sweep failed");
                    }
                }
            }
        }
    })
}
