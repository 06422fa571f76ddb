//! Lease reaper.
//!
//! A claimed attempt carries a lease. If its worker dies or stalls past
//! `lease_expires_at`, the reaper returns the attempt to `pending` with its
//! attempt number unchanged, so the crash does not consume a retry.

use std::{sync::Arc, time::Duration};

use courier_core::Clock;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{engine::EngineStats, error::Result, storage::DeliveryStorage};

/// Periodically releases expired leases.
pub struct LeaseReaper {
    storage: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
    stats: Arc<RwLock<EngineStats>>,
    interval: Duration,
    cancellation_token: CancellationToken,
}

impl LeaseReaper {
    /// Creates a reaper sweeping every `interval`.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        clock: Arc<dyn Clock>,
        stats: Arc<RwLock<EngineStats>>,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { storage, clock, stats, interval, cancellation_token }
    }

    /// Sweeps until cancelled.
    ///
    /// # Errors
    ///
    /// Never returns an error; sweep failures are logged and retried on the
    /// next tick.
    pub async fn run(&self) -> Result<()> {
        info!(interval_secs = self.interval.as_secs(), "lease reaper starting");

        loop {
            tokio::select! {
                () = self.clock.sleep(self.interval) => {}
                () = self.cancellation_token.cancelled() => break,
            }

            if let Err(error) = self.sweep().await {
                error!(error = %error, "lease sweep failed");
            }
        }

        info!("lease reaper stopped");
        Ok(())
    }

    /// Releases every lease that expired before now. Returns the count.
    ///
    /// # Errors
    ///
    /// Returns error if the storage update fails.
    pub async fn sweep(&self) -> Result<u64> {
        let released = self.storage.release_expired_leases(self.clock.now_utc()).await?;

        if released > 0 {
            warn!(released, "released expired delivery leases");
            self.stats.write().await.leases_released += released;
        } else {
            debug!("no expired leases");
        }

        Ok(released)
    }
}
