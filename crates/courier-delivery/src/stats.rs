//! Delivery statistics read from storage.
//!
//! `EngineStats` counts what this process did since startup. The reporter
//! reads the durable view instead: queue depth, unreplayed dead letters and
//! the outcomes of the last hour across every process sharing the store.

use std::{sync::Arc, time::Duration};

use courier_core::{models::DeliveryStats, Clock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{error::Result, storage::DeliveryStorage};

/// Window for the recent outcome counts.
pub const RECENT_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Periodically logs a storage-backed statistics snapshot.
pub struct StatsReporter {
    storage: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    cancellation_token: CancellationToken,
}

impl StatsReporter {
    /// Creates a reporter logging every `interval`.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { storage, clock, interval, cancellation_token }
    }

    /// Reports until cancelled.
    ///
    /// # Errors
    ///
    /// Never returns an error; failed reads are logged and retried on the
    /// next tick.
    pub async fn run(&self) -> Result<()> {
        info!(interval_secs = self.interval.as_secs(), "stats reporter starting");

        loop {
            tokio::select! {
                () = self.clock.sleep(self.interval) => {}
                () = self.cancellation_token.cancelled() => break,
            }

            match self.snapshot().await {
                Ok(stats) => info!(
                    active_subscriptions = stats.active_subscriptions,
                    pending_attempts = stats.pending_attempts,
                    in_flight_attempts = stats.in_flight_attempts,
                    dead_letters = stats.dead_letters,
                    recent_delivered = stats.recent_delivered,
                    recent_failed = stats.recent_failed,
                    "delivery stats"
                ),
                Err(error) => error!(error = %error, "failed to read delivery stats"),
            }
        }

        info!("stats reporter stopped");
        Ok(())
    }

    /// Reads the current statistics.
    ///
    /// # Errors
    ///
    /// Returns error if the storage read fails.
    pub async fn snapshot(&self) -> Result<DeliveryStats> {
        let window = chrono::Duration::from_std(RECENT_WINDOW).unwrap_or(chrono::Duration::hours(1));
        let stats = self.storage.delivery_stats(self.clock.now_utc() - window).await?;
        Ok(stats)
    }
}
