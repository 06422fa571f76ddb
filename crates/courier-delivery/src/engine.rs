//! Webhook delivery engine with worker pool and reliability guarantees.
//!
//! The engine owns the worker pool, the lease reaper, the stats reporter
//! and the shared counters. Workers claim due attempts from the durable
//! queue, deliver them, and complete them through storage.
//!
//! ```text
//! ┌────────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ DeliveryEngine │──▶│ Worker Pool  │──▶│ HTTP Client │
//! └────────────────┘   └──────────────┘   └─────────────┘
//!        │                   │                   │
//!        ▼                   ▼                   ▼
//! ┌───────────────┐    ┌──────────────┐   ┌─────────────┐
//! │ Delivery      │    │ Lease        │   │ Subscriber  │
//! │ Queue         │    │ Reaper       │   │ Endpoints   │
//! └───────────────┘    └──────────────┘   └─────────────┘
//! ```

use std::{sync::Arc, time::Duration};

use courier_core::{models::DeliveryStats, storage::Storage, Clock};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    client::{ClientConfig, DeliveryClient},
    error::{DeliveryError, Result},
    in_flight::InFlightDeliveries,
    lease::LeaseReaper,
    retry::{RetryPolicy, RetryScheduler},
    stats::StatsReporter,
    storage::{DeliveryStorage, PostgresDeliveryStorage},
    worker::{DeliveryWorker, WorkerContext},
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Maximum attempts to claim per worker batch.
    pub batch_size: usize,

    /// How long an idle worker waits before polling again.
    pub poll_interval: Duration,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Backoff schedule and attempt budget.
    pub retry_policy: RetryPolicy,

    /// How long a claim stays valid. Must exceed the request timeout.
    pub lease_duration: Duration,

    /// How often the lease reaper sweeps.
    pub lease_sweep_interval: Duration,

    /// How often the stats reporter logs a storage snapshot.
    pub stats_interval: Duration,

    /// Grace period for in-flight deliveries on shutdown. Requests still on
    /// the wire afterwards are abandoned.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            client_config: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
            lease_duration: Duration::from_secs(crate::DEFAULT_LEASE_SECONDS),
            lease_sweep_interval: Duration::from_secs(15),
            stats_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DeliveryConfig {
    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` for a zero batch size, a lease not
    /// longer than the request timeout, or an invalid retry policy.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DeliveryError::configuration("batch_size must be at least 1"));
        }
        if self.lease_duration <= self.client_config.timeout {
            return Err(DeliveryError::configuration(format!(
                "lease duration {:?} must exceed delivery timeout {:?}",
                self.lease_duration, self.client_config.timeout
            )));
        }
        self.retry_policy.validate()
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Number of active delivery workers.
    pub active_workers: usize,
    /// Attempts completed since startup.
    pub attempts_processed: u64,
    /// Attempts answered with 2xx.
    pub delivered: u64,
    /// Failed attempts that got a successor.
    pub retried: u64,
    /// Failed attempts that exhausted the budget.
    pub dead_lettered: u64,
    /// Attempts cancelled because the subscription went inactive.
    pub cancelled: u64,
    /// Completions refused because the lease had been revoked.
    pub leases_lost: u64,
    /// Expired leases returned to pending.
    pub leases_released: u64,
    /// Attempts currently being delivered.
    pub in_flight: u64,
}

/// Main delivery engine coordinating webhook delivery workers.
pub struct DeliveryEngine {
    ctx: WorkerContext,
    worker_pool: Option<WorkerPool>,
}

impl DeliveryEngine {
    /// Creates an engine over any storage implementation.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the HTTP client
    /// cannot be initialized.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let client = Arc::new(DeliveryClient::new(config.client_config.clone())?);
        let scheduler = RetryScheduler::new(config.retry_policy.clone());

        let ctx = WorkerContext {
            storage,
            config,
            client,
            scheduler,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            abort_token: CancellationToken::new(),
            in_flight: InFlightDeliveries::new(),
            clock,
        };

        Ok(Self { ctx, worker_pool: None })
    }

    /// Creates an engine backed by PostgreSQL.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the HTTP client
    /// cannot be initialized.
    pub fn postgres(pool: PgPool, config: DeliveryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let storage = Arc::new(Storage::new(pool));
        Self::new(Arc::new(PostgresDeliveryStorage::new(storage)), config, clock)
    }

    /// Starts the delivery engine with configured worker pool.
    ///
    /// Returns immediately after spawning workers. Use `shutdown()` to stop
    /// gracefully, or drop the engine to cancel workers immediately.
    ///
    /// # Errors
    ///
    /// Returns error if the engine is already running or the worker pool
    /// fails to spawn.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::configuration("delivery engine already started"));
        }

        info!(
            worker_count = self.ctx.config.worker_count,
            batch_size = self.ctx.config.batch_size,
            lease_secs = self.ctx.config.lease_duration.as_secs(),
            "starting webhook delivery engine"
        );

        let mut worker_pool = WorkerPool::new(self.ctx.clone());
        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started successfully");
        Ok(())
    }

    /// Gracefully shuts down the delivery engine.
    ///
    /// Signals all workers to stop claiming and waits up to the configured
    /// shutdown timeout for in-flight deliveries to complete. Requests still
    /// running after that are abandoned and recovered by lease expiry.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers do not stop in time.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.ctx.config.shutdown_timeout).await?;
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
        }
        Ok(())
    }

    /// Returns true while started workers are running.
    pub fn is_running(&self) -> bool {
        self.worker_pool.as_ref().is_some_and(WorkerPool::has_active_workers)
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.ctx.stats.read().await.clone()
    }

    /// Returns the storage the engine works on.
    pub fn storage(&self) -> Arc<dyn DeliveryStorage> {
        self.ctx.storage.clone()
    }

    /// Returns the tracker of requests on the wire. A registry sharing it
    /// abandons a subscription's requests when deactivating it.
    pub fn in_flight(&self) -> InFlightDeliveries {
        self.ctx.in_flight.clone()
    }

    /// Reads queue depth, unreplayed dead letters and the outcomes of the
    /// last hour from storage.
    ///
    /// # Errors
    ///
    /// Returns error if the storage read fails.
    pub async fn delivery_stats(&self) -> Result<DeliveryStats> {
        StatsReporter::new(
            self.ctx.storage.clone(),
            self.ctx.clock.clone(),
            self.ctx.config.stats_interval,
            self.ctx.cancellation_token.clone(),
        )
        .snapshot()
        .await
    }

    /// Processes exactly one batch of due attempts synchronously.
    ///
    /// Claims one batch, executes every claimed attempt, and returns the
    /// number claimed. Does not start background workers.
    ///
    /// # Errors
    ///
    /// Returns error if claiming fails.
    pub async fn process_batch(&self) -> Result<usize> {
        DeliveryWorker::new(0, self.ctx.clone()).process_batch().await
    }

    /// Releases expired leases once, outside the reaper's schedule.
    ///
    /// # Errors
    ///
    /// Returns error if the storage update fails.
    pub async fn reap_expired_leases(&self) -> Result<u64> {
        LeaseReaper::new(
            self.ctx.storage.clone(),
            self.ctx.clock.clone(),
            self.ctx.stats.clone(),
            self.ctx.config.lease_sweep_interval,
            self.ctx.cancellation_token.clone(),
        )
        .sweep()
        .await
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{RealClock, TestClock};

    use super::*;
    use crate::storage::mock::MockDeliveryStorage;

    fn mock_engine(config: DeliveryConfig) -> Result<DeliveryEngine> {
        DeliveryEngine::new(
            Arc::new(MockDeliveryStorage::new()),
            config,
            Arc::new(TestClock::new()) as Arc<dyn Clock>,
        )
    }

    #[test]
    fn default_config_is_valid() {
        let config = DeliveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.client_config.timeout, Duration::from_secs(10));
    }

    #[test]
    fn lease_must_outlive_request_timeout() {
        let config =
            DeliveryConfig { lease_duration: Duration::from_secs(10), ..Default::default() };

        assert!(matches!(mock_engine(config), Err(DeliveryError::ConfigurationError { .. })));
    }

    #[tokio::test]
    async fn process_batch_on_empty_queue_claims_nothing() {
        let engine = mock_engine(DeliveryConfig::default()).unwrap();

        assert_eq!(engine.process_batch().await.unwrap(), 0);
        assert_eq!(engine.stats().await.attempts_processed, 0);
    }

    #[tokio::test]
    async fn engine_starts_and_shuts_down() {
        let mut engine = DeliveryEngine::new(
            Arc::new(MockDeliveryStorage::new()),
            DeliveryConfig {
                worker_count: 2,
                poll_interval: Duration::from_millis(20),
                shutdown_timeout: Duration::from_secs(2),
                ..Default::default()
            },
            Arc::new(RealClock::new()) as Arc<dyn Clock>,
        )
        .unwrap();

        engine.start().await.unwrap();
        assert!(engine.is_running());
        assert_eq!(engine.stats().await.active_workers, 2);
        assert!(engine.start().await.is_err());

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn delivery_stats_on_empty_store_are_zero() {
        let engine = mock_engine(DeliveryConfig::default()).unwrap();

        assert_eq!(engine.delivery_stats().await.unwrap(), DeliveryStats::default());
    }

    #[tokio::test]
    async fn shutdown_without_start_is_immediate() {
        let engine = mock_engine(DeliveryConfig::default()).unwrap();
        assert!(engine.shutdown().await.is_ok());
    }
}
