//! Worker pool management with structured concurrency.
//!
//! Provides lifecycle management and graceful shutdown for the delivery
//! workers, the lease reaper and the stats reporter.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    lease::LeaseReaper,
    stats::StatsReporter,
    worker::{DeliveryWorker, WorkerContext},
};

/// Worker pool that manages delivery worker tasks with supervision.
///
/// `shutdown_graceful` cancels the stop token, which ends claiming, and
/// waits for in-flight deliveries up to a timeout. Only then is the abort
/// token cancelled; requests still running are abandoned and their leases
/// recover the attempts.
pub struct WorkerPool {
    ctx: WorkerContext,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    background_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool with the given context.
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx, worker_handles: Vec::new(), background_handles: Vec::new() }
    }

    /// Spawn all configured workers, the lease reaper and the stats
    /// reporter.
    ///
    /// Returns immediately after spawning.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the pool is configured with zero
    /// workers.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        let worker_count = self.ctx.config.worker_count;
        if worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }

        info!(worker_count, "spawning delivery workers");

        self.ctx.stats.write().await.active_workers = worker_count;

        for worker_id in 0..worker_count {
            let worker = DeliveryWorker::new(worker_id, self.ctx.clone());

            let handle = tokio::spawn(async move {
                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(
                        worker_id,
                        error = %error,
                        "delivery worker terminated with error"
                    );
                }

                result
            });

            self.worker_handles.push(handle);
        }

        let reaper = LeaseReaper::new(
            self.ctx.storage.clone(),
            self.ctx.clock.clone(),
            self.ctx.stats.clone(),
            self.ctx.config.lease_sweep_interval,
            self.ctx.cancellation_token.clone(),
        );
        self.background_handles.push(tokio::spawn(async move { reaper.run().await }));

        let reporter = StatsReporter::new(
            self.ctx.storage.clone(),
            self.ctx.clock.clone(),
            self.ctx.config.stats_interval,
            self.ctx.cancellation_token.clone(),
        );
        self.background_handles.push(tokio::spawn(async move { reporter.run().await }));

        info!(spawned_workers = self.worker_handles.len(), "all delivery workers spawned");

        Ok(())
    }

    /// Gracefully shutdown all workers, waiting for in-flight deliveries to
    /// complete.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if tasks are still running after `timeout`.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.ctx.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let background = std::mem::take(&mut self.background_handles);
        let stats = self.ctx.stats.clone();

        let shutdown_future = async move {
            let mut failures = 0usize;

            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker completed with error during shutdown");
                    },
                    Err(join_error) => {
                        let panic = DeliveryError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        };
                        error!(error = %panic, "worker task panicked during shutdown");
                        failures += 1;
                    },
                }
            }

            for handle in background {
                if let Err(join_error) = handle.await {
                    error!(error = %join_error, "background task panicked during shutdown");
                    failures += 1;
                }
            }

            stats.write().await.active_workers = 0;

            failures
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(failures) => {
                if failures > 0 {
                    warn!(failures, "some tasks panicked during shutdown");
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, abandoning in-flight deliveries"
                );
                self.ctx.abort_token.cancel();
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Check if any workers are still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }

    /// Number of spawned workers.
    pub fn worker_count(&self) -> usize {
        self.worker_handles.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 && !self.ctx.cancellation_token.is_cancelled() {
            error!(
                active_workers = active_count,
                "worker pool dropped with active workers, forcing cancellation"
            );
            self.ctx.cancellation_token.cancel();
            self.ctx.abort_token.cancel();
            warn!("call shutdown_graceful() before dropping the worker pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use courier_core::{Clock, RealClock};
    use tokio::sync::RwLock;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        client::DeliveryClient,
        engine::{DeliveryConfig, EngineStats},
        in_flight::InFlightDeliveries,
        retry::RetryScheduler,
        storage::mock::MockDeliveryStorage,
    };

    fn context(config: DeliveryConfig) -> WorkerContext {
        WorkerContext {
            storage: Arc::new(MockDeliveryStorage::new()),
            client: Arc::new(DeliveryClient::new(config.client_config.clone()).unwrap()),
            scheduler: RetryScheduler::new(config.retry_policy.clone()),
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            abort_token: CancellationToken::new(),
            in_flight: InFlightDeliveries::new(),
            clock: Arc::new(RealClock::new()) as Arc<dyn Clock>,
        }
    }

    #[tokio::test]
    async fn worker_pool_spawns_configured_number_of_workers() {
        let config = DeliveryConfig {
            worker_count: 5,
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let ctx = context(config);
        let stats = ctx.stats.clone();
        let mut pool = WorkerPool::new(ctx);

        pool.spawn_workers().await.unwrap();

        assert_eq!(pool.worker_count(), 5);
        assert!(pool.has_active_workers());
        assert_eq!(stats.read().await.active_workers, 5);

        pool.shutdown_graceful(Duration::from_secs(1)).await.unwrap();
        assert_eq!(stats.read().await.active_workers, 0);
    }

    #[tokio::test]
    async fn zero_workers_is_rejected() {
        let mut pool =
            WorkerPool::new(context(DeliveryConfig { worker_count: 0, ..Default::default() }));

        assert!(matches!(
            pool.spawn_workers().await,
            Err(DeliveryError::ConfigurationError { .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_without_spawn_completes_immediately() {
        let pool = WorkerPool::new(context(DeliveryConfig::default()));

        assert!(pool.shutdown_graceful(Duration::from_millis(1)).await.is_ok());
    }

    #[tokio::test]
    async fn drop_cancels_running_workers() {
        let ctx = context(DeliveryConfig {
            worker_count: 2,
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        });
        let token = ctx.cancellation_token.clone();
        let abort = ctx.abort_token.clone();
        let mut pool = WorkerPool::new(ctx);
        pool.spawn_workers().await.unwrap();

        drop(pool);

        assert!(token.is_cancelled());
        assert!(abort.is_cancelled());
    }

    #[tokio::test]
    async fn graceful_shutdown_leaves_abort_token_alone() {
        let ctx = context(DeliveryConfig {
            worker_count: 1,
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        });
        let abort = ctx.abort_token.clone();
        let mut pool = WorkerPool::new(ctx);
        pool.spawn_workers().await.unwrap();

        pool.shutdown_graceful(Duration::from_secs(1)).await.unwrap();

        assert!(!abort.is_cancelled());
    }
}
