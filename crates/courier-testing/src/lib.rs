//! Test infrastructure for deterministic delivery tests.
//!
//! `TestEnv` wires the real registry, dispatcher, engine, dead-letter store
//! and audit log to in-memory storage and a `TestClock`, so a test can walk
//! an attempt through its whole retry schedule by advancing virtual time and
//! running one batch at a time.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use courier_core::{
    models::{DeliveryAttempt, DeliveryStatus, Event, Subscription},
    Clock,
};
use courier_delivery::{
    storage::{mock::MockDeliveryStorage, DeliveryStorage},
    AuditLog, DeadLetterStore, DeliveryConfig, DeliveryEngine, DispatchReport, EngineStats,
    EventDispatcher, RegistryConfig, SubscriptionRegistry, UrlValidator,
};

pub mod fixtures;
pub mod resolver;
pub mod subscriber;

pub use courier_core::TestClock;
pub use fixtures::{clip_event, SubscriptionBuilder};
pub use resolver::StaticResolver;
pub use subscriber::RecordingSubscriber;

/// Upper bound on batches `drain` runs before giving up.
const MAX_DRAIN_ROUNDS: usize = 1000;

/// Complete in-memory delivery environment.
pub struct TestEnv {
    /// Shared in-memory storage.
    pub storage: Arc<MockDeliveryStorage>,
    /// Virtual clock behind every component.
    pub clock: TestClock,
    /// DNS table used by the registry's URL validator.
    pub resolver: StaticResolver,
    engine: DeliveryEngine,
}

impl TestEnv {
    /// Creates an environment with the default delivery configuration and
    /// a short request timeout.
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be built.
    pub fn new() -> Result<Self> {
        Self::with_config(DeliveryConfig {
            worker_count: 1,
            poll_interval: Duration::from_millis(10),
            ..DeliveryConfig::default()
        })
    }

    /// Creates an environment with a custom delivery configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn with_config(config: DeliveryConfig) -> Result<Self> {
        let storage = Arc::new(MockDeliveryStorage::new());
        let clock = TestClock::new();
        let engine = DeliveryEngine::new(
            storage.clone() as Arc<dyn DeliveryStorage>,
            config,
            Arc::new(clock.clone()) as Arc<dyn Clock>,
        )
        .context("failed to build delivery engine")?;

        Ok(Self { storage, clock, resolver: StaticResolver::with_public_hosts(), engine })
    }

    fn dyn_storage(&self) -> Arc<dyn DeliveryStorage> {
        self.storage.clone()
    }

    fn dyn_clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    /// Registry validating URLs against `self.resolver`.
    pub fn registry(&self) -> SubscriptionRegistry {
        self.registry_with(RegistryConfig::default())
    }

    /// Registry with custom limits, sharing the engine's in-flight
    /// tracker.
    pub fn registry_with(&self, config: RegistryConfig) -> SubscriptionRegistry {
        SubscriptionRegistry::new(
            self.dyn_storage(),
            UrlValidator::new(Arc::new(self.resolver.clone())),
            self.dyn_clock(),
            config,
        )
        .with_in_flight(self.engine.in_flight())
    }

    /// Event dispatcher.
    pub fn dispatcher(&self) -> EventDispatcher {
        EventDispatcher::new(self.dyn_storage(), self.dyn_clock())
    }

    /// Dead-letter store.
    pub fn dead_letters(&self) -> DeadLetterStore {
        DeadLetterStore::new(self.dyn_storage(), self.dyn_clock())
    }

    /// Audit log.
    pub fn audit_log(&self) -> AuditLog {
        AuditLog::new(self.dyn_storage())
    }

    /// The delivery engine.
    pub fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    /// Inserts a subscription pointing at `url`, bypassing validation.
    pub async fn seed_subscription(&self, url: impl Into<String>, events: &[&str]) -> Subscription {
        let subscription = SubscriptionBuilder::new(url).events(events).build(self.clock.now_utc());
        self.storage.add_subscription(subscription.clone()).await;
        subscription
    }

    /// Dispatches a fresh `event_type` event stamped now.
    ///
    /// # Errors
    ///
    /// Returns error if dispatch fails.
    pub async fn dispatch(&self, event_type: &str) -> Result<(Event, DispatchReport)> {
        let event = clip_event(event_type, self.clock.now_utc());
        let report = self.dispatcher().dispatch(&event).await?;
        Ok((event, report))
    }

    /// Runs one engine batch. Returns the number of attempts claimed.
    ///
    /// # Errors
    ///
    /// Returns error if claiming fails.
    pub async fn process_batch(&self) -> Result<usize> {
        self.engine.process_batch().await.context("failed to process batch")
    }

    /// Runs batches until nothing is due now.
    ///
    /// # Errors
    ///
    /// Returns error if a batch fails or the queue never drains.
    pub async fn drain(&self) -> Result<usize> {
        let mut total = 0;
        for _ in 0..MAX_DRAIN_ROUNDS {
            let claimed = self.process_batch().await?;
            if claimed == 0 {
                return Ok(total);
            }
            total += claimed;
        }
        anyhow::bail!("queue did not drain after {MAX_DRAIN_ROUNDS} batches")
    }

    /// Moves the clock to the earliest pending attempt, if any is in the
    /// future. Returns true if a pending attempt exists.
    pub async fn advance_to_next_attempt(&self) -> bool {
        let next = self
            .storage
            .attempts()
            .await
            .into_iter()
            .filter(|a| a.status == DeliveryStatus::Pending)
            .map(|a| a.scheduled_at)
            .min();

        match next {
            Some(at) => {
                let now = self.clock.now_utc();
                if let Ok(gap) = (at - now).to_std() {
                    self.clock.advance(gap);
                }
                true
            },
            None => false,
        }
    }

    /// Alternates `drain` and `advance_to_next_attempt` until no attempt is
    /// pending. Returns the number of attempts executed.
    ///
    /// # Errors
    ///
    /// Returns error if a batch fails.
    pub async fn run_to_completion(&self) -> Result<usize> {
        let mut total = self.drain().await?;
        while self.advance_to_next_attempt().await {
            total += self.drain().await?;
        }
        Ok(total)
    }

    /// Current virtual time.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }

    /// Moves virtual time forward.
    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Every attempt in insertion order.
    pub async fn attempts(&self) -> Vec<DeliveryAttempt> {
        self.storage.attempts().await
    }

    /// Engine counters.
    pub async fn stats(&self) -> EngineStats {
        self.engine.stats().await
    }
}
