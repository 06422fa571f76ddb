//! Outbound webhook delivery pipeline.
//!
//! Events flow through five stages:
//!
//! 1. **Registry** - owners register subscriber URLs, validated against
//!    internal address ranges, and receive a signing secret
//! 2. **Dispatch** - an event becomes one pending attempt per matching
//!    active subscription
//! 3. **Delivery** - a worker pool claims due attempts with a lease, signs
//!    the body with HMAC-SHA256 and POSTs it
//! 4. **Retry** - failures reschedule on a fixed backoff until the attempt
//!    budget runs out, then land in the dead-letter store
//! 5. **Audit** - every execution, cancellation and replay is appended to
//!    the audit log in the same transaction as the state change
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::RealClock;
//! use courier_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError};
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> std::result::Result<(), DeliveryError> {
//! let mut engine =
//!     DeliveryEngine::postgres(pool, DeliveryConfig::default(), Arc::new(RealClock::new()))?;
//!
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod audit;
pub mod client;
pub mod dead_letter;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod in_flight;
pub mod lease;
pub mod registry;
pub mod retry;
pub mod signing;
pub mod stats;
pub mod storage;
pub mod validation;
pub mod worker;
pub mod worker_pool;

pub use audit::AuditLog;
pub use client::{ClientConfig, DeliveryClient};
pub use dead_letter::DeadLetterStore;
pub use dispatcher::{DispatchReport, EventDispatcher};
pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats};
pub use error::{DeliveryError, ErrorClass, RegistryError, Result};
pub use in_flight::InFlightDeliveries;
pub use registry::{RegistryConfig, SubscriptionRegistry};
pub use retry::{RetryPolicy, RetryScheduler};
pub use signing::verify_signature;
pub use stats::StatsReporter;
pub use storage::{DeliveryStorage, PostgresDeliveryStorage};
pub use validation::{Resolver, SystemResolver, UrlValidator, SUPPORTED_EVENTS};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default batch size for claiming attempts.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default lease on a claimed attempt, in seconds.
pub const DEFAULT_LEASE_SECONDS: u64 = 60;
