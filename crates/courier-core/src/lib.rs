//! Core domain models, clock and persistence for courier.
//!
//! Provides the strongly-typed records of the webhook delivery pipeline
//! (subscriptions, events, attempts, dead letters, audit entries), the
//! `Clock` abstraction every timestamp flows through, and the PostgreSQL
//! repositories behind the delivery queue.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    AttemptCompletion, AttemptId, AttemptOutcome, AuditAction, AuditEntry, AuditEntryId,
    AuditFilter, CompletionResult, DeadLetterEntry, DeadLetterFilter, DeadLetterId,
    DeliveryAttempt, DeliveryStats, DeliveryStatus, Disposition, Event, EventId, OwnerId, Page,
    Pagination, Secret, Subscription, SubscriptionId, SubscriptionUpdate,
};
pub use time::{Clock, RealClock, TestClock};
