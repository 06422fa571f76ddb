//! Event dispatcher.
//!
//! Fans an event out to every active subscription registered for its type by
//! enqueueing one pending attempt per subscription. Dispatch is idempotent
//! per event id: the `(subscription, event, generation, attempt_number)`
//! key rejects the duplicate insert, so re-dispatching enqueues nothing.

use std::sync::Arc;

use courier_core::{
    models::{DeliveryAttempt, Event},
    Clock,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::{error::RegistryError, storage::DeliveryStorage};

/// What a dispatch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Active subscriptions registered for the event type.
    pub matched: usize,
    /// Attempts actually enqueued. Lower than `matched` on re-dispatch or
    /// when a subscription was deactivated concurrently.
    pub enqueued: usize,
}

/// Turns domain events into pending delivery attempts.
#[derive(Clone)]
pub struct EventDispatcher {
    storage: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
}

impl EventDispatcher {
    /// Creates a dispatcher.
    pub fn new(storage: Arc<dyn DeliveryStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Stores `event` and enqueues attempt 1 for every matching active
    /// subscription, due immediately.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the event or an attempt cannot be written.
    /// Attempts enqueued before the failure stay enqueued; dispatching the
    /// same event again fills in the rest.
    pub async fn dispatch(&self, event: &Event) -> Result<DispatchReport, RegistryError> {
        if !self.storage.store_event(event).await? {
            debug!(event_id = %event.id, "event already stored, re-dispatching");
        }

        let subscriptions = self.storage.find_active_subscriptions(&event.event_type).await?;
        let now = self.clock.now_utc();

        let mut report = DispatchReport { matched: subscriptions.len(), enqueued: 0 };
        for subscription in subscriptions {
            let attempt =
                DeliveryAttempt::pending(subscription.id, event.id, event.event_type.clone(), 0, 1, now);
            if self.storage.enqueue_attempt(&attempt).await? {
                report.enqueued += 1;
            }
        }

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            matched = report.matched,
            enqueued = report.enqueued,
            "event dispatched"
        );

        Ok(report)
    }

    /// Dispatches on a background task. Producers never see delivery or
    /// storage errors; they are logged.
    pub fn spawn_dispatch(&self, event: Event) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(error) = dispatcher.dispatch(&event).await {
                error!(event_id = %event.id, error = %error, "event dispatch failed");
            }
        })
    }
}
