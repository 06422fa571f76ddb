//! Tracking of deliveries currently on the wire.
//!
//! Workers register each attempt under its subscription before checking
//! that the subscription is active, and hold the returned guard until the
//! HTTP exchange ends. Deactivating or deleting a subscription cancels the
//! subscription's token, so requests already sent are abandoned and the
//! attempt completes as cancelled instead of scheduling a retry.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use courier_core::models::SubscriptionId;
use tokio_util::sync::CancellationToken;

struct Entry {
    token: CancellationToken,
    generation: u64,
    active: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<SubscriptionId, Entry>,
    next_generation: u64,
}

/// Per-subscription cancellation signals shared by workers and the
/// registry.
#[derive(Clone, Default)]
pub struct InFlightDeliveries {
    inner: Arc<Mutex<Inner>>,
}

impl InFlightDeliveries {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers one delivery for `subscription_id`.
    pub fn track(&self, subscription_id: SubscriptionId) -> InFlightGuard {
        let mut inner = self.lock();
        let Inner { entries, next_generation } = &mut *inner;

        let entry = entries.entry(subscription_id).or_insert_with(|| {
            *next_generation += 1;
            Entry { token: CancellationToken::new(), generation: *next_generation, active: 0 }
        });
        entry.active += 1;

        InFlightGuard {
            deliveries: self.clone(),
            subscription_id,
            generation: entry.generation,
            token: entry.token.clone(),
        }
    }

    /// Cancels every delivery currently tracked for `subscription_id`.
    /// Returns false if none was.
    pub fn cancel(&self, subscription_id: SubscriptionId) -> bool {
        match self.lock().entries.remove(&subscription_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            },
            None => false,
        }
    }

    /// Number of deliveries tracked for `subscription_id`.
    pub fn count(&self, subscription_id: SubscriptionId) -> usize {
        self.lock().entries.get(&subscription_id).map_or(0, |e| e.active)
    }
}

/// Registration of one delivery. Dropping it unregisters the delivery.
pub struct InFlightGuard {
    deliveries: InFlightDeliveries,
    subscription_id: SubscriptionId,
    generation: u64,
    token: CancellationToken,
}

impl InFlightGuard {
    /// Resolves once the subscription is deactivated or deleted.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Returns true if the subscription was deactivated or deleted since
    /// tracking began.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut inner = self.deliveries.lock();
        let finished = match inner.entries.get_mut(&self.subscription_id) {
            // a cancelled entry may have been replaced by a newer one
            Some(entry) if entry.generation == self.generation => {
                entry.active = entry.active.saturating_sub(1);
                entry.active == 0
            },
            _ => false,
        };
        if finished {
            inner.entries.remove(&self.subscription_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reaches_every_tracked_delivery() {
        let deliveries = InFlightDeliveries::new();
        let id = SubscriptionId::new();
        let first = deliveries.track(id);
        let second = deliveries.track(id);
        let other = deliveries.track(SubscriptionId::new());

        assert_eq!(deliveries.count(id), 2);
        assert!(deliveries.cancel(id));

        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        assert!(!other.is_cancelled());
        assert_eq!(deliveries.count(id), 0);
    }

    #[test]
    fn dropping_guards_unregisters() {
        let deliveries = InFlightDeliveries::new();
        let id = SubscriptionId::new();

        let guard = deliveries.track(id);
        drop(guard);

        assert_eq!(deliveries.count(id), 0);
        assert!(!deliveries.cancel(id));
    }

    #[test]
    fn stale_guard_does_not_unregister_newer_delivery() {
        let deliveries = InFlightDeliveries::new();
        let id = SubscriptionId::new();

        let stale = deliveries.track(id);
        deliveries.cancel(id);
        let fresh = deliveries.track(id);
        drop(stale);

        assert_eq!(deliveries.count(id), 1);
        assert!(!fresh.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let deliveries = InFlightDeliveries::new();
        let id = SubscriptionId::new();
        let guard = deliveries.track(id);

        deliveries.cancel(id);

        tokio::time::timeout(std::time::Duration::from_secs(1), guard.cancelled())
            .await
            .unwrap();
    }
}
