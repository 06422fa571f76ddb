//! Storage abstraction layer for the delivery pipeline.
//!
//! `DeliveryStorage` covers every persistence operation the registry,
//! dispatcher, workers, dead-letter store and audit log need. Production
//! uses `PostgresDeliveryStorage` over `courier_core::storage::Storage`;
//! tests use the in-memory `mock::MockDeliveryStorage`, which enforces the
//! same queue invariants (claim CAS, dedup keys, single in-flight attempt
//! per pair, immutability of terminal attempts).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{
    error::Result,
    models::{
        AttemptCompletion, AttemptId, AuditEntry, AuditFilter, CompletionResult, DeadLetterEntry,
        DeadLetterFilter, DeadLetterId, DeliveryAttempt, DeliveryStats, Event, EventId, OwnerId,
        Page, Pagination, Secret, Subscription, SubscriptionId,
    },
    storage::Storage,
};
use uuid::Uuid;

/// Storage operations required by the delivery pipeline.
#[async_trait]
pub trait DeliveryStorage: Send + Sync + 'static {
    // Subscriptions

    /// Inserts a subscription unless its owner already created `limit`
    /// since `since`, deleted ones included. Count and insert are atomic
    /// per owner. Returns false when the limit was reached.
    async fn insert_subscription_within_limit(
        &self,
        subscription: &Subscription,
        since: DateTime<Utc>,
        limit: u64,
    ) -> Result<bool>;

    /// Finds a live subscription.
    async fn find_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>>;

    /// Lists an owner's live subscriptions, newest first.
    async fn list_subscriptions(&self, owner_id: OwnerId) -> Result<Vec<Subscription>>;

    /// Finds active subscriptions registered for `event_type`.
    async fn find_active_subscriptions(&self, event_type: &str) -> Result<Vec<Subscription>>;

    /// Writes url, events, description, activation and `updated_at`.
    async fn update_subscription(&self, subscription: &Subscription) -> Result<bool>;

    /// Replaces the signing secret.
    async fn set_subscription_secret(
        &self,
        id: SubscriptionId,
        secret: &Secret,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Deactivates a subscription and cancels its pending attempts,
    /// returning them. `None` if no live subscription matched.
    async fn deactivate_subscription(
        &self,
        id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<DeliveryAttempt>>>;

    /// Soft-deletes a subscription, cancelling pending attempts like
    /// deactivation.
    async fn delete_subscription(
        &self,
        id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<DeliveryAttempt>>>;

    // Events

    /// Stores an event unless it already exists. Returns true if inserted.
    async fn store_event(&self, event: &Event) -> Result<bool>;

    /// Finds a stored event.
    async fn find_event(&self, id: EventId) -> Result<Option<Event>>;

    // Queue

    /// Enqueues a pending attempt if the subscription is active and the
    /// dedup key is unused. Returns true if inserted.
    async fn enqueue_attempt(&self, attempt: &DeliveryAttempt) -> Result<bool>;

    /// Claims up to `batch_size` attempts due at `now`, leasing them until
    /// `lease_expires_at`.
    async fn claim_due_attempts(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Vec<DeliveryAttempt>>;

    /// Extends the lease of an in-flight attempt. Returns false if
    /// `lease_token` no longer holds it.
    async fn renew_lease(
        &self,
        id: AttemptId,
        lease_token: Uuid,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Completes a claimed attempt atomically. A retry successor is only
    /// written while the subscription is active.
    async fn complete_attempt(&self, completion: &AttemptCompletion) -> Result<CompletionResult>;

    /// Returns expired in-flight attempts to pending. Returns the count.
    async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Finds an attempt.
    async fn find_attempt(&self, id: AttemptId) -> Result<Option<DeliveryAttempt>>;

    /// Finds every attempt of a pair in chain order.
    async fn find_attempts_for_event(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
    ) -> Result<Vec<DeliveryAttempt>>;

    /// Pages through a subscription's attempts, newest first.
    async fn list_attempts_for_subscription(
        &self,
        subscription_id: SubscriptionId,
        pagination: Pagination,
    ) -> Result<Page<DeliveryAttempt>>;

    /// Returns true if the pair has a pending or in-flight attempt.
    async fn has_open_attempt(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
    ) -> Result<bool>;

    /// Returns the generation for a new replay chain of the pair.
    async fn next_generation(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
    ) -> Result<u32>;

    // Dead letters

    /// Finds a dead-letter entry.
    async fn find_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>>;

    /// Pages through dead-letter entries.
    async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Page<DeadLetterEntry>>;

    /// Marks an entry replayed, enqueues `attempt` and appends `audit`
    /// atomically.
    async fn replay_dead_letter(
        &self,
        id: DeadLetterId,
        actor: OwnerId,
        attempt: &DeliveryAttempt,
        audit: &AuditEntry,
        now: DateTime<Utc>,
    ) -> Result<Option<DeadLetterEntry>>;

    // Audit

    /// Appends an audit entry.
    async fn record_audit(&self, entry: &AuditEntry) -> Result<()>;

    /// Pages through audit entries, newest first.
    async fn query_audit(&self, filter: &AuditFilter) -> Result<Page<AuditEntry>>;

    // Stats

    /// Reads queue depth and the outcomes executed since `since`.
    async fn delivery_stats(&self, since: DateTime<Utc>) -> Result<DeliveryStats>;
}

/// Production storage implementation using PostgreSQL.
pub struct PostgresDeliveryStorage {
    storage: Arc<Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl DeliveryStorage for PostgresDeliveryStorage {
    async fn insert_subscription_within_limit(
        &self,
        subscription: &Subscription,
        since: DateTime<Utc>,
        limit: u64,
    ) -> Result<bool> {
        self.storage.subscriptions.create_within_limit(subscription, since, limit).await
    }

    async fn find_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        self.storage.subscriptions.find_by_id(id).await
    }

    async fn list_subscriptions(&self, owner_id: OwnerId) -> Result<Vec<Subscription>> {
        self.storage.subscriptions.list_by_owner(owner_id).await
    }

    async fn find_active_subscriptions(&self, event_type: &str) -> Result<Vec<Subscription>> {
        self.storage.subscriptions.find_active_for_event(event_type).await
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<bool> {
        self.storage.subscriptions.update(subscription).await
    }

    async fn set_subscription_secret(
        &self,
        id: SubscriptionId,
        secret: &Secret,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.storage.subscriptions.set_secret(id, secret, now).await
    }

    async fn deactivate_subscription(
        &self,
        id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<DeliveryAttempt>>> {
        self.storage.subscriptions.deactivate(id, now).await
    }

    async fn delete_subscription(
        &self,
        id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<DeliveryAttempt>>> {
        self.storage.subscriptions.delete(id, now).await
    }

    async fn store_event(&self, event: &Event) -> Result<bool> {
        self.storage.events.insert_if_absent(event).await
    }

    async fn find_event(&self, id: EventId) -> Result<Option<Event>> {
        self.storage.events.find_by_id(id).await
    }

    async fn enqueue_attempt(&self, attempt: &DeliveryAttempt) -> Result<bool> {
        self.storage.delivery_attempts.enqueue(attempt).await
    }

    async fn claim_due_attempts(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Vec<DeliveryAttempt>> {
        self.storage.delivery_attempts.claim_due(batch_size, now, lease_expires_at).await
    }

    async fn renew_lease(
        &self,
        id: AttemptId,
        lease_token: Uuid,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.storage.delivery_attempts.renew_lease(id, lease_token, lease_expires_at).await
    }

    async fn complete_attempt(&self, completion: &AttemptCompletion) -> Result<CompletionResult> {
        self.storage.delivery_attempts.complete(completion).await
    }

    async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64> {
        self.storage.delivery_attempts.release_expired_leases(now).await
    }

    async fn find_attempt(&self, id: AttemptId) -> Result<Option<DeliveryAttempt>> {
        self.storage.delivery_attempts.find_by_id(id).await
    }

    async fn find_attempts_for_event(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
    ) -> Result<Vec<DeliveryAttempt>> {
        self.storage.delivery_attempts.find_for_event(subscription_id, event_id).await
    }

    async fn list_attempts_for_subscription(
        &self,
        subscription_id: SubscriptionId,
        pagination: Pagination,
    ) -> Result<Page<DeliveryAttempt>> {
        self.storage.delivery_attempts.list_for_subscription(subscription_id, pagination).await
    }

    async fn has_open_attempt(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
    ) -> Result<bool> {
        self.storage.delivery_attempts.has_open_attempt(subscription_id, event_id).await
    }

    async fn next_generation(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
    ) -> Result<u32> {
        self.storage.delivery_attempts.next_generation(subscription_id, event_id).await
    }

    async fn find_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>> {
        self.storage.dead_letters.find_by_id(id).await
    }

    async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Page<DeadLetterEntry>> {
        self.storage.dead_letters.list(filter).await
    }

    async fn replay_dead_letter(
        &self,
        id: DeadLetterId,
        actor: OwnerId,
        attempt: &DeliveryAttempt,
        audit: &AuditEntry,
        now: DateTime<Utc>,
    ) -> Result<Option<DeadLetterEntry>> {
        self.storage.dead_letters.replay(id, actor, attempt, audit, now).await
    }

    async fn record_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.storage.audit_log.record(entry).await
    }

    async fn query_audit(&self, filter: &AuditFilter) -> Result<Page<AuditEntry>> {
        self.storage.audit_log.query(filter).await
    }

    async fn delivery_stats(&self, since: DateTime<Utc>) -> Result<DeliveryStats> {
        let active_subscriptions = self.storage.subscriptions.count_active().await?;
        let (pending_attempts, in_flight_attempts, recent_delivered, recent_failed) =
            self.storage.delivery_attempts.count_by_state(since).await?;
        let dead_letters = self.storage.dead_letters.count_unreplayed().await?;

        Ok(DeliveryStats {
            active_subscriptions,
            pending_attempts,
            in_flight_attempts,
            dead_letters,
            recent_delivered,
            recent_failed,
        })
    }
}

pub mod mock {
    //! In-memory storage for testing delivery logic without a database.
    //!
    //! All state sits behind one `RwLock`, so every operation is atomic the
    //! way the PostgreSQL transactions are.

    use std::{collections::HashMap, sync::Arc};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use courier_core::{
        error::{CoreError, Result},
        models::{
            AttemptCompletion, AttemptId, AuditAction, AuditEntry, AuditFilter, CompletionResult,
            DeadLetterEntry, DeadLetterFilter, DeadLetterId, DeliveryAttempt, DeliveryStats,
            DeliveryStatus, Disposition, Event, EventId, OwnerId, Page, Pagination, Secret,
            Subscription, SubscriptionId, SUBSCRIPTION_DEACTIVATED,
        },
    };
    use tokio::sync::RwLock;
    use uuid::Uuid;

    use super::DeliveryStorage;

    #[derive(Default)]
    struct State {
        subscriptions: HashMap<SubscriptionId, Subscription>,
        events: HashMap<EventId, Event>,
        attempts: Vec<DeliveryAttempt>,
        dead_letters: Vec<DeadLetterEntry>,
        audit: Vec<AuditEntry>,
        claim_error: Option<String>,
    }

    impl State {
        fn live_subscription(&self, id: SubscriptionId) -> Option<&Subscription> {
            self.subscriptions.get(&id).filter(|s| s.deleted_at.is_none())
        }

        fn has_key(&self, attempt: &DeliveryAttempt) -> bool {
            self.attempts.iter().any(|a| {
                a.subscription_id == attempt.subscription_id
                    && a.event_id == attempt.event_id
                    && a.generation == attempt.generation
                    && a.attempt_number == attempt.attempt_number
            })
        }

        fn insert_attempt(&mut self, attempt: &DeliveryAttempt) -> bool {
            if self.has_key(attempt) {
                return false;
            }
            self.attempts.push(attempt.clone());
            true
        }

        fn switch_off(
            &mut self,
            id: SubscriptionId,
            now: DateTime<Utc>,
            delete: bool,
        ) -> Option<Vec<DeliveryAttempt>> {
            let subscription =
                self.subscriptions.get_mut(&id).filter(|s| s.deleted_at.is_none())?;
            subscription.is_active = false;
            subscription.updated_at = now;
            if delete {
                subscription.deleted_at = Some(now);
            }

            let mut cancelled = Vec::new();
            for attempt in self.attempts.iter_mut() {
                if attempt.subscription_id == id && attempt.status == DeliveryStatus::Pending {
                    attempt.status = DeliveryStatus::Failed;
                    attempt.error = Some(SUBSCRIPTION_DEACTIVATED.to_string());
                    attempt.executed_at = Some(now);
                    cancelled.push(attempt.clone());
                }
            }
            for attempt in &cancelled {
                self.audit.push(AuditEntry::for_attempt(AuditAction::Cancellation, attempt, now));
            }

            Some(cancelled)
        }
    }

    fn paginate<T: Clone>(mut items: Vec<T>, pagination: Pagination) -> Page<T> {
        let total = items.len() as u64;
        let offset = usize::try_from(pagination.offset()).unwrap_or(usize::MAX);
        let limit = pagination.limit as usize;
        let page = if offset >= items.len() {
            Vec::new()
        } else {
            items.drain(offset..).take(limit).collect()
        };
        Page::new(page, total, pagination)
    }

    /// Mock storage for testing delivery logic without database.
    #[derive(Clone, Default)]
    pub struct MockDeliveryStorage {
        state: Arc<RwLock<State>>,
    }

    impl MockDeliveryStorage {
        /// Creates a new mock storage with empty state.
        pub fn new() -> Self {
            Self::default()
        }

        /// Inserts a subscription directly, bypassing registry validation.
        pub async fn add_subscription(&self, subscription: Subscription) {
            self.state.write().await.subscriptions.insert(subscription.id, subscription);
        }

        /// Injects an error for the next claim operation.
        pub async fn inject_claim_error(&self, error: impl Into<String>) {
            self.state.write().await.claim_error = Some(error.into());
        }

        /// Overrides an attempt's lease expiry, simulating a stalled worker.
        pub async fn expire_lease(&self, id: AttemptId, at: DateTime<Utc>) {
            if let Some(attempt) = self.state.write().await.attempts.iter_mut().find(|a| a.id == id)
            {
                attempt.lease_expires_at = Some(at);
            }
        }

        /// Returns every attempt in insertion order.
        pub async fn attempts(&self) -> Vec<DeliveryAttempt> {
            self.state.read().await.attempts.clone()
        }

        /// Returns every audit entry in insertion order.
        pub async fn audit_entries(&self) -> Vec<AuditEntry> {
            self.state.read().await.audit.clone()
        }

        /// Returns every dead-letter entry in insertion order.
        pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
            self.state.read().await.dead_letters.clone()
        }

        /// Returns the stored subscription, deleted ones included.
        pub async fn subscription(&self, id: SubscriptionId) -> Option<Subscription> {
            self.state.read().await.subscriptions.get(&id).cloned()
        }

        /// Returns the number of stored events.
        pub async fn event_count(&self) -> usize {
            self.state.read().await.events.len()
        }
    }

    #[async_trait]
    impl DeliveryStorage for MockDeliveryStorage {
        async fn insert_subscription_within_limit(
            &self,
            subscription: &Subscription,
            since: DateTime<Utc>,
            limit: u64,
        ) -> Result<bool> {
            let mut state = self.state.write().await;
            if state.subscriptions.contains_key(&subscription.id) {
                return Err(CoreError::ConstraintViolation(format!(
                    "subscription {} already exists",
                    subscription.id
                )));
            }
            let recent = state
                .subscriptions
                .values()
                .filter(|s| s.owner_id == subscription.owner_id && s.created_at >= since)
                .count();
            if recent as u64 >= limit {
                return Ok(false);
            }
            state.subscriptions.insert(subscription.id, subscription.clone());
            Ok(true)
        }

        async fn find_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
            Ok(self.state.read().await.live_subscription(id).cloned())
        }

        async fn list_subscriptions(&self, owner_id: OwnerId) -> Result<Vec<Subscription>> {
            let state = self.state.read().await;
            let mut subscriptions: Vec<Subscription> = state
                .subscriptions
                .values()
                .filter(|s| s.owner_id == owner_id && s.deleted_at.is_none())
                .cloned()
                .collect();
            subscriptions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(subscriptions)
        }

        async fn find_active_subscriptions(&self, event_type: &str) -> Result<Vec<Subscription>> {
            let state = self.state.read().await;
            Ok(state.subscriptions.values().filter(|s| s.subscribes_to(event_type)).cloned().collect())
        }

        async fn update_subscription(&self, subscription: &Subscription) -> Result<bool> {
            let mut state = self.state.write().await;
            let Some(stored) =
                state.subscriptions.get_mut(&subscription.id).filter(|s| s.deleted_at.is_none())
            else {
                return Ok(false);
            };
            stored.url.clone_from(&subscription.url);
            stored.events.clone_from(&subscription.events);
            stored.is_active = subscription.is_active;
            stored.description.clone_from(&subscription.description);
            stored.updated_at = subscription.updated_at;
            Ok(true)
        }

        async fn set_subscription_secret(
            &self,
            id: SubscriptionId,
            secret: &Secret,
            now: DateTime<Utc>,
        ) -> Result<bool> {
            let mut state = self.state.write().await;
            let Some(stored) = state.subscriptions.get_mut(&id).filter(|s| s.deleted_at.is_none())
            else {
                return Ok(false);
            };
            stored.secret = secret.clone();
            stored.updated_at = now;
            Ok(true)
        }

        async fn deactivate_subscription(
            &self,
            id: SubscriptionId,
            now: DateTime<Utc>,
        ) -> Result<Option<Vec<DeliveryAttempt>>> {
            Ok(self.state.write().await.switch_off(id, now, false))
        }

        async fn delete_subscription(
            &self,
            id: SubscriptionId,
            now: DateTime<Utc>,
        ) -> Result<Option<Vec<DeliveryAttempt>>> {
            Ok(self.state.write().await.switch_off(id, now, true))
        }

        async fn store_event(&self, event: &Event) -> Result<bool> {
            let mut state = self.state.write().await;
            if state.events.contains_key(&event.id) {
                return Ok(false);
            }
            state.events.insert(event.id, event.clone());
            Ok(true)
        }

        async fn find_event(&self, id: EventId) -> Result<Option<Event>> {
            Ok(self.state.read().await.events.get(&id).cloned())
        }

        async fn enqueue_attempt(&self, attempt: &DeliveryAttempt) -> Result<bool> {
            let mut state = self.state.write().await;
            if !state.live_subscription(attempt.subscription_id).is_some_and(|s| s.is_active) {
                return Ok(false);
            }
            if !state.events.contains_key(&attempt.event_id) {
                return Err(CoreError::ConstraintViolation(format!(
                    "event {} does not exist",
                    attempt.event_id
                )));
            }
            Ok(state.insert_attempt(attempt))
        }

        async fn claim_due_attempts(
            &self,
            batch_size: usize,
            now: DateTime<Utc>,
            lease_expires_at: DateTime<Utc>,
        ) -> Result<Vec<DeliveryAttempt>> {
            let mut state = self.state.write().await;

            if let Some(error) = state.claim_error.take() {
                return Err(CoreError::Database(error));
            }

            let mut busy: Vec<(SubscriptionId, EventId)> = state
                .attempts
                .iter()
                .filter(|a| a.status == DeliveryStatus::InFlight)
                .map(|a| (a.subscription_id, a.event_id))
                .collect();

            let mut due: Vec<usize> = state
                .attempts
                .iter()
                .enumerate()
                .filter(|(_, a)| a.status == DeliveryStatus::Pending && a.scheduled_at <= now)
                .map(|(index, _)| index)
                .collect();
            due.sort_by_key(|&index| state.attempts[index].scheduled_at);

            let mut claimed = Vec::new();
            for index in due {
                if claimed.len() >= batch_size {
                    break;
                }
                let attempt = &mut state.attempts[index];
                let pair = (attempt.subscription_id, attempt.event_id);
                if busy.contains(&pair) {
                    continue;
                }
                attempt.status = DeliveryStatus::InFlight;
                attempt.lease_token = Some(Uuid::new_v4());
                attempt.lease_expires_at = Some(lease_expires_at);
                busy.push(pair);
                claimed.push(attempt.clone());
            }

            Ok(claimed)
        }

        async fn renew_lease(
            &self,
            id: AttemptId,
            lease_token: Uuid,
            lease_expires_at: DateTime<Utc>,
        ) -> Result<bool> {
            let mut state = self.state.write().await;
            let Some(attempt) = state.attempts.iter_mut().find(|a| {
                a.id == id
                    && a.status == DeliveryStatus::InFlight
                    && a.lease_token == Some(lease_token)
            }) else {
                return Ok(false);
            };
            attempt.lease_expires_at = Some(lease_expires_at);
            Ok(true)
        }

        async fn complete_attempt(
            &self,
            completion: &AttemptCompletion,
        ) -> Result<CompletionResult> {
            let mut state = self.state.write().await;

            let retry_dropped = match &completion.disposition {
                Disposition::Retry(next) => {
                    !state.live_subscription(next.subscription_id).is_some_and(|s| s.is_active)
                },
                _ => false,
            };

            let Some(attempt) = state.attempts.iter_mut().find(|a| {
                a.id == completion.attempt_id
                    && a.status == DeliveryStatus::InFlight
                    && a.lease_token == Some(completion.lease_token)
            }) else {
                return Ok(CompletionResult::LeaseLost);
            };

            attempt.status = completion.disposition.status();
            attempt.http_status = completion.outcome.http_status;
            attempt.response_excerpt.clone_from(&completion.outcome.response_excerpt);
            attempt.error.clone_from(&completion.outcome.error);
            attempt.executed_at = Some(completion.executed_at);
            attempt.lease_token = None;
            attempt.lease_expires_at = None;
            attempt.next_retry_at = match &completion.disposition {
                Disposition::Retry(next) if !retry_dropped => Some(next.scheduled_at),
                _ => None,
            };
            let subscription_id = attempt.subscription_id;

            match &completion.disposition {
                Disposition::Delivered => {
                    if let Some(subscription) = state.subscriptions.get_mut(&subscription_id) {
                        subscription.last_delivery_at = Some(completion.executed_at);
                    }
                },
                Disposition::Retry(next) if !retry_dropped => {
                    state.insert_attempt(next);
                },
                Disposition::DeadLetter(entry) => {
                    state.dead_letters.push(entry.clone());
                },
                Disposition::Retry(_) | Disposition::Cancelled => {},
            }

            state.audit.push(completion.audit.clone());

            Ok(if retry_dropped { CompletionResult::RetryDropped } else { CompletionResult::Applied })
        }

        async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64> {
            let mut state = self.state.write().await;
            let mut released = 0;
            for attempt in state.attempts.iter_mut() {
                if attempt.status == DeliveryStatus::InFlight
                    && attempt.lease_expires_at.is_some_and(|at| at < now)
                {
                    attempt.status = DeliveryStatus::Pending;
                    attempt.lease_token = None;
                    attempt.lease_expires_at = None;
                    attempt.scheduled_at = now;
                    released += 1;
                }
            }
            Ok(released)
        }

        async fn find_attempt(&self, id: AttemptId) -> Result<Option<DeliveryAttempt>> {
            Ok(self.state.read().await.attempts.iter().find(|a| a.id == id).cloned())
        }

        async fn find_attempts_for_event(
            &self,
            subscription_id: SubscriptionId,
            event_id: EventId,
        ) -> Result<Vec<DeliveryAttempt>> {
            let state = self.state.read().await;
            let mut attempts: Vec<DeliveryAttempt> = state
                .attempts
                .iter()
                .filter(|a| a.subscription_id == subscription_id && a.event_id == event_id)
                .cloned()
                .collect();
            attempts.sort_by_key(|a| (a.generation, a.attempt_number));
            Ok(attempts)
        }

        async fn list_attempts_for_subscription(
            &self,
            subscription_id: SubscriptionId,
            pagination: Pagination,
        ) -> Result<Page<DeliveryAttempt>> {
            let state = self.state.read().await;
            let attempts: Vec<DeliveryAttempt> = state
                .attempts
                .iter()
                .rev()
                .filter(|a| a.subscription_id == subscription_id)
                .cloned()
                .collect();
            Ok(paginate(attempts, pagination))
        }

        async fn has_open_attempt(
            &self,
            subscription_id: SubscriptionId,
            event_id: EventId,
        ) -> Result<bool> {
            let state = self.state.read().await;
            Ok(state.attempts.iter().any(|a| {
                a.subscription_id == subscription_id
                    && a.event_id == event_id
                    && matches!(a.status, DeliveryStatus::Pending | DeliveryStatus::InFlight)
            }))
        }

        async fn next_generation(
            &self,
            subscription_id: SubscriptionId,
            event_id: EventId,
        ) -> Result<u32> {
            let state = self.state.read().await;
            Ok(state
                .attempts
                .iter()
                .filter(|a| a.subscription_id == subscription_id && a.event_id == event_id)
                .map(|a| a.generation)
                .max()
                .map_or(0, |g| g.saturating_add(1)))
        }

        async fn find_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>> {
            Ok(self.state.read().await.dead_letters.iter().find(|d| d.id == id).cloned())
        }

        async fn list_dead_letters(
            &self,
            filter: &DeadLetterFilter,
        ) -> Result<Page<DeadLetterEntry>> {
            let state = self.state.read().await;
            let entries: Vec<DeadLetterEntry> =
                state.dead_letters.iter().rev().filter(|d| filter.matches(d)).cloned().collect();
            Ok(paginate(entries, filter.pagination))
        }

        async fn replay_dead_letter(
            &self,
            id: DeadLetterId,
            actor: OwnerId,
            attempt: &DeliveryAttempt,
            audit: &AuditEntry,
            now: DateTime<Utc>,
        ) -> Result<Option<DeadLetterEntry>> {
            let mut state = self.state.write().await;

            let Some(index) = state.dead_letters.iter().position(|d| d.id == id) else {
                return Ok(None);
            };
            if state.has_key(attempt) {
                return Err(CoreError::ConstraintViolation(format!(
                    "replay attempt for dead letter {id} already exists"
                )));
            }

            state.attempts.push(attempt.clone());
            state.audit.push(audit.clone());

            let entry = &mut state.dead_letters[index];
            entry.replayed_by = Some(actor);
            entry.replayed_at = Some(now);
            entry.replay_count += 1;

            Ok(Some(entry.clone()))
        }

        async fn record_audit(&self, entry: &AuditEntry) -> Result<()> {
            self.state.write().await.audit.push(entry.clone());
            Ok(())
        }

        async fn query_audit(&self, filter: &AuditFilter) -> Result<Page<AuditEntry>> {
            let state = self.state.read().await;
            let mut entries: Vec<AuditEntry> =
                state.audit.iter().rev().filter(|e| filter.matches(e)).cloned().collect();
            entries.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
            Ok(paginate(entries, filter.pagination))
        }

        async fn delivery_stats(&self, since: DateTime<Utc>) -> Result<DeliveryStats> {
            let state = self.state.read().await;
            let count_status = |status: DeliveryStatus| {
                state.attempts.iter().filter(|a| a.status == status).count() as u64
            };
            let recent = |statuses: &[DeliveryStatus]| {
                state
                    .attempts
                    .iter()
                    .filter(|a| statuses.contains(&a.status))
                    .filter(|a| a.executed_at.is_some_and(|at| at >= since))
                    .count() as u64
            };

            Ok(DeliveryStats {
                active_subscriptions: state
                    .subscriptions
                    .values()
                    .filter(|s| s.is_active && s.deleted_at.is_none())
                    .count() as u64,
                pending_attempts: count_status(DeliveryStatus::Pending),
                in_flight_attempts: count_status(DeliveryStatus::InFlight),
                dead_letters: state.dead_letters.iter().filter(|d| d.replayed_at.is_none()).count()
                    as u64,
                recent_delivered: recent(&[DeliveryStatus::Delivered]),
                recent_failed: recent(&[DeliveryStatus::Failed, DeliveryStatus::DeadLettered]),
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use courier_core::models::AttemptOutcome;

        use super::*;

        fn subscription() -> Subscription {
            let now = Utc::now();
            Subscription {
                id: SubscriptionId::new(),
                owner_id: OwnerId::new(),
                url: "https://hooks.example.com/clips".to_string(),
                secret: Secret::new("ab".repeat(32)),
                events: vec!["clip.approved".to_string()],
                is_active: true,
                description: None,
                last_delivery_at: None,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            }
        }

        #[tokio::test]
        async fn enqueue_is_idempotent_per_key() {
            let storage = MockDeliveryStorage::new();
            let sub = subscription();
            storage.add_subscription(sub.clone()).await;
            let event = Event::new("clip.approved", Utc::now(), serde_json::json!({}));
            storage.store_event(&event).await.unwrap();

            let first = DeliveryAttempt::pending(sub.id, event.id, "clip.approved", 0, 1, Utc::now());
            let again = DeliveryAttempt::pending(sub.id, event.id, "clip.approved", 0, 1, Utc::now());

            assert!(storage.enqueue_attempt(&first).await.unwrap());
            assert!(!storage.enqueue_attempt(&again).await.unwrap());
            assert_eq!(storage.attempts().await.len(), 1);
        }

        #[tokio::test]
        async fn claim_skips_future_attempts() {
            let storage = MockDeliveryStorage::new();
            let sub = subscription();
            storage.add_subscription(sub.clone()).await;
            let event = Event::new("clip.approved", Utc::now(), serde_json::json!({}));
            storage.store_event(&event).await.unwrap();

            let now = Utc::now();
            let later = now + chrono::Duration::seconds(30);
            let attempt = DeliveryAttempt::pending(sub.id, event.id, "clip.approved", 0, 1, later);
            storage.enqueue_attempt(&attempt).await.unwrap();

            assert!(storage.claim_due_attempts(10, now, later).await.unwrap().is_empty());
            assert_eq!(storage.claim_due_attempts(10, later, later).await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn retry_is_dropped_once_subscription_is_inactive() {
            let storage = MockDeliveryStorage::new();
            let sub = subscription();
            storage.add_subscription(sub.clone()).await;
            let event = Event::new("clip.approved", Utc::now(), serde_json::json!({}));
            storage.store_event(&event).await.unwrap();

            let now = Utc::now();
            let attempt = DeliveryAttempt::pending(sub.id, event.id, "clip.approved", 0, 1, now);
            storage.enqueue_attempt(&attempt).await.unwrap();
            let claimed = storage.claim_due_attempts(1, now, now).await.unwrap().remove(0);

            storage.deactivate_subscription(sub.id, now).await.unwrap();

            let next = DeliveryAttempt::pending(sub.id, event.id, "clip.approved", 0, 2, now);
            let completion = AttemptCompletion {
                attempt_id: claimed.id,
                lease_token: claimed.lease_token.unwrap(),
                outcome: AttemptOutcome { http_status: Some(500), ..AttemptOutcome::default() },
                disposition: Disposition::Retry(next),
                executed_at: now,
                audit: AuditEntry::for_attempt(AuditAction::Delivery, &claimed, now),
            };

            assert_eq!(
                storage.complete_attempt(&completion).await.unwrap(),
                CompletionResult::RetryDropped
            );
            let attempts = storage.attempts().await;
            assert_eq!(attempts.len(), 1);
            assert_eq!(attempts[0].status, DeliveryStatus::Failed);
            assert_eq!(attempts[0].next_retry_at, None);
        }

        #[tokio::test]
        async fn renewal_fails_after_lease_is_released() {
            let storage = MockDeliveryStorage::new();
            let sub = subscription();
            storage.add_subscription(sub.clone()).await;
            let event = Event::new("clip.approved", Utc::now(), serde_json::json!({}));
            storage.store_event(&event).await.unwrap();

            let now = Utc::now();
            let attempt = DeliveryAttempt::pending(sub.id, event.id, "clip.approved", 0, 1, now);
            storage.enqueue_attempt(&attempt).await.unwrap();
            let claimed = storage.claim_due_attempts(1, now, now).await.unwrap().remove(0);
            let token = claimed.lease_token.unwrap();
            let later = now + chrono::Duration::seconds(60);

            assert!(storage.renew_lease(claimed.id, token, later).await.unwrap());
            assert_eq!(storage.release_expired_leases(later).await.unwrap(), 0);

            storage.expire_lease(claimed.id, now).await;
            assert_eq!(storage.release_expired_leases(later).await.unwrap(), 1);
            assert!(!storage.renew_lease(claimed.id, token, later).await.unwrap());
        }

        #[tokio::test]
        async fn injected_claim_error_is_returned_once() {
            let storage = MockDeliveryStorage::new();
            storage.inject_claim_error("connection reset").await;

            let now = Utc::now();
            assert!(storage.claim_due_attempts(10, now, now).await.is_err());
            assert!(storage.claim_due_attempts(10, now, now).await.is_ok());
        }
    }
}
