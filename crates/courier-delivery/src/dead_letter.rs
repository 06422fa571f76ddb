//! Dead-letter store.
//!
//! Attempts that exhaust their retry budget land here. Owners list them and
//! replay them; a replay starts a new attempt chain (attempt 1 of the next
//! generation) and leaves the entry in place with its replay metadata.

use std::sync::Arc;

use courier_core::{
    models::{
        AuditAction, AuditEntry, DeadLetterEntry, DeadLetterFilter, DeadLetterId, DeliveryAttempt,
        OwnerId, Page,
    },
    Clock, CoreError,
};
use tracing::info;

use crate::{error::RegistryError, storage::DeliveryStorage};

/// Owner-facing access to dead letters.
#[derive(Clone)]
pub struct DeadLetterStore {
    storage: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
}

impl DeadLetterStore {
    /// Creates a store.
    pub fn new(storage: Arc<dyn DeliveryStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Pages through entries matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the query fails.
    pub async fn list(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Page<DeadLetterEntry>, RegistryError> {
        Ok(self.storage.list_dead_letters(filter).await?)
    }

    /// Returns one of the owner's entries.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the entry does not exist or belongs to another
    /// owner.
    pub async fn get(
        &self,
        id: DeadLetterId,
        owner_id: OwnerId,
    ) -> Result<DeadLetterEntry, RegistryError> {
        self.storage
            .find_dead_letter(id)
            .await?
            .filter(|entry| entry.owner_id == owner_id)
            .ok_or_else(|| RegistryError::NotFound(format!("dead letter {id}")))
    }

    /// Replays an entry on behalf of `actor`.
    ///
    /// Enqueues attempt 1 of a new generation due now, stamps the entry with
    /// `replayed_by`/`replayed_at`, and records a `replay` audit entry, all
    /// in one storage transaction.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the entry is missing or `actor` does not own it
    /// - `SubscriptionInactive` if the subscription was deactivated or deleted
    /// - `Conflict` if the event is still queued for that subscription
    pub async fn replay(
        &self,
        id: DeadLetterId,
        actor: OwnerId,
    ) -> Result<DeliveryAttempt, RegistryError> {
        let entry = self.get(id, actor).await?;

        let active = self
            .storage
            .find_subscription(entry.subscription_id)
            .await?
            .is_some_and(|s| s.is_active);
        if !active {
            return Err(RegistryError::SubscriptionInactive(entry.subscription_id.to_string()));
        }

        if self.storage.has_open_attempt(entry.subscription_id, entry.event_id).await? {
            return Err(RegistryError::Conflict(format!(
                "event {} is already queued for subscription {}",
                entry.event_id, entry.subscription_id
            )));
        }

        let generation = self.storage.next_generation(entry.subscription_id, entry.event_id).await?;
        let now = self.clock.now_utc();
        let attempt = DeliveryAttempt::pending(
            entry.subscription_id,
            entry.event_id,
            entry.event_type.clone(),
            generation,
            1,
            now,
        );

        let mut audit = AuditEntry::for_attempt(AuditAction::Replay, &attempt, now);
        audit.actor = Some(actor);

        let replayed = match self.storage.replay_dead_letter(id, actor, &attempt, &audit, now).await
        {
            Ok(Some(entry)) => entry,
            Ok(None) => return Err(RegistryError::NotFound(format!("dead letter {id}"))),
            Err(CoreError::ConstraintViolation(message)) => {
                return Err(RegistryError::Conflict(message));
            },
            Err(e) => return Err(e.into()),
        };

        info!(
            dead_letter_id = %id,
            attempt_id = %attempt.id,
            generation,
            replay_count = replayed.replay_count,
            actor = %actor,
            "dead letter replayed"
        );

        Ok(attempt)
    }
}
