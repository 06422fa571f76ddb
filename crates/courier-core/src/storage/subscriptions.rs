//! Repository for webhook subscriptions.
//!
//! Deactivation and deletion also cancel the subscription's pending
//! attempts in the same transaction, so a worker can never pick one up
//! after the owner switched the subscription off.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{
        AuditAction, AuditEntry, DeliveryAttempt, OwnerId, Secret, Subscription, SubscriptionId,
        SUBSCRIPTION_DEACTIVATED,
    },
    storage::audit_log,
};

const SUBSCRIPTION_COLUMNS: &str = "id, owner_id, url, secret, events, is_active, description, \
                                    last_delivery_at, created_at, updated_at, deleted_at";

async fn insert<'e, E>(executor: E, subscription: &Subscription) -> Result<()>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r"
        INSERT INTO webhook_subscriptions (
            id, owner_id, url, secret, events, is_active, description,
            last_delivery_at, created_at, updated_at, deleted_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ",
    )
    .bind(subscription.id)
    .bind(subscription.owner_id)
    .bind(&subscription.url)
    .bind(&subscription.secret)
    .bind(&subscription.events)
    .bind(subscription.is_active)
    .bind(&subscription.description)
    .bind(subscription.last_delivery_at)
    .bind(subscription.created_at)
    .bind(subscription.updated_at)
    .bind(subscription.deleted_at)
    .execute(executor)
    .await?;

    Ok(())
}

/// Share-locks a subscription row and returns true if it is live and
/// active.
///
/// Deactivation updates the same row, so it waits for the caller's
/// transaction and then sees every attempt that transaction inserted.
///
/// # Errors
///
/// Returns error if query fails.
pub async fn lock_if_active<'e, E>(executor: E, id: SubscriptionId) -> Result<bool>
where
    E: Executor<'e, Database = Postgres>,
{
    let active: Option<bool> = sqlx::query_scalar(
        r"
        SELECT is_active AND deleted_at IS NULL FROM webhook_subscriptions
        WHERE id = $1
        FOR SHARE
        ",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;

    Ok(active.unwrap_or(false))
}

/// Repository for subscription database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new subscription.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create(&self, subscription: &Subscription) -> Result<()> {
        insert(&*self.pool, subscription).await
    }

    /// Inserts a subscription unless its owner already created `limit`
    /// subscriptions since `since`, deleted ones included.
    ///
    /// Creates of one owner are serialised by a transaction-scoped advisory
    /// lock on the owner id, so concurrent requests cannot all pass the
    /// count. Returns false when the limit was reached.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn create_within_limit(
        &self,
        subscription: &Subscription,
        since: DateTime<Utc>,
        limit: u64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(subscription.owner_id)
            .execute(&mut *tx)
            .await?;

        let count: i64 = sqlx::query_scalar(
            r"
            SELECT COUNT(*) FROM webhook_subscriptions
            WHERE owner_id = $1 AND created_at >= $2
            ",
        )
        .bind(subscription.owner_id)
        .bind(since)
        .fetch_one(&mut *tx)
        .await?;

        if u64::try_from(count).unwrap_or(0) >= limit {
            tx.rollback().await?;
            return Ok(false);
        }

        insert(&mut *tx, subscription).await?;
        tx.commit().await?;

        Ok(true)
    }

    /// Finds a live (not deleted) subscription by id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        self.find_by_id_impl(&*self.pool, id).await
    }

    /// Finds a live subscription within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>> {
        self.find_by_id_impl(&mut **tx, id).await
    }

    async fn find_by_id_impl<'e, E>(
        &self,
        executor: E,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions \
             WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await?;

        Ok(subscription)
    }

    /// Lists the live subscriptions of an owner, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions \
             WHERE owner_id = $1 AND deleted_at IS NULL \
             ORDER BY created_at DESC"
        ))
        .bind(owner_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(subscriptions)
    }

    /// Finds active subscriptions that listen for `event_type`.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_active_for_event(&self, event_type: &str) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions \
             WHERE is_active AND deleted_at IS NULL AND $1 = ANY(events)"
        ))
        .bind(event_type)
        .fetch_all(&*self.pool)
        .await?;

        Ok(subscriptions)
    }

    /// Counts live, active subscriptions.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count_active(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM webhook_subscriptions WHERE is_active AND deleted_at IS NULL",
        )
        .fetch_one(&*self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Writes the mutable fields (url, events, description, activation).
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn update(&self, subscription: &Subscription) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE webhook_subscriptions
            SET url = $2, events = $3, is_active = $4, description = $5, updated_at = $6
            WHERE id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(subscription.id)
        .bind(&subscription.url)
        .bind(&subscription.events)
        .bind(subscription.is_active)
        .bind(&subscription.description)
        .bind(subscription.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Replaces the signing secret.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn set_secret(
        &self,
        id: SubscriptionId,
        secret: &Secret,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE webhook_subscriptions SET secret = $2, updated_at = $3
            WHERE id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(id)
        .bind(secret)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Deactivates a subscription and cancels its pending attempts.
    ///
    /// Returns the cancelled attempts, or `None` if no live subscription
    /// matched.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn deactivate(
        &self,
        id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<DeliveryAttempt>>> {
        self.switch_off(id, now, false).await
    }

    /// Soft-deletes a subscription and cancels its pending attempts.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn delete(
        &self,
        id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<DeliveryAttempt>>> {
        self.switch_off(id, now, true).await
    }

    async fn switch_off(
        &self,
        id: SubscriptionId,
        now: DateTime<Utc>,
        delete: bool,
    ) -> Result<Option<Vec<DeliveryAttempt>>> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE webhook_subscriptions
            SET is_active = FALSE,
                updated_at = $2,
                deleted_at = CASE WHEN $3 THEN $2 ELSE deleted_at END
            WHERE id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(id)
        .bind(now)
        .bind(delete)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let cancelled = sqlx::query_as::<_, DeliveryAttempt>(
            r"
            UPDATE delivery_attempts
            SET status = 'failed', error = $2, executed_at = $3
            WHERE subscription_id = $1 AND status = 'pending'
            RETURNING *
            ",
        )
        .bind(id)
        .bind(SUBSCRIPTION_DEACTIVATED)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        for attempt in &cancelled {
            let entry = AuditEntry::for_attempt(AuditAction::Cancellation, attempt, now);
            audit_log::insert(&mut *tx, &entry).await?;
        }

        tx.commit().await?;

        Ok(Some(cancelled))
    }
}
