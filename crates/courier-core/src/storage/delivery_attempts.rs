//! Repository for delivery attempts, the durable delivery queue.
//!
//! Each row is one attempt. Workers claim due `pending` rows with
//! `FOR UPDATE SKIP LOCKED`, stamping a lease token, and release them
//! through `complete`, which is a compare-and-swap on
//! `(id, status = 'in_flight', lease_token)`. A worker renews the lease
//! before executing each attempt of its batch. Retries are new rows with a
//! future `scheduled_at`, never updates of the failed row.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{
        AttemptCompletion, AttemptId, CompletionResult, DeliveryAttempt, Disposition, EventId,
        Page, Pagination, SubscriptionId,
    },
    storage::{audit_log, dead_letters, subscriptions},
};

const INSERT_COLUMNS: &str = "id, subscription_id, event_id, event_type, generation, \
                              attempt_number, status, http_status, response_excerpt, error, \
                              scheduled_at, executed_at, next_retry_at, lease_token, \
                              lease_expires_at, created_at";

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Inserts an attempt with any executor. Returns false if an attempt with
/// the same `(subscription_id, event_id, generation, attempt_number)`
/// already exists.
///
/// # Errors
///
/// Returns error if insert fails for any other reason.
pub async fn insert<'e, E>(executor: E, attempt: &DeliveryAttempt) -> Result<bool>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(&format!(
        "INSERT INTO delivery_attempts ({INSERT_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
         ON CONFLICT (subscription_id, event_id, generation, attempt_number) DO NOTHING"
    ))
    .bind(attempt.id)
    .bind(attempt.subscription_id)
    .bind(attempt.event_id)
    .bind(&attempt.event_type)
    .bind(to_i32(attempt.generation))
    .bind(to_i32(attempt.attempt_number))
    .bind(attempt.status)
    .bind(attempt.http_status)
    .bind(&attempt.response_excerpt)
    .bind(&attempt.error)
    .bind(attempt.scheduled_at)
    .bind(attempt.executed_at)
    .bind(attempt.next_retry_at)
    .bind(attempt.lease_token)
    .bind(attempt.lease_expires_at)
    .bind(attempt.created_at)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Repository for delivery attempt operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Enqueues a pending attempt if its subscription is still active.
    ///
    /// Returns false when the attempt already exists or the subscription
    /// was deactivated in the meantime.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn enqueue(&self, attempt: &DeliveryAttempt) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO delivery_attempts ({INSERT_COLUMNS}) \
             SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16 \
             WHERE EXISTS ( \
                 SELECT 1 FROM webhook_subscriptions \
                 WHERE id = $2 AND is_active AND deleted_at IS NULL \
             ) \
             ON CONFLICT (subscription_id, event_id, generation, attempt_number) DO NOTHING"
        ))
        .bind(attempt.id)
        .bind(attempt.subscription_id)
        .bind(attempt.event_id)
        .bind(&attempt.event_type)
        .bind(to_i32(attempt.generation))
        .bind(to_i32(attempt.attempt_number))
        .bind(attempt.status)
        .bind(attempt.http_status)
        .bind(&attempt.response_excerpt)
        .bind(&attempt.error)
        .bind(attempt.scheduled_at)
        .bind(attempt.executed_at)
        .bind(attempt.next_retry_at)
        .bind(attempt.lease_token)
        .bind(attempt.lease_expires_at)
        .bind(attempt.created_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Inserts an attempt inside an existing transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        attempt: &DeliveryAttempt,
    ) -> Result<bool> {
        insert(&mut **tx, attempt).await
    }

    /// Claims up to `batch_size` due attempts.
    ///
    /// Skips rows locked by other workers and pairs that already have an
    /// attempt in flight. Claimed rows move to `in_flight` with a fresh
    /// lease token expiring at `lease_expires_at`.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn claim_due(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Vec<DeliveryAttempt>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r"
            SELECT d.id FROM delivery_attempts d
            WHERE d.status = 'pending'
              AND d.scheduled_at <= $1
              AND NOT EXISTS (
                  SELECT 1 FROM delivery_attempts f
                  WHERE f.subscription_id = d.subscription_id
                    AND f.event_id = d.event_id
                    AND f.status = 'in_flight'
              )
            ORDER BY d.scheduled_at ASC
            LIMIT $2
            FOR UPDATE OF d SKIP LOCKED
            ",
        )
        .bind(now)
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let attempts = sqlx::query_as::<_, DeliveryAttempt>(
            r"
            UPDATE delivery_attempts
            SET status = 'in_flight', lease_token = gen_random_uuid(), lease_expires_at = $2
            WHERE id = ANY($1) AND status = 'pending'
            RETURNING *
            ",
        )
        .bind(&ids)
        .bind(lease_expires_at)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(attempts)
    }

    /// Extends the lease of an attempt still held under `lease_token`.
    ///
    /// Returns false if the lease was revoked, in which case the caller
    /// must not execute the attempt.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn renew_lease(
        &self,
        id: AttemptId,
        lease_token: Uuid,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE delivery_attempts SET lease_expires_at = $3
            WHERE id = $1 AND status = 'in_flight' AND lease_token = $2
            ",
        )
        .bind(id)
        .bind(lease_token)
        .bind(lease_expires_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Releases a claimed attempt and applies its disposition atomically.
    ///
    /// Writes the final state, the successor attempt or dead-letter entry,
    /// the subscription's `last_delivery_at` on success, and the audit
    /// entry. A successor is only written while the subscription is active;
    /// otherwise the attempt ends failed and `RetryDropped` is returned.
    /// Returns `LeaseLost`, writing nothing, if the attempt is no longer in
    /// flight under `lease_token`.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn complete(&self, completion: &AttemptCompletion) -> Result<CompletionResult> {
        let mut tx = self.pool.begin().await?;

        // subscription row first, the same lock order deactivation uses
        let retry_dropped = match &completion.disposition {
            Disposition::Retry(next) => {
                !subscriptions::lock_if_active(&mut *tx, next.subscription_id).await?
            },
            _ => false,
        };

        let next_retry_at = match &completion.disposition {
            Disposition::Retry(next) if !retry_dropped => Some(next.scheduled_at),
            _ => None,
        };

        let subscription_id: Option<SubscriptionId> = sqlx::query_scalar(
            r"
            UPDATE delivery_attempts
            SET status = $3, http_status = $4, response_excerpt = $5, error = $6,
                executed_at = $7, next_retry_at = $8,
                lease_token = NULL, lease_expires_at = NULL
            WHERE id = $1 AND status = 'in_flight' AND lease_token = $2
            RETURNING subscription_id
            ",
        )
        .bind(completion.attempt_id)
        .bind(completion.lease_token)
        .bind(completion.disposition.status())
        .bind(completion.outcome.http_status)
        .bind(&completion.outcome.response_excerpt)
        .bind(&completion.outcome.error)
        .bind(completion.executed_at)
        .bind(next_retry_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(subscription_id) = subscription_id else {
            tx.rollback().await?;
            return Ok(CompletionResult::LeaseLost);
        };

        match &completion.disposition {
            Disposition::Delivered => {
                sqlx::query(
                    "UPDATE webhook_subscriptions SET last_delivery_at = $2 WHERE id = $1",
                )
                .bind(subscription_id)
                .bind(completion.executed_at)
                .execute(&mut *tx)
                .await?;
            },
            Disposition::Retry(next) if !retry_dropped => {
                insert(&mut *tx, next).await?;
            },
            Disposition::DeadLetter(entry) => {
                dead_letters::insert(&mut *tx, entry).await?;
            },
            Disposition::Retry(_) | Disposition::Cancelled => {},
        }

        audit_log::insert(&mut *tx, &completion.audit).await?;

        tx.commit().await?;

        Ok(if retry_dropped { CompletionResult::RetryDropped } else { CompletionResult::Applied })
    }

    /// Returns attempts whose lease expired to `pending`, due immediately.
    ///
    /// The attempt number is unchanged: a lost worker does not consume an
    /// attempt.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE delivery_attempts
            SET status = 'pending', lease_token = NULL, lease_expires_at = NULL,
                scheduled_at = $1
            WHERE status = 'in_flight' AND lease_expires_at < $1
            ",
        )
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Finds an attempt by id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: AttemptId) -> Result<Option<DeliveryAttempt>> {
        let attempt =
            sqlx::query_as::<_, DeliveryAttempt>("SELECT * FROM delivery_attempts WHERE id = $1")
                .bind(id)
                .fetch_optional(&*self.pool)
                .await?;

        Ok(attempt)
    }

    /// Finds every attempt for a subscription and event, in chain order.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_for_event(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
    ) -> Result<Vec<DeliveryAttempt>> {
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(
            r"
            SELECT * FROM delivery_attempts
            WHERE subscription_id = $1 AND event_id = $2
            ORDER BY generation ASC, attempt_number ASC
            ",
        )
        .bind(subscription_id)
        .bind(event_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }

    /// Returns one page of a subscription's attempts, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list_for_subscription(
        &self,
        subscription_id: SubscriptionId,
        pagination: Pagination,
    ) -> Result<Page<DeliveryAttempt>> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM delivery_attempts WHERE subscription_id = $1")
                .bind(subscription_id)
                .fetch_one(&*self.pool)
                .await?;

        let items = sqlx::query_as::<_, DeliveryAttempt>(
            r"
            SELECT * FROM delivery_attempts
            WHERE subscription_id = $1
            ORDER BY created_at DESC, attempt_number DESC
            LIMIT $2 OFFSET $3
            ",
        )
        .bind(subscription_id)
        .bind(i64::from(pagination.limit))
        .bind(i64::try_from(pagination.offset()).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(Page::new(items, u64::try_from(total).unwrap_or(0), pagination))
    }

    /// Returns true if the pair has an attempt that is pending or in flight.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn has_open_attempt(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
    ) -> Result<bool> {
        let open: bool = sqlx::query_scalar(
            r"
            SELECT EXISTS (
                SELECT 1 FROM delivery_attempts
                WHERE subscription_id = $1 AND event_id = $2
                  AND status IN ('pending', 'in_flight')
            )
            ",
        )
        .bind(subscription_id)
        .bind(event_id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(open)
    }

    /// Returns the generation a new replay chain for the pair should use.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn next_generation(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
    ) -> Result<u32> {
        let current: Option<i32> = sqlx::query_scalar(
            r"
            SELECT MAX(generation) FROM delivery_attempts
            WHERE subscription_id = $1 AND event_id = $2
            ",
        )
        .bind(subscription_id)
        .bind(event_id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(current.map_or(0, |g| u32::try_from(g).unwrap_or(0).saturating_add(1)))
    }

    /// Counts attempts by queue state, plus outcomes executed since
    /// `since`.
    ///
    /// Returns `(pending, in_flight, recent_delivered, recent_failed)`.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count_by_state(&self, since: DateTime<Utc>) -> Result<(u64, u64, u64, u64)> {
        let (pending, in_flight, delivered, failed): (i64, i64, i64, i64) = sqlx::query_as(
            r"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending'),
                COUNT(*) FILTER (WHERE status = 'in_flight'),
                COUNT(*) FILTER (WHERE status = 'delivered' AND executed_at >= $1),
                COUNT(*) FILTER (
                    WHERE status IN ('failed', 'dead_lettered') AND executed_at >= $1
                )
            FROM delivery_attempts
            ",
        )
        .bind(since)
        .fetch_one(&*self.pool)
        .await?;

        let count = |n: i64| u64::try_from(n).unwrap_or(0);
        Ok((count(pending), count(in_flight), count(delivered), count(failed)))
    }
}
