//! Repository for dead-letter entries.
//!
//! Entries are created by the completing worker and never removed. Replay
//! stamps `replayed_by` / `replayed_at` and enqueues a fresh attempt in the
//! same transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres};

use crate::{
    error::{CoreError, Result},
    models::{
        AuditEntry, DeadLetterEntry, DeadLetterFilter, DeadLetterId, DeliveryAttempt, OwnerId, Page,
    },
    storage::{audit_log, delivery_attempts},
};

const FILTER_CLAUSE: &str = r"
    WHERE ($1::uuid IS NULL OR owner_id = $1)
      AND ($2::uuid IS NULL OR subscription_id = $2)
      AND ($3::text IS NULL OR event_type = $3)
      AND ($4::timestamptz IS NULL OR created_at >= $4)
      AND ($5::timestamptz IS NULL OR created_at < $5)
      AND ($6::boolean IS NULL OR (replayed_at IS NOT NULL) = $6)
";

/// Inserts a dead-letter entry with any executor.
///
/// # Errors
///
/// Returns error if insert fails.
pub async fn insert<'e, E>(executor: E, entry: &DeadLetterEntry) -> Result<()>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r"
        INSERT INTO dead_letters (
            id, attempt_id, subscription_id, owner_id, event_id, event_type,
            failure_reason, last_http_status, replayed_by, replayed_at,
            replay_count, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ",
    )
    .bind(entry.id)
    .bind(entry.attempt_id)
    .bind(entry.subscription_id)
    .bind(entry.owner_id)
    .bind(entry.event_id)
    .bind(&entry.event_type)
    .bind(&entry.failure_reason)
    .bind(entry.last_http_status)
    .bind(entry.replayed_by)
    .bind(entry.replayed_at)
    .bind(i32::try_from(entry.replay_count).unwrap_or(i32::MAX))
    .bind(entry.created_at)
    .execute(executor)
    .await?;

    Ok(())
}

/// Repository for dead-letter operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds an entry by id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>> {
        let entry =
            sqlx::query_as::<_, DeadLetterEntry>("SELECT * FROM dead_letters WHERE id = $1")
                .bind(id)
                .fetch_optional(&*self.pool)
                .await?;

        Ok(entry)
    }

    /// Returns one page of entries matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list(&self, filter: &DeadLetterFilter) -> Result<Page<DeadLetterEntry>> {
        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM dead_letters {FILTER_CLAUSE}"))
                .bind(filter.owner_id)
                .bind(filter.subscription_id)
                .bind(&filter.event_type)
                .bind(filter.from)
                .bind(filter.to)
                .bind(filter.replayed)
                .fetch_one(&*self.pool)
                .await?;

        let items = sqlx::query_as::<_, DeadLetterEntry>(&format!(
            "SELECT * FROM dead_letters {FILTER_CLAUSE} \
             ORDER BY created_at DESC, id DESC LIMIT $7 OFFSET $8"
        ))
        .bind(filter.owner_id)
        .bind(filter.subscription_id)
        .bind(&filter.event_type)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.replayed)
        .bind(i64::from(filter.pagination.limit))
        .bind(i64::try_from(filter.pagination.offset()).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(Page::new(items, u64::try_from(total).unwrap_or(0), filter.pagination))
    }

    /// Counts entries no operator has replayed yet.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count_unreplayed(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE replayed_at IS NULL")
                .fetch_one(&*self.pool)
                .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Records a replay and enqueues `attempt` atomically.
    ///
    /// Returns the updated entry, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `ConstraintViolation` if the attempt collides with an
    /// existing one, or a database error if the transaction fails.
    pub async fn replay(
        &self,
        id: DeadLetterId,
        actor: OwnerId,
        attempt: &DeliveryAttempt,
        audit: &AuditEntry,
        now: DateTime<Utc>,
    ) -> Result<Option<DeadLetterEntry>> {
        let mut tx = self.pool.begin().await?;

        let entry = sqlx::query_as::<_, DeadLetterEntry>(
            r"
            UPDATE dead_letters
            SET replayed_by = $2, replayed_at = $3, replay_count = replay_count + 1
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(id)
        .bind(actor)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(entry) = entry else {
            tx.rollback().await?;
            return Ok(None);
        };

        if !delivery_attempts::insert(&mut *tx, attempt).await? {
            tx.rollback().await?;
            return Err(CoreError::ConstraintViolation(format!(
                "replay attempt for dead letter {id} already exists"
            )));
        }

        audit_log::insert(&mut *tx, audit).await?;

        tx.commit().await?;

        Ok(Some(entry))
    }
}
