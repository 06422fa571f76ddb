//! Repository for the append-only delivery audit log.
//!
//! Rows are only ever inserted. A database trigger rejects UPDATE and
//! DELETE on the table.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres};

use crate::{
    error::Result,
    models::{AuditEntry, AuditFilter, Page},
};

const FILTER_CLAUSE: &str = r"
    WHERE ($1::uuid IS NULL OR subscription_id = $1)
      AND ($2::uuid IS NULL OR event_id = $2)
      AND ($3::text IS NULL OR event_type = $3)
      AND ($4::text IS NULL OR status = $4)
      AND ($5::text IS NULL OR action = $5)
      AND ($6::timestamptz IS NULL OR recorded_at >= $6)
      AND ($7::timestamptz IS NULL OR recorded_at < $7)
";

/// Inserts one audit entry with any executor, so callers can append inside
/// their own transaction.
///
/// # Errors
///
/// Returns error if insert fails.
pub async fn insert<'e, E>(executor: E, entry: &AuditEntry) -> Result<()>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r"
        INSERT INTO delivery_audit_log (
            id, action, attempt_id, subscription_id, event_id, event_type,
            attempt_number, status, http_status, response_excerpt, error,
            duration_ms, actor, recorded_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ",
    )
    .bind(entry.id)
    .bind(entry.action)
    .bind(entry.attempt_id)
    .bind(entry.subscription_id)
    .bind(entry.event_id)
    .bind(&entry.event_type)
    .bind(i32::try_from(entry.attempt_number).unwrap_or(i32::MAX))
    .bind(entry.status)
    .bind(entry.http_status)
    .bind(&entry.response_excerpt)
    .bind(&entry.error)
    .bind(entry.duration_ms)
    .bind(entry.actor)
    .bind(entry.recorded_at)
    .execute(executor)
    .await?;

    Ok(())
}

/// Repository for audit log operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends an entry.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn record(&self, entry: &AuditEntry) -> Result<()> {
        insert(&*self.pool, entry).await
    }

    /// Returns one page of entries matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn query(&self, filter: &AuditFilter) -> Result<Page<AuditEntry>> {
        let status = filter.status.map(|s| s.as_str());
        let action = filter.action.map(|a| a.as_str());

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM delivery_audit_log {FILTER_CLAUSE}"))
                .bind(filter.subscription_id)
                .bind(filter.event_id)
                .bind(&filter.event_type)
                .bind(status)
                .bind(action)
                .bind(filter.from)
                .bind(filter.to)
                .fetch_one(&*self.pool)
                .await?;

        let items = sqlx::query_as::<_, AuditEntry>(&format!(
            "SELECT * FROM delivery_audit_log {FILTER_CLAUSE} \
             ORDER BY recorded_at DESC, id DESC LIMIT $8 OFFSET $9"
        ))
        .bind(filter.subscription_id)
        .bind(filter.event_id)
        .bind(&filter.event_type)
        .bind(status)
        .bind(action)
        .bind(filter.from)
        .bind(filter.to)
        .bind(i64::from(filter.pagination.limit))
        .bind(i64::try_from(filter.pagination.offset()).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(Page::new(items, u64::try_from(total).unwrap_or(0), filter.pagination))
    }
}
