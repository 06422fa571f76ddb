//! Repository for stored domain events.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Event, EventId},
};

/// Repository for event database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Stores an event unless one with the same id already exists.
    ///
    /// Returns true if the row was inserted. Existing events are never
    /// overwritten.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn insert_if_absent(&self, event: &Event) -> Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO webhook_events (id, event_type, timestamp, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(event.id)
        .bind(&event.event_type)
        .bind(event.timestamp)
        .bind(&event.payload)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Finds an event by id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: EventId) -> Result<Option<Event>> {
        let event = sqlx::query_as::<_, Event>(
            "SELECT id, event_type, timestamp, payload FROM webhook_events WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }
}
