//! PostgreSQL repositories for courier persistence.
//!
//! The repository layer translates between domain models and the schema in
//! [`schema`]. All SQL lives in this module.

use std::sync::Arc;

use sqlx::PgPool;

pub mod audit_log;
pub mod dead_letters;
pub mod delivery_attempts;
pub mod events;
pub mod schema;
pub mod subscriptions;

use crate::error::Result;

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Subscription records and their secrets.
    pub subscriptions: Arc<subscriptions::Repository>,

    /// Stored domain events.
    pub events: Arc<events::Repository>,

    /// The delivery queue.
    pub delivery_attempts: Arc<delivery_attempts::Repository>,

    /// Terminally failed deliveries.
    pub dead_letters: Arc<dead_letters::Repository>,

    /// Append-only audit log.
    pub audit_log: Arc<audit_log::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            subscriptions: Arc::new(subscriptions::Repository::new(pool.clone())),
            events: Arc::new(events::Repository::new(pool.clone())),
            delivery_attempts: Arc::new(delivery_attempts::Repository::new(pool.clone())),
            dead_letters: Arc::new(dead_letters::Repository::new(pool.clone())),
            audit_log: Arc::new(audit_log::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Verifies database connectivity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}
