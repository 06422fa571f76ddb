//! Audit log access.
//!
//! Entries are written by storage alongside each attempt transition; this
//! module only appends standalone entries and answers queries.

use std::sync::Arc;

use courier_core::models::{
    AuditEntry, AuditFilter, DeliveryAttempt, OwnerId, Page, Pagination, SubscriptionId,
};

use crate::{error::RegistryError, storage::DeliveryStorage};

/// Read access to the append-only audit log.
#[derive(Clone)]
pub struct AuditLog {
    storage: Arc<dyn DeliveryStorage>,
}

impl AuditLog {
    /// Creates an audit log view.
    pub fn new(storage: Arc<dyn DeliveryStorage>) -> Self {
        Self { storage }
    }

    /// Appends an entry.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the insert fails.
    pub async fn record(&self, entry: &AuditEntry) -> Result<(), RegistryError> {
        Ok(self.storage.record_audit(entry).await?)
    }

    /// Pages through entries matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the query fails.
    pub async fn query(&self, filter: &AuditFilter) -> Result<Page<AuditEntry>, RegistryError> {
        Ok(self.storage.query_audit(filter).await?)
    }

    /// Pages through a subscription's attempts for its owner.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the subscription does not exist or belongs to
    /// another owner.
    pub async fn delivery_history(
        &self,
        subscription_id: SubscriptionId,
        owner_id: OwnerId,
        pagination: Pagination,
    ) -> Result<Page<DeliveryAttempt>, RegistryError> {
        let owned = self
            .storage
            .find_subscription(subscription_id)
            .await?
            .is_some_and(|s| s.owner_id == owner_id);
        if !owned {
            return Err(RegistryError::NotFound(format!("subscription {subscription_id}")));
        }

        Ok(self.storage.list_attempts_for_subscription(subscription_id, pagination).await?)
    }
}
