//! Subscription registry.
//!
//! Owners register endpoints here. Creation validates the URL against
//! internal address ranges, enforces the per-owner creation rate limit, and
//! hands out a freshly generated signing secret exactly once. Every lookup
//! is owner-scoped: a subscription owned by someone else is reported as not
//! found.
//!
//! A registry sharing the engine's `InFlightDeliveries` also abandons
//! requests already on the wire when it deactivates or deletes a
//! subscription.

use std::{sync::Arc, time::Duration};

use courier_core::{
    models::{OwnerId, Secret, Subscription, SubscriptionId, SubscriptionUpdate},
    Clock,
};
use tracing::{debug, info, warn};

use crate::{
    error::RegistryError,
    in_flight::InFlightDeliveries,
    signing,
    storage::DeliveryStorage,
    validation::{self, UrlValidator, SUPPORTED_EVENTS},
};

/// Default subscription creations allowed per owner per window.
pub const DEFAULT_CREATE_LIMIT: u32 = 10;

/// Registry limits.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Creations allowed per owner within `create_window`.
    pub create_limit: u32,
    /// Sliding window for the creation limit.
    pub create_window: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { create_limit: DEFAULT_CREATE_LIMIT, create_window: Duration::from_secs(3600) }
    }
}

/// Manages webhook subscriptions.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    storage: Arc<dyn DeliveryStorage>,
    validator: UrlValidator,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
    in_flight: InFlightDeliveries,
}

impl SubscriptionRegistry {
    /// Creates a registry.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        validator: UrlValidator,
        clock: Arc<dyn Clock>,
        config: RegistryConfig,
    ) -> Self {
        Self { storage, validator, clock, config, in_flight: InFlightDeliveries::new() }
    }

    /// Shares the engine's in-flight tracker, so deactivation abandons
    /// requests already sent.
    #[must_use]
    pub fn with_in_flight(mut self, in_flight: InFlightDeliveries) -> Self {
        self.in_flight = in_flight;
        self
    }

    /// Event types accepted by `create` and `update`.
    pub fn supported_events() -> &'static [&'static str] {
        SUPPORTED_EVENTS
    }

    /// Registers a new subscription and returns it with its secret.
    ///
    /// The secret is not retrievable afterwards; it can only be replaced
    /// with `regenerate_secret`.
    ///
    /// # Errors
    ///
    /// - `InvalidUrl` if the URL is malformed or resolves to an internal address
    /// - `Validation` for bad event types or an oversized description
    /// - `RateLimited` once the owner reached the creation limit
    ///
    /// Repeated event types are stored once.
    pub async fn create(
        &self,
        owner_id: OwnerId,
        url: &str,
        events: Vec<String>,
        description: Option<String>,
    ) -> Result<(Subscription, Secret), RegistryError> {
        let events = validation::normalize_event_types(events)?;
        validation::validate_description(description.as_deref())?;
        let url = self.validator.validate(url).await?;

        let now = self.clock.now_utc();
        let window = chrono::Duration::from_std(self.config.create_window)
            .map_err(|e| RegistryError::Validation(format!("invalid rate limit window: {e}")))?;

        let secret = signing::generate_secret();
        let subscription = Subscription {
            id: SubscriptionId::new(),
            owner_id,
            url: url.to_string(),
            secret: secret.clone(),
            events,
            is_active: true,
            description,
            last_delivery_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        let inserted = self
            .storage
            .insert_subscription_within_limit(
                &subscription,
                now - window,
                u64::from(self.config.create_limit),
            )
            .await?;
        if !inserted {
            warn!(%owner_id, limit = self.config.create_limit, "subscription creation rate limited");
            return Err(RegistryError::RateLimited {
                limit: self.config.create_limit,
                window_secs: self.config.create_window.as_secs(),
            });
        }

        info!(
            subscription_id = %subscription.id,
            %owner_id,
            events = ?subscription.events,
            "subscription created"
        );

        Ok((subscription, secret))
    }

    /// Returns an owner's subscription.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the subscription does not exist or belongs to
    /// another owner.
    pub async fn get(
        &self,
        id: SubscriptionId,
        owner_id: OwnerId,
    ) -> Result<Subscription, RegistryError> {
        self.storage
            .find_subscription(id)
            .await?
            .filter(|s| s.owner_id == owner_id)
            .ok_or_else(|| RegistryError::NotFound(format!("subscription {id}")))
    }

    /// Lists an owner's subscriptions, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the query fails.
    pub async fn list(&self, owner_id: OwnerId) -> Result<Vec<Subscription>, RegistryError> {
        Ok(self.storage.list_subscriptions(owner_id).await?)
    }

    /// Applies a partial update.
    ///
    /// A changed URL is validated again. `is_active: Some(false)` goes
    /// through `deactivate`, cancelling pending attempts.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `InvalidUrl` or `Validation`.
    pub async fn update(
        &self,
        id: SubscriptionId,
        owner_id: OwnerId,
        update: SubscriptionUpdate,
    ) -> Result<Subscription, RegistryError> {
        let mut subscription = self.get(id, owner_id).await?;

        if let Some(url) = &update.url {
            subscription.url = self.validator.validate(url).await?.to_string();
        }
        if let Some(events) = update.events {
            subscription.events = validation::normalize_event_types(events)?;
        }
        if let Some(description) = update.description {
            validation::validate_description(Some(&description))?;
            subscription.description = Some(description);
        }

        let deactivating = update.is_active == Some(false) && subscription.is_active;
        if update.is_active == Some(true) {
            subscription.is_active = true;
        }
        subscription.updated_at = self.clock.now_utc();

        if !self.storage.update_subscription(&subscription).await? {
            return Err(RegistryError::NotFound(format!("subscription {id}")));
        }

        if deactivating {
            self.deactivate(id, owner_id).await?;
            return self.get(id, owner_id).await;
        }

        debug!(subscription_id = %id, "subscription updated");
        Ok(subscription)
    }

    /// Replaces the signing secret. Deliveries made after this call are
    /// signed with the new secret only.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the subscription does not exist or belongs to
    /// another owner.
    pub async fn regenerate_secret(
        &self,
        id: SubscriptionId,
        owner_id: OwnerId,
    ) -> Result<Secret, RegistryError> {
        self.get(id, owner_id).await?;

        let secret = signing::generate_secret();
        if !self.storage.set_subscription_secret(id, &secret, self.clock.now_utc()).await? {
            return Err(RegistryError::NotFound(format!("subscription {id}")));
        }

        info!(subscription_id = %id, "subscription secret regenerated");
        Ok(secret)
    }

    /// Deactivates a subscription and cancels its pending attempts.
    ///
    /// Returns the number of pending attempts cancelled. Claimed attempts
    /// are cancelled by their worker: before the request if it has not been
    /// sent, by abandoning it if it is on the wire. A failure completing
    /// afterwards schedules no retry.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the subscription does not exist or belongs to
    /// another owner.
    pub async fn deactivate(
        &self,
        id: SubscriptionId,
        owner_id: OwnerId,
    ) -> Result<usize, RegistryError> {
        self.get(id, owner_id).await?;

        let cancelled = self
            .storage
            .deactivate_subscription(id, self.clock.now_utc())
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("subscription {id}")))?;
        self.in_flight.cancel(id);

        info!(subscription_id = %id, cancelled = cancelled.len(), "subscription deactivated");
        Ok(cancelled.len())
    }

    /// Deletes a subscription, cancelling pending attempts first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the subscription does not exist or belongs to
    /// another owner.
    pub async fn delete(
        &self,
        id: SubscriptionId,
        owner_id: OwnerId,
    ) -> Result<usize, RegistryError> {
        self.get(id, owner_id).await?;

        let cancelled = self
            .storage
            .delete_subscription(id, self.clock.now_utc())
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("subscription {id}")))?;
        self.in_flight.cancel(id);

        info!(subscription_id = %id, cancelled = cancelled.len(), "subscription deleted");
        Ok(cancelled.len())
    }
}
