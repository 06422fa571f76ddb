//! Test data builders.

use chrono::{DateTime, Utc};
use courier_core::models::{Event, OwnerId, Secret, Subscription, SubscriptionId};
use serde_json::json;

/// Builds subscriptions for direct insertion into storage, skipping URL
/// validation so tests can point at local wiremock servers.
#[derive(Debug, Clone)]
pub struct SubscriptionBuilder {
    owner_id: OwnerId,
    url: String,
    secret: Secret,
    events: Vec<String>,
    is_active: bool,
    created_at: Option<DateTime<Utc>>,
}

impl SubscriptionBuilder {
    /// Starts a builder for `url` subscribed to `clip.approved`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            owner_id: OwnerId::new(),
            url: url.into(),
            secret: courier_delivery::signing::generate_secret(),
            events: vec!["clip.approved".to_string()],
            is_active: true,
            created_at: None,
        }
    }

    /// Sets the owner.
    #[must_use]
    pub fn owner(mut self, owner_id: OwnerId) -> Self {
        self.owner_id = owner_id;
        self
    }

    /// Replaces the event set.
    #[must_use]
    pub fn events(mut self, events: &[&str]) -> Self {
        self.events = events.iter().map(ToString::to_string).collect();
        self
    }

    /// Sets the signing secret.
    #[must_use]
    pub fn secret(mut self, secret: Secret) -> Self {
        self.secret = secret;
        self
    }

    /// Marks the subscription inactive.
    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Sets the creation time.
    #[must_use]
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Builds the subscription, stamped `now` unless a creation time was set.
    pub fn build(self, now: DateTime<Utc>) -> Subscription {
        let created_at = self.created_at.unwrap_or(now);
        Subscription {
            id: SubscriptionId::new(),
            owner_id: self.owner_id,
            url: self.url,
            secret: self.secret,
            events: self.events,
            is_active: self.is_active,
            description: None,
            last_delivery_at: None,
            created_at,
            updated_at: created_at,
            deleted_at: None,
        }
    }
}

/// A `clip.*` event with a small payload.
pub fn clip_event(event_type: &str, at: DateTime<Utc>) -> Event {
    Event::new(
        event_type,
        at,
        json!({
            "clip_id": "clip_01",
            "title": "Best play of the night",
            "submitted_by": "user_42",
        }),
    )
}
