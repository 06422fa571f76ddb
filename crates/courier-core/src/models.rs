//! Domain models and strongly-typed identifiers.
//!
//! Defines subscriptions, events, delivery attempts, dead-letter entries and
//! audit records, plus the newtype ids that keep them from being mixed up.
//! Status enums are stored as TEXT and carry their own sqlx codecs.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Default page size for audit and dead-letter listings.
pub const DEFAULT_PAGE_LIMIT: u32 = 20;

/// Upper bound on page size for audit and dead-letter listings.
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Error text recorded on attempts cancelled by subscription deactivation.
pub const SUBSCRIPTION_DEACTIVATED: &str = "subscription_deactivated";

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

define_id!(
    /// Identifies a webhook subscription.
    SubscriptionId
);
define_id!(
    /// Identifies the account that owns subscriptions and may replay dead letters.
    OwnerId
);
define_id!(
    /// Identifies a domain event. Producers may supply their own to make
    /// re-dispatch idempotent.
    EventId
);
define_id!(
    /// Identifies a single delivery attempt.
    AttemptId
);
define_id!(
    /// Identifies a dead-letter entry.
    DeadLetterId
);
define_id!(
    /// Identifies an audit log entry.
    AuditEntryId
);

/// Subscription signing secret.
///
/// Hex encoding of 32 random bytes. `Debug` never prints the value and the
/// secret is skipped when a subscription is serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wraps an already generated secret.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret value for signing.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl sqlx::Type<PgDb> for Secret {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for Secret {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(s))
    }
}

impl sqlx::Encode<'_, PgDb> for Secret {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// A subscriber endpoint registered for one or more event types.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    /// Unique identifier.
    pub id: SubscriptionId,

    /// Account that created the subscription.
    pub owner_id: OwnerId,

    /// Destination URL, validated against internal address ranges.
    pub url: String,

    /// Signing secret, only handed out on creation and regeneration.
    #[serde(skip_serializing)]
    pub secret: Secret,

    /// Event types this subscription receives.
    pub events: Vec<String>,

    /// Inactive subscriptions receive no new attempts.
    pub is_active: bool,

    /// Free-form description.
    pub description: Option<String>,

    /// Time of the most recent successful delivery.
    pub last_delivery_at: Option<DateTime<Utc>>,

    /// When the subscription was created.
    pub created_at: DateTime<Utc>,

    /// When the subscription was last modified.
    pub updated_at: DateTime<Utc>,

    /// Soft delete marker. Deleted subscriptions are invisible to lookups
    /// but still count toward the creation rate limit.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Subscription {
    /// Returns true if this subscription should receive `event_type`.
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.is_active && self.deleted_at.is_none() && self.events.iter().any(|e| e == event_type)
    }
}

/// Partial update applied to a subscription. `None` leaves a field as is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    /// New destination URL.
    pub url: Option<String>,
    /// New event set. An empty set is rejected.
    pub events: Option<Vec<String>>,
    /// Activation flag. `Some(false)` deactivates.
    pub is_active: Option<bool>,
    /// New description.
    pub description: Option<String>,
}

/// A domain event emitted by a producer.
///
/// Immutable once stored. Retries and replays re-serialize the stored copy
/// so every attempt carries an identical body and signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    /// Unique identifier, the idempotency key for dispatch.
    pub id: EventId,

    /// Event type such as `clip.approved`.
    pub event_type: String,

    /// When the event occurred.
    pub timestamp: DateTime<Utc>,

    /// Opaque structured payload.
    pub payload: serde_json::Value,
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    event: &'a str,
    timestamp: String,
    data: &'a serde_json::Value,
}

impl Event {
    /// Creates an event with a fresh id.
    pub fn new(
        event_type: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self { id: EventId::new(), event_type: event_type.into(), timestamp, payload }
    }

    /// Serializes the outbound request body
    /// `{"event": ..., "timestamp": <RFC3339>, "data": ...}`.
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be serialized.
    pub fn webhook_body(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&WebhookBody {
            event: &self.event_type,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            data: &self.payload,
        })
    }
}

/// Lifecycle state of a delivery attempt.
///
/// ```text
/// pending -> in_flight -> delivered
///                      -> failed (successor attempt scheduled)
///                      -> dead_lettered
/// pending -> failed (subscription deactivated)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting for `scheduled_at` and a free worker.
    Pending,
    /// Claimed by a worker holding a lease.
    InFlight,
    /// Subscriber answered 2xx. Terminal.
    Delivered,
    /// Attempt failed. A successor may exist.
    Failed,
    /// Retries exhausted. Terminal.
    DeadLettered,
}

impl DeliveryStatus {
    /// Returns true for states that can never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::DeadLettered)
    }

    /// Returns the database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "dead_lettered" => Ok(Self::DeadLettered),
            _ => Err(format!("invalid delivery status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// One attempt to deliver one event to one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Unique identifier, sent as `X-Webhook-Delivery-ID`.
    pub id: AttemptId,

    /// Target subscription.
    pub subscription_id: SubscriptionId,

    /// Event being delivered.
    pub event_id: EventId,

    /// Copy of the event type for filtering.
    pub event_type: String,

    /// 0 for dispatched chains, incremented by each replay.
    pub generation: u32,

    /// Position in the chain, starting at 1.
    pub attempt_number: u32,

    /// Current lifecycle state.
    pub status: DeliveryStatus,

    /// HTTP status returned by the subscriber, if any.
    pub http_status: Option<i32>,

    /// Truncated response body.
    pub response_excerpt: Option<String>,

    /// Failure description.
    pub error: Option<String>,

    /// Earliest time a worker may claim the attempt.
    pub scheduled_at: DateTime<Utc>,

    /// When the attempt finished.
    pub executed_at: Option<DateTime<Utc>>,

    /// When the successor attempt is due, for failed attempts.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Token of the worker currently holding the claim.
    pub lease_token: Option<Uuid>,

    /// When the claim lapses and the attempt returns to pending.
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// When the row was created.
    pub created_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    /// Creates a pending attempt due at `scheduled_at`.
    pub fn pending(
        subscription_id: SubscriptionId,
        event_id: EventId,
        event_type: impl Into<String>,
        generation: u32,
        attempt_number: u32,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AttemptId::new(),
            subscription_id,
            event_id,
            event_type: event_type.into(),
            generation,
            attempt_number,
            status: DeliveryStatus::Pending,
            http_status: None,
            response_excerpt: None,
            error: None,
            scheduled_at,
            executed_at: None,
            next_retry_at: None,
            lease_token: None,
            lease_expires_at: None,
            created_at: scheduled_at,
        }
    }

    /// Returns true for attempts created by a dead-letter replay.
    pub fn is_replay(&self) -> bool {
        self.generation > 0
    }
}

fn non_negative(row: &PgRow, column: &str) -> Result<u32, sqlx::Error> {
    use sqlx::Row;

    let value: i32 = row.try_get(column)?;
    u32::try_from(value)
        .map_err(|_| sqlx::Error::Decode(format!("{column} cannot be negative").into()))
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeliveryAttempt {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        Ok(Self {
            id: row.try_get("id")?,
            subscription_id: row.try_get("subscription_id")?,
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            generation: non_negative(row, "generation")?,
            attempt_number: non_negative(row, "attempt_number")?,
            status: row.try_get("status")?,
            http_status: row.try_get("http_status")?,
            response_excerpt: row.try_get("response_excerpt")?,
            error: row.try_get("error")?,
            scheduled_at: row.try_get("scheduled_at")?,
            executed_at: row.try_get("executed_at")?,
            next_retry_at: row.try_get("next_retry_at")?,
            lease_token: row.try_get("lease_token")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// A terminally failed delivery awaiting manual replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Unique identifier.
    pub id: DeadLetterId,

    /// The final failed attempt.
    pub attempt_id: AttemptId,

    /// Subscription the event was bound for.
    pub subscription_id: SubscriptionId,

    /// Owner of that subscription.
    pub owner_id: OwnerId,

    /// The undeliverable event.
    pub event_id: EventId,

    /// Event type, for filtering.
    pub event_type: String,

    /// Error of the final attempt.
    pub failure_reason: Option<String>,

    /// HTTP status of the final attempt.
    pub last_http_status: Option<i32>,

    /// Who last replayed this entry.
    pub replayed_by: Option<OwnerId>,

    /// When this entry was last replayed.
    pub replayed_at: Option<DateTime<Utc>>,

    /// Number of replays.
    pub replay_count: u32,

    /// When the entry was created.
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeadLetterEntry {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        Ok(Self {
            id: row.try_get("id")?,
            attempt_id: row.try_get("attempt_id")?,
            subscription_id: row.try_get("subscription_id")?,
            owner_id: row.try_get("owner_id")?,
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            failure_reason: row.try_get("failure_reason")?,
            last_http_status: row.try_get("last_http_status")?,
            replayed_by: row.try_get("replayed_by")?,
            replayed_at: row.try_get("replayed_at")?,
            replay_count: non_negative(row, "replay_count")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Kind of action an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A worker executed an attempt.
    Delivery,
    /// An owner replayed a dead letter.
    Replay,
    /// A pending attempt was cancelled by deactivation.
    Cancellation,
}

impl AuditAction {
    /// Returns the database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivery => "delivery",
            Self::Replay => "replay",
            Self::Cancellation => "cancellation",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<PgDb> for AuditAction {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AuditAction {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "delivery" => Ok(Self::Delivery),
            "replay" => Ok(Self::Replay),
            "cancellation" => Ok(Self::Cancellation),
            _ => Err(format!("invalid audit action: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for AuditAction {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Append-only record of something that happened to an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique identifier.
    pub id: AuditEntryId,
    /// What happened.
    pub action: AuditAction,
    /// Attempt the entry is about.
    pub attempt_id: AttemptId,
    /// Subscription of the attempt.
    pub subscription_id: SubscriptionId,
    /// Event of the attempt.
    pub event_id: EventId,
    /// Event type of the attempt.
    pub event_type: String,
    /// Attempt number of the attempt.
    pub attempt_number: u32,
    /// Status the attempt was left in.
    pub status: DeliveryStatus,
    /// HTTP status returned by the subscriber.
    pub http_status: Option<i32>,
    /// Truncated response body.
    pub response_excerpt: Option<String>,
    /// Failure description.
    pub error: Option<String>,
    /// Wall time of the HTTP exchange.
    pub duration_ms: Option<i64>,
    /// Owner who triggered the action, for replays.
    pub actor: Option<OwnerId>,
    /// When the entry was written.
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Starts an entry describing `attempt` as it is now.
    pub fn for_attempt(
        action: AuditAction,
        attempt: &DeliveryAttempt,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AuditEntryId::new(),
            action,
            attempt_id: attempt.id,
            subscription_id: attempt.subscription_id,
            event_id: attempt.event_id,
            event_type: attempt.event_type.clone(),
            attempt_number: attempt.attempt_number,
            status: attempt.status,
            http_status: attempt.http_status,
            response_excerpt: attempt.response_excerpt.clone(),
            error: attempt.error.clone(),
            duration_ms: None,
            actor: None,
            recorded_at,
        }
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for AuditEntry {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        Ok(Self {
            id: row.try_get("id")?,
            action: row.try_get("action")?,
            attempt_id: row.try_get("attempt_id")?,
            subscription_id: row.try_get("subscription_id")?,
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            attempt_number: non_negative(row, "attempt_number")?,
            status: row.try_get("status")?,
            http_status: row.try_get("http_status")?,
            response_excerpt: row.try_get("response_excerpt")?,
            error: row.try_get("error")?,
            duration_ms: row.try_get("duration_ms")?,
            actor: row.try_get("actor")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

/// 1-based page request with a clamped limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Page number, starting at 1.
    pub page: u32,
    /// Items per page.
    pub limit: u32,
}

impl Pagination {
    /// Creates a page request, clamping page to at least 1 and limit to
    /// `1..=MAX_PAGE_LIMIT`.
    pub fn new(page: u32, limit: u32) -> Self {
        Self { page: page.max(1), limit: limit.clamp(1, MAX_PAGE_LIMIT) }
    }

    /// Number of rows to skip.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_LIMIT)
    }
}

/// One page of results plus the total match count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Total number of matching items.
    pub total: u64,
    /// Page number.
    pub page: u32,
    /// Requested page size.
    pub limit: u32,
}

impl<T> Page<T> {
    /// Builds a page from already sliced items.
    pub fn new(items: Vec<T>, total: u64, pagination: Pagination) -> Self {
        Self { items, total, page: pagination.page, limit: pagination.limit }
    }
}

/// Audit log query. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    /// Restrict to one subscription.
    pub subscription_id: Option<SubscriptionId>,
    /// Restrict to one event.
    pub event_id: Option<EventId>,
    /// Restrict to one event type.
    pub event_type: Option<String>,
    /// Restrict to entries leaving the attempt in this status.
    pub status: Option<DeliveryStatus>,
    /// Restrict to one action.
    pub action: Option<AuditAction>,
    /// Inclusive lower bound on `recorded_at`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `recorded_at`.
    pub to: Option<DateTime<Utc>>,
    /// Page to return.
    pub pagination: Pagination,
}

impl AuditFilter {
    /// Returns true if `entry` satisfies every set criterion.
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.subscription_id.is_none_or(|id| entry.subscription_id == id)
            && self.event_id.is_none_or(|id| entry.event_id == id)
            && self.event_type.as_deref().is_none_or(|t| entry.event_type == t)
            && self.status.is_none_or(|s| entry.status == s)
            && self.action.is_none_or(|a| entry.action == a)
            && self.from.is_none_or(|from| entry.recorded_at >= from)
            && self.to.is_none_or(|to| entry.recorded_at < to)
    }
}

/// Dead-letter listing query. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterFilter {
    /// Restrict to subscriptions of one owner.
    pub owner_id: Option<OwnerId>,
    /// Restrict to one subscription.
    pub subscription_id: Option<SubscriptionId>,
    /// Restrict to one event type.
    pub event_type: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub to: Option<DateTime<Utc>>,
    /// `Some(true)` for replayed entries only, `Some(false)` for untouched ones.
    pub replayed: Option<bool>,
    /// Page to return.
    pub pagination: Pagination,
}

impl DeadLetterFilter {
    /// Returns true if `entry` satisfies every set criterion.
    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.owner_id.is_none_or(|id| entry.owner_id == id)
            && self.subscription_id.is_none_or(|id| entry.subscription_id == id)
            && self.event_type.as_deref().is_none_or(|t| entry.event_type == t)
            && self.from.is_none_or(|from| entry.created_at >= from)
            && self.to.is_none_or(|to| entry.created_at < to)
            && self.replayed.is_none_or(|r| entry.replayed_at.is_some() == r)
    }
}

/// What a worker observed while executing an attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptOutcome {
    /// HTTP status, if a response arrived.
    pub http_status: Option<i32>,
    /// Truncated response body.
    pub response_excerpt: Option<String>,
    /// Failure description, `None` on success.
    pub error: Option<String>,
    /// Wall time of the HTTP exchange.
    pub duration_ms: Option<i64>,
}

/// How an in-flight attempt leaves the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// 2xx received.
    Delivered,
    /// Failed with a successor attempt to insert.
    Retry(DeliveryAttempt),
    /// Failed for the last time, with the dead-letter entry to insert.
    DeadLetter(DeadLetterEntry),
    /// Subscription was deactivated before execution.
    Cancelled,
}

impl Disposition {
    /// Final status of the completed attempt.
    pub fn status(&self) -> DeliveryStatus {
        match self {
            Self::Delivered => DeliveryStatus::Delivered,
            Self::Retry(_) | Self::Cancelled => DeliveryStatus::Failed,
            Self::DeadLetter(_) => DeliveryStatus::DeadLettered,
        }
    }
}

/// Everything written atomically when a worker releases its claim.
#[derive(Debug, Clone)]
pub struct AttemptCompletion {
    /// Attempt being completed.
    pub attempt_id: AttemptId,
    /// Lease token obtained at claim time. Completion is refused if the
    /// lease has since been revoked.
    pub lease_token: Uuid,
    /// Observed result.
    pub outcome: AttemptOutcome,
    /// Resulting transition.
    pub disposition: Disposition,
    /// When execution finished.
    pub executed_at: DateTime<Utc>,
    /// Audit entry to append.
    pub audit: AuditEntry,
}

/// What storage actually wrote for a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionResult {
    /// The disposition was applied as given.
    Applied,
    /// The attempt failed, but its successor was dropped because the
    /// subscription is no longer active.
    RetryDropped,
    /// The lease no longer held. Nothing was written.
    LeaseLost,
}

/// Queue and outcome counts read from storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    /// Live subscriptions that are active.
    pub active_subscriptions: u64,
    /// Attempts waiting to be claimed, due or scheduled.
    pub pending_attempts: u64,
    /// Attempts currently leased by a worker.
    pub in_flight_attempts: u64,
    /// Dead-letter entries not replayed yet.
    pub dead_letters: u64,
    /// Attempts delivered since the window start.
    pub recent_delivered: u64,
    /// Attempts failed or dead-lettered since the window start.
    pub recent_failed: u64,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn subscription(events: &[&str]) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: SubscriptionId::new(),
            owner_id: OwnerId::new(),
            url: "https://hooks.example.com/clips".to_string(),
            secret: Secret::new("00".repeat(32)),
            events: events.iter().map(ToString::to_string).collect(),
            is_active: true,
            description: None,
            last_delivery_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn delivery_status_display_matches_storage_format() {
        assert_eq!(DeliveryStatus::Pending.to_string(), "pending");
        assert_eq!(DeliveryStatus::InFlight.to_string(), "in_flight");
        assert_eq!(DeliveryStatus::Delivered.to_string(), "delivered");
        assert_eq!(DeliveryStatus::Failed.to_string(), "failed");
        assert_eq!(DeliveryStatus::DeadLettered.to_string(), "dead_lettered");
    }

    #[test]
    fn terminal_states() {
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(!DeliveryStatus::InFlight.is_terminal());
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::DeadLettered.is_terminal());
    }

    #[test]
    fn secret_is_redacted_and_not_serialized() {
        let sub = subscription(&["clip.approved"]);

        assert_eq!(format!("{:?}", sub.secret), "Secret(***)");
        let json = serde_json::to_value(&sub).unwrap();
        assert!(json.get("secret").is_none());
        assert_eq!(json["url"], "https://hooks.example.com/clips");
    }

    #[test]
    fn inactive_subscription_matches_nothing() {
        let mut sub = subscription(&["clip.approved"]);
        assert!(sub.subscribes_to("clip.approved"));
        assert!(!sub.subscribes_to("clip.rejected"));

        sub.is_active = false;
        assert!(!sub.subscribes_to("clip.approved"));
    }

    #[test]
    fn webhook_body_has_event_timestamp_and_data() {
        let timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let event =
            Event::new("clip.submitted", timestamp, serde_json::json!({ "clip_id": "c-1" }));

        let body: serde_json::Value = serde_json::from_slice(&event.webhook_body().unwrap()).unwrap();

        assert_eq!(body["event"], "clip.submitted");
        assert_eq!(body["timestamp"], "2024-03-01T12:30:00Z");
        assert_eq!(body["data"]["clip_id"], "c-1");
    }

    #[test]
    fn webhook_body_is_stable_across_calls() {
        let event = Event::new("clip.approved", Utc::now(), serde_json::json!({ "b": 1, "a": 2 }));
        assert_eq!(event.webhook_body().unwrap(), event.webhook_body().unwrap());
    }

    #[test]
    fn pagination_clamps_and_offsets() {
        assert_eq!(Pagination::new(0, 0), Pagination { page: 1, limit: 1 });
        assert_eq!(Pagination::new(3, 500).limit, MAX_PAGE_LIMIT);
        assert_eq!(Pagination::new(3, 20).offset(), 40);
    }

    #[test]
    fn disposition_maps_to_final_status() {
        assert_eq!(Disposition::Delivered.status(), DeliveryStatus::Delivered);
        assert_eq!(Disposition::Cancelled.status(), DeliveryStatus::Failed);
    }

    #[test]
    fn audit_filter_matches_on_every_field() {
        let attempt = DeliveryAttempt::pending(
            SubscriptionId::new(),
            EventId::new(),
            "clip.rejected",
            0,
            2,
            Utc::now(),
        );
        let entry = AuditEntry::for_attempt(AuditAction::Delivery, &attempt, Utc::now());

        let mut filter = AuditFilter {
            subscription_id: Some(attempt.subscription_id),
            event_type: Some("clip.rejected".to_string()),
            ..AuditFilter::default()
        };
        assert!(filter.matches(&entry));

        filter.action = Some(AuditAction::Replay);
        assert!(!filter.matches(&entry));
    }
}
