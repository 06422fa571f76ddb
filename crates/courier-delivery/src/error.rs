//! Error types for registry and delivery operations.
//!
//! `RegistryError` is returned to owners managing subscriptions and dead
//! letters. `DeliveryError` describes why a single HTTP delivery failed; it
//! never reaches event producers and ends up in the audit log instead.

use std::{fmt, time::Duration};

use courier_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors returned by subscription, dead-letter and audit operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// URL is malformed, not http(s), or points at an internal address.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Owner exceeded the subscription creation limit.
    #[error("rate limited: at most {limit} subscriptions per {window_secs}s")]
    RateLimited {
        /// Creations allowed per window
        limit: u32,
        /// Window length in seconds
        window_secs: u64,
    },

    /// Request fields failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Entity missing or owned by someone else.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation requires an active subscription.
    #[error("subscription {0} is inactive")]
    SubscriptionInactive(String),

    /// Operation conflicts with work already queued.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] CoreError),
}

/// Comprehensive error types for webhook delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection refused, reset, or TLS failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// Subscriber host did not resolve.
    #[error("dns resolution failed: {message}")]
    DnsError {
        /// Resolver message
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// HTTP response indicated client error (4xx).
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body excerpt
        body: String,
    },

    /// HTTP response indicated server error (5xx).
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body excerpt
        body: String,
    },

    /// Subscriber answered with a redirect or another non-2xx status.
    #[error("unexpected response: HTTP {status_code}")]
    UnexpectedStatus {
        /// HTTP status code
        status_code: u16,
        /// Response body excerpt
        body: String,
    },

    /// Database operation failed during delivery.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// Invalid client or engine configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Worker shutdown requested.
    #[error("worker shutdown requested")]
    ShutdownRequested,

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Worker index
        worker_id: usize,
        /// Join error text
        error: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a DNS error from a message.
    pub fn dns(message: impl Into<String>) -> Self {
        Self::DnsError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates the error for a non-2xx response.
    pub fn from_status(status_code: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status_code {
            400..=499 => Self::ClientError { status_code, body },
            500..=599 => Self::ServerError { status_code, body },
            _ => Self::UnexpectedStatus { status_code, body },
        }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// HTTP status carried by the error, if a response arrived.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. }
            | Self::ServerError { status_code, .. }
            | Self::UnexpectedStatus { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    /// Response body excerpt carried by the error.
    pub fn response_body(&self) -> Option<&str> {
        match self {
            Self::ClientError { body, .. }
            | Self::ServerError { body, .. }
            | Self::UnexpectedStatus { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Classifies the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NetworkError { .. }
            | Self::DnsError { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. } => ErrorClass::Transient,
            Self::ClientError { .. } | Self::UnexpectedStatus { .. } => ErrorClass::Permanent,
            Self::DatabaseError { .. }
            | Self::ConfigurationError { .. }
            | Self::ShutdownRequested
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. }
            | Self::InternalError { .. } => ErrorClass::Internal,
        }
    }

    /// Returns true if a failed attempt with this error gets a successor.
    ///
    /// Transient and permanent delivery failures are retried alike until
    /// the attempt budget runs out. Internal errors never consume an
    /// attempt because the worker does not complete the attempt for them.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Permanent)
    }
}

/// Broad category of a delivery error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, connection failures, DNS failures and 5xx.
    Transient,
    /// 4xx and other non-2xx responses.
    Permanent,
    /// Failures of courier itself.
    Internal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_variants() {
        assert!(matches!(DeliveryError::from_status(404, ""), DeliveryError::ClientError { .. }));
        assert!(matches!(DeliveryError::from_status(503, ""), DeliveryError::ServerError { .. }));
        assert!(matches!(
            DeliveryError::from_status(302, ""),
            DeliveryError::UnexpectedStatus { .. }
        ));
    }

    #[test]
    fn client_and_server_errors_are_both_retried() {
        assert_eq!(DeliveryError::from_status(500, "").class(), ErrorClass::Transient);
        assert_eq!(DeliveryError::from_status(410, "").class(), ErrorClass::Permanent);
        assert!(DeliveryError::from_status(500, "").is_retryable());
        assert!(DeliveryError::from_status(410, "").is_retryable());
        assert!(DeliveryError::timeout(10).is_retryable());
        assert!(DeliveryError::dns("no such host").is_retryable());
    }

    #[test]
    fn internal_errors_are_not_delivery_failures() {
        assert!(!DeliveryError::database("connection lost").is_retryable());
        assert!(!DeliveryError::ShutdownRequested.is_retryable());
    }

    #[test]
    fn status_and_body_are_exposed() {
        let error = DeliveryError::from_status(500, "boom");
        assert_eq!(error.status_code(), Some(500));
        assert_eq!(error.response_body(), Some("boom"));
        assert_eq!(DeliveryError::timeout(10).status_code(), None);
    }

    #[test]
    fn error_display_format() {
        assert_eq!(DeliveryError::timeout(10).to_string(), "request timeout after 10s");
        assert_eq!(
            RegistryError::RateLimited { limit: 10, window_secs: 3600 }.to_string(),
            "rate limited: at most 10 subscriptions per 3600s"
        );
    }
}
