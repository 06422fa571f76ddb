//! HTTP client for webhook delivery with configurable timeouts.
//!
//! Handles request construction, bounded response reading, and error
//! categorization for the retry scheduler. Redirects are never followed: a
//! redirect target has not been through URL validation.

use std::{error::Error as _, net::SocketAddr, time::Duration};

use bytes::{Bytes, BytesMut};
use reqwest::{header::CONTENT_TYPE, Response};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use courier_core::models::{AttemptId, EventId};

use crate::error::{DeliveryError, Result};

/// Default request timeout covering connect and response.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Suffix appended to truncated response excerpts.
pub const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for the whole exchange.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Bytes of response body read before giving up on the rest.
    pub max_response_bytes: usize,
    /// Bytes of response body kept as the audit excerpt.
    pub max_excerpt_bytes: usize,
    /// Static host overrides, bypassing DNS for the named domains.
    pub resolve_overrides: Vec<(String, SocketAddr)>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DELIVERY_TIMEOUT,
            user_agent: "Courier-Webhooks/1.0".to_string(),
            max_response_bytes: 10 * 1024,
            max_excerpt_bytes: 1024,
            resolve_overrides: Vec::new(),
        }
    }
}

/// HTTP client used by delivery workers.
///
/// Wraps a pooled `reqwest::Client`. Any HTTP response, 2xx or not, is
/// returned as a `DeliveryResponse`; only transport failures are errors.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// Request context for a webhook delivery.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Attempt id, sent as `X-Webhook-Delivery-ID`.
    pub delivery_id: AttemptId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Event type, sent as `X-Webhook-Event`.
    pub event_type: String,
    /// Destination URL for the webhook.
    pub url: String,
    /// Serialized body, exactly the bytes that were signed.
    pub body: Bytes,
    /// Hex HMAC-SHA256 of `body`.
    pub signature: String,
    /// Attempt number for this delivery.
    pub attempt_number: u32,
    /// Set for attempts created by a dead-letter replay.
    pub replay: bool,
}

/// Response from a webhook delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Truncated response body.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
    /// Whether the request was successful (2xx status).
    pub is_success: bool,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be configured with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none());

        for (domain, addr) in &config.resolve_overrides {
            builder = builder.resolve(domain, *addr);
        }

        let client = builder.build().map_err(|e| {
            DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
        })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the TLS backend fails
    /// to initialize.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// POSTs a signed webhook to the subscriber.
    ///
    /// # Errors
    ///
    /// - `Timeout` when no response arrives within the configured timeout
    /// - `DnsError` when the host does not resolve
    /// - `NetworkError` for refused connections, resets and TLS failures
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "webhook_delivery",
            event_id = %request.event_id,
            delivery_id = %request.delivery_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            tracing::debug!("starting webhook delivery");

            let mut http_request = self
                .client
                .post(&request.url)
                .header(CONTENT_TYPE, "application/json")
                .header("X-Webhook-Signature", &request.signature)
                .header("X-Webhook-Event", &request.event_type)
                .header("X-Webhook-Delivery-ID", request.delivery_id.to_string())
                .header("X-Webhook-Attempt", request.attempt_number.to_string())
                .body(request.body.clone());

            if request.replay {
                http_request = http_request.header("X-Webhook-Replay", "true");
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "request failed: {}", e);
                    return Err(self.categorize(&e));
                },
            };

            let duration = start_time.elapsed();
            let delivery_response = self.read_response(response, duration).await;

            match delivery_response.status_code {
                200..=299 => {
                    tracing::info!(
                        status = delivery_response.status_code,
                        duration_ms = duration.as_millis(),
                        "webhook delivered"
                    );
                },
                status => {
                    tracing::warn!(status, duration_ms = duration.as_millis(), "webhook rejected");
                },
            }

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }

    fn categorize(&self, e: &reqwest::Error) -> DeliveryError {
        if e.is_timeout() {
            return DeliveryError::timeout(self.config.timeout.as_secs());
        }
        if is_dns_failure(e) {
            return DeliveryError::dns(e.to_string());
        }
        if e.is_connect() {
            return DeliveryError::network(format!("connection failed: {e}"));
        }
        DeliveryError::network(e.to_string())
    }

    async fn read_response(&self, mut response: Response, duration: Duration) -> DeliveryResponse {
        let status_code = response.status().as_u16();
        let is_success = response.status().is_success();

        let mut buffer = BytesMut::new();
        let mut overflow = false;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let room = self.config.max_response_bytes.saturating_sub(buffer.len());
                    if chunk.len() > room {
                        buffer.extend_from_slice(&chunk[..room]);
                        overflow = true;
                        break;
                    }
                    buffer.extend_from_slice(&chunk);
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("failed to read response body: {}", e);
                    break;
                },
            }
        }

        let body = excerpt(&buffer, self.config.max_excerpt_bytes, overflow);

        DeliveryResponse { status_code, body, duration, is_success }
    }
}

/// Cuts a response body down to at most `max_bytes`, suffix included.
pub fn excerpt(body: &[u8], max_bytes: usize, force_suffix: bool) -> String {
    if body.len() <= max_bytes && !force_suffix {
        return String::from_utf8_lossy(body).into_owned();
    }
    let keep = max_bytes.saturating_sub(TRUNCATION_SUFFIX.len()).min(body.len());
    let mut text = String::from_utf8_lossy(&body[..keep]).into_owned();
    // a cut inside a multi-byte character decodes to U+FFFD
    if text.ends_with(char::REPLACEMENT_CHARACTER) {
        text.pop();
    }
    text.push_str(TRUNCATION_SUFFIX);
    text
}

fn is_dns_failure(e: &reqwest::Error) -> bool {
    let mut source = e.source();
    while let Some(err) = source {
        let message = err.to_string();
        if message.contains("dns error") || message.contains("failed to lookup address") {
            return true;
        }
        source = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn create_test_request(url: String) -> DeliveryRequest {
        DeliveryRequest {
            delivery_id: AttemptId::new(),
            event_id: EventId::new(),
            event_type: "clip.approved".to_string(),
            url,
            body: Bytes::from_static(br#"{"event":"clip.approved"}"#),
            signature: "ab12".to_string(),
            attempt_number: 2,
            replay: false,
        }
    }

    #[tokio::test]
    async fn successful_delivery() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/webhook"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let request = create_test_request(format!("{}/webhook", mock_server.uri()));

        let response = client.deliver(request).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert!(response.is_success);
        assert_eq!(response.body, "OK");
    }

    #[tokio::test]
    async fn webhook_headers_are_sent() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::header("X-Webhook-Signature", "ab12"))
            .and(matchers::header("X-Webhook-Event", "clip.approved"))
            .and(matchers::header("X-Webhook-Attempt", "2"))
            .and(matchers::header("user-agent", "Courier-Webhooks/1.0"))
            .and(matchers::header_exists("X-Webhook-Delivery-ID"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response =
            client.deliver(create_test_request(format!("{}/x", mock_server.uri()))).await.unwrap();

        assert!(response.is_success);
    }

    #[tokio::test]
    async fn replay_header_only_on_replays() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::header("X-Webhook-Replay", "true"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(418))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let mut request = create_test_request(mock_server.uri());
        assert_eq!(client.deliver(request.clone()).await.unwrap().status_code, 418);

        request.replay = true;
        assert_eq!(client.deliver(request).await.unwrap().status_code, 200);
    }

    #[tokio::test]
    async fn server_error_is_a_response_not_an_error() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.deliver(create_test_request(mock_server.uri())).await.unwrap();

        assert_eq!(response.status_code, 500);
        assert_eq!(response.body, "Internal Server Error");
        assert!(!response.is_success);
    }

    #[tokio::test]
    async fn redirects_are_not_followed() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::path("/moved"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/target"))
            .mount(&mock_server)
            .await;
        Mock::given(matchers::path("/target"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client
            .deliver(create_test_request(format!("{}/moved", mock_server.uri())))
            .await
            .unwrap();

        assert_eq!(response.status_code, 302);
        assert!(!response.is_success);
    }

    #[tokio::test]
    async fn large_bodies_are_truncated() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("e".repeat(64 * 1024)))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.deliver(create_test_request(mock_server.uri())).await.unwrap();

        assert_eq!(response.body.len(), 1024);
        assert!(response.body.ends_with(TRUNCATION_SUFFIX));
    }

    #[tokio::test]
    async fn slow_subscriber_times_out() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::new(ClientConfig {
            timeout: Duration::from_millis(200),
            ..ClientConfig::default()
        })
        .unwrap();

        let error = client.deliver(create_test_request(mock_server.uri())).await.unwrap_err();
        assert!(matches!(error, DeliveryError::Timeout { .. }), "{error:?}");
    }

    #[tokio::test]
    async fn refused_connection_is_network_error() {
        // bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = DeliveryClient::with_defaults().unwrap();
        let error = client.deliver(create_test_request(format!("http://{addr}/x"))).await.unwrap_err();

        assert!(matches!(error, DeliveryError::NetworkError { .. }), "{error:?}");
    }

    #[test]
    fn excerpt_respects_limit() {
        assert_eq!(excerpt(b"short", 1024, false), "short");

        let long = "x".repeat(2000);
        let cut = excerpt(long.as_bytes(), 1024, false);
        assert_eq!(cut.len(), 1024);
        assert!(cut.ends_with(TRUNCATION_SUFFIX));
    }

    #[test]
    fn excerpt_never_splits_characters() {
        let body = "é".repeat(600);
        let cut = excerpt(body.as_bytes(), 1024, false);
        assert!(cut.len() <= 1024);
        assert!(!cut.contains(char::REPLACEMENT_CHARACTER));
    }
}
