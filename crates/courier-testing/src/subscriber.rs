//! Recording webhook subscriber backed by wiremock.
//!
//! Answers each request with the next status of a scripted sequence and
//! keeps every request so tests can check headers and signatures. A request
//! is counted on arrival, before any configured response delay.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use courier_core::Secret;
use courier_delivery::verify_signature;
use wiremock::{matchers, Mock, MockServer, Request, Respond, ResponseTemplate};

/// Path the subscriber listens on.
pub const HOOK_PATH: &str = "/hooks";

#[derive(Clone)]
struct SequenceResponder {
    statuses: Arc<Vec<u16>>,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl Respond for SequenceResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let status = self
            .statuses
            .get(n)
            .or_else(|| self.statuses.last())
            .copied()
            .unwrap_or(200);
        let response =
            ResponseTemplate::new(status).set_body_string(format!("response {}", n + 1));
        match self.delay {
            Some(delay) => response.set_delay(delay),
            None => response,
        }
    }
}

/// A subscriber endpoint that records what it receives.
pub struct RecordingSubscriber {
    server: MockServer,
    responder: SequenceResponder,
}

impl RecordingSubscriber {
    /// Starts a subscriber answering every request with `status`.
    pub async fn with_status(status: u16) -> Self {
        Self::with_statuses(&[status]).await
    }

    /// Starts a subscriber answering request `n` with `statuses[n]`, then
    /// repeating the last status.
    pub async fn with_statuses(statuses: &[u16]) -> Self {
        Self::start(statuses, None).await
    }

    /// Starts a subscriber answering every request with `status` after
    /// `delay`.
    pub async fn with_delay(status: u16, delay: Duration) -> Self {
        Self::start(&[status], Some(delay)).await
    }

    async fn start(statuses: &[u16], delay: Option<Duration>) -> Self {
        let server = MockServer::start().await;
        let responder = SequenceResponder {
            statuses: Arc::new(statuses.to_vec()),
            delay,
            calls: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        };

        Mock::given(matchers::method("POST"))
            .and(matchers::path(HOOK_PATH))
            .respond_with(responder.clone())
            .mount(&server)
            .await;

        Self { server, responder }
    }

    /// URL to register as the subscription endpoint.
    pub fn url(&self) -> String {
        format!("{}{HOOK_PATH}", self.server.uri())
    }

    /// Number of requests received.
    pub fn request_count(&self) -> usize {
        self.responder.calls.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` requests arrived. Returns false if
    /// `timeout` passed first.
    pub async fn wait_for_requests(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.request_count() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Every request received, in arrival order.
    pub fn requests(&self) -> Vec<Request> {
        self.responder.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Returns a header of request `index`.
    pub fn header(&self, index: usize, name: &str) -> Option<String> {
        self.requests()
            .get(index)?
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// Returns true if every request carries a valid `X-Webhook-Signature`
    /// for `secret` over its raw body.
    pub fn all_signatures_valid(&self, secret: &Secret) -> bool {
        self.requests().iter().all(|request| {
            request
                .headers
                .get("X-Webhook-Signature")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|signature| verify_signature(&request.body, signature, secret))
        })
    }

    /// Parses request `index` as JSON.
    pub fn json_body(&self, index: usize) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.requests().get(index)?.body).ok()
    }
}
