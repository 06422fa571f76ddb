//! Delivery workers.
//!
//! A worker claims due attempts, signs and POSTs each one, and hands the
//! result back to storage in a single completion that also appends the audit
//! entry and, depending on the outcome, schedules the successor or writes
//! the dead letter.
//!
//! Attempts of a batch run one after another, so the lease of each is
//! renewed right before it executes. An attempt whose lease was already
//! revoked is skipped.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use courier_core::{
    models::{
        AttemptCompletion, AttemptOutcome, AuditAction, AuditEntry, CompletionResult,
        DeliveryAttempt, Disposition, Subscription, SUBSCRIPTION_DEACTIVATED,
    },
    Clock,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{DeliveryClient, DeliveryRequest},
    engine::{DeliveryConfig, EngineStats},
    error::{DeliveryError, Result},
    in_flight::InFlightDeliveries,
    retry::RetryScheduler,
    signing,
    storage::DeliveryStorage,
};

/// Back-off after a failed claim before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Shared dependencies handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    /// Queue and record storage.
    pub storage: Arc<dyn DeliveryStorage>,
    /// Engine configuration.
    pub config: DeliveryConfig,
    /// Pooled HTTP client.
    pub client: Arc<DeliveryClient>,
    /// Failure handling.
    pub scheduler: RetryScheduler,
    /// Counters shared with the engine.
    pub stats: Arc<RwLock<EngineStats>>,
    /// Cancelled when shutdown begins. Workers stop claiming and stop
    /// starting attempts, but finish the one on the wire.
    pub cancellation_token: CancellationToken,
    /// Cancelled when the shutdown grace period runs out. Requests on the
    /// wire are abandoned and their leases recover the attempts.
    pub abort_token: CancellationToken,
    /// Per-subscription signals that abandon requests of deactivated
    /// subscriptions.
    pub in_flight: InFlightDeliveries,
    /// Time source for every written timestamp.
    pub clock: Arc<dyn Clock>,
}

/// Individual worker that processes webhook deliveries.
pub struct DeliveryWorker {
    id: usize,
    ctx: WorkerContext,
}

enum Executed {
    Delivered,
    Retried,
    DeadLettered,
    Cancelled,
    LeaseLost,
}

impl DeliveryWorker {
    /// Creates a new delivery worker.
    pub fn new(id: usize, ctx: WorkerContext) -> Self {
        Self { id, ctx }
    }

    /// Main worker loop - claims and processes attempts until cancelled.
    ///
    /// # Errors
    ///
    /// Returns error only if worker setup fails. Batch processing errors are
    /// logged and retried.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            if self.ctx.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.ctx.clock.sleep(self.ctx.config.poll_interval) => {}
                        () = self.ctx.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(error) => {
                    error!(
                        worker_id = self.id,
                        error = %error,
                        "worker batch processing failed"
                    );
                    tokio::select! {
                        () = self.ctx.clock.sleep(ERROR_BACKOFF) => {}
                        () = self.ctx.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Claims and processes one batch. Returns the number claimed.
    ///
    /// # Errors
    ///
    /// Returns error if claiming fails. Failures of individual attempts are
    /// logged and leave the attempt to the lease reaper.
    pub async fn process_batch(&self) -> Result<usize> {
        let attempts = self.claim().await?;
        let batch_size = attempts.len();

        if batch_size > 0 {
            debug!(worker_id = self.id, batch_size, "processing attempt batch");
        }

        for mut attempt in attempts {
            if self.ctx.cancellation_token.is_cancelled() {
                break;
            }

            let attempt_id = attempt.id;
            match self.renew_lease(&mut attempt).await {
                Ok(true) => {},
                Ok(false) => {
                    warn!(
                        worker_id = self.id,
                        attempt_id = %attempt_id,
                        "lease revoked before execution, skipping attempt"
                    );
                    self.ctx.stats.write().await.leases_lost += 1;
                    continue;
                },
                Err(error) => {
                    error!(
                        worker_id = self.id,
                        attempt_id = %attempt_id,
                        error = %error,
                        "lease renewal failed, leaving attempt to lease expiry"
                    );
                    continue;
                },
            }

            if let Err(error) = self.process_attempt(attempt).await {
                error!(
                    worker_id = self.id,
                    attempt_id = %attempt_id,
                    error = %error,
                    "attempt processing failed, leaving it to lease expiry"
                );
            }
        }

        Ok(batch_size)
    }

    fn lease(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(self.ctx.config.lease_duration)
            .map_err(|e| DeliveryError::configuration(format!("lease duration: {e}")))
    }

    async fn renew_lease(&self, attempt: &mut DeliveryAttempt) -> Result<bool> {
        let lease_token = attempt.lease_token.ok_or_else(|| {
            DeliveryError::internal(format!("attempt {} was claimed without a lease", attempt.id))
        })?;
        let expires_at = self.ctx.clock.now_utc() + self.lease()?;

        let renewed = self.ctx.storage.renew_lease(attempt.id, lease_token, expires_at).await?;
        if renewed {
            attempt.lease_expires_at = Some(expires_at);
        }
        Ok(renewed)
    }

    async fn claim(&self) -> Result<Vec<DeliveryAttempt>> {
        let now = self.ctx.clock.now_utc();
        let lease = self.lease()?;

        let attempts = self
            .ctx
            .storage
            .claim_due_attempts(self.ctx.config.batch_size, now, now + lease)
            .await
            .map_err(|e| DeliveryError::database(format!("failed to claim attempts: {e}")))?;

        if !attempts.is_empty() {
            debug!(
                worker_id = self.id,
                claimed_count = attempts.len(),
                "claimed delivery attempts"
            );
        }

        Ok(attempts)
    }

    async fn process_attempt(&self, attempt: DeliveryAttempt) -> Result<()> {
        self.ctx.stats.write().await.in_flight += 1;

        let result = self.execute(&attempt).await;

        {
            let mut stats = self.ctx.stats.write().await;
            stats.in_flight = stats.in_flight.saturating_sub(1);
            if let Ok(executed) = &result {
                stats.attempts_processed += 1;
                match executed {
                    Executed::Delivered => stats.delivered += 1,
                    Executed::Retried => stats.retried += 1,
                    Executed::DeadLettered => stats.dead_lettered += 1,
                    Executed::Cancelled => stats.cancelled += 1,
                    Executed::LeaseLost => stats.leases_lost += 1,
                }
            }
        }

        result.map(|_| ())
    }

    async fn execute(&self, attempt: &DeliveryAttempt) -> Result<Executed> {
        // registered before the active check so a concurrent deactivation
        // either is seen here or cancels the guard
        let guard = self.ctx.in_flight.track(attempt.subscription_id);

        let subscription = self
            .ctx
            .storage
            .find_subscription(attempt.subscription_id)
            .await?
            .filter(|s| s.is_active);

        let Some(subscription) = subscription else {
            debug!(
                worker_id = self.id,
                attempt_id = %attempt.id,
                subscription_id = %attempt.subscription_id,
                "subscription deactivated before execution"
            );
            return self.cancel(attempt).await;
        };

        let event = self.ctx.storage.find_event(attempt.event_id).await?.ok_or_else(|| {
            DeliveryError::internal(format!("event {} is missing", attempt.event_id))
        })?;

        let body = event
            .webhook_body()
            .map_err(|e| DeliveryError::internal(format!("failed to serialize event: {e}")))?;
        let signature = signing::sign(&subscription.secret, &body)?;

        let request = DeliveryRequest {
            delivery_id: attempt.id,
            event_id: attempt.event_id,
            event_type: attempt.event_type.clone(),
            url: subscription.url.clone(),
            body: Bytes::from(body),
            signature,
            attempt_number: attempt.attempt_number,
            replay: attempt.is_replay(),
        };

        debug!(
            worker_id = self.id,
            attempt_id = %attempt.id,
            event_id = %attempt.event_id,
            attempt_number = attempt.attempt_number,
            "attempting webhook delivery"
        );

        let started = std::time::Instant::now();
        let result = tokio::select! {
            result = self.ctx.client.deliver(request) => result,
            () = guard.cancelled() => {
                info!(
                    worker_id = self.id,
                    attempt_id = %attempt.id,
                    subscription_id = %attempt.subscription_id,
                    "subscription deactivated mid-flight, abandoning request"
                );
                return self.cancel(attempt).await;
            },
            () = self.ctx.abort_token.cancelled() => {
                return Err(DeliveryError::ShutdownRequested);
            },
        };
        drop(guard);

        let (outcome, disposition) = match result {
            Ok(response) if response.is_success => {
                let outcome = AttemptOutcome {
                    http_status: Some(i32::from(response.status_code)),
                    response_excerpt: Some(response.body),
                    error: None,
                    duration_ms: duration_ms(response.duration),
                };
                (outcome, Disposition::Delivered)
            },
            Ok(response) => {
                let error = DeliveryError::from_status(response.status_code, response.body);
                self.failure(attempt, &subscription, error, response.duration)
            },
            Err(error) => self.failure(attempt, &subscription, error, started.elapsed()),
        };

        self.complete(attempt, outcome, disposition, AuditAction::Delivery).await
    }

    async fn cancel(&self, attempt: &DeliveryAttempt) -> Result<Executed> {
        let outcome = AttemptOutcome {
            error: Some(SUBSCRIPTION_DEACTIVATED.to_string()),
            ..AttemptOutcome::default()
        };
        self.complete(attempt, outcome, Disposition::Cancelled, AuditAction::Cancellation).await
    }

    fn failure(
        &self,
        attempt: &DeliveryAttempt,
        subscription: &Subscription,
        error: DeliveryError,
        duration: Duration,
    ) -> (AttemptOutcome, Disposition) {
        warn!(
            worker_id = self.id,
            attempt_id = %attempt.id,
            attempt_number = attempt.attempt_number,
            error_class = %error.class(),
            error = %error,
            "delivery attempt failed"
        );

        let outcome = AttemptOutcome {
            http_status: error.status_code().map(i32::from),
            response_excerpt: error.response_body().map(str::to_string),
            error: Some(error.to_string()),
            duration_ms: duration_ms(duration),
        };
        let disposition = self.ctx.scheduler.on_failure(
            attempt,
            subscription.owner_id,
            &error,
            self.ctx.clock.now_utc(),
        );

        (outcome, disposition)
    }

    async fn complete(
        &self,
        attempt: &DeliveryAttempt,
        outcome: AttemptOutcome,
        disposition: Disposition,
        action: AuditAction,
    ) -> Result<Executed> {
        let lease_token = attempt.lease_token.ok_or_else(|| {
            DeliveryError::internal(format!("attempt {} was claimed without a lease", attempt.id))
        })?;
        let executed_at = self.ctx.clock.now_utc();

        let mut finished = attempt.clone();
        finished.status = disposition.status();
        finished.http_status = outcome.http_status;
        finished.response_excerpt.clone_from(&outcome.response_excerpt);
        finished.error.clone_from(&outcome.error);
        finished.executed_at = Some(executed_at);

        let mut audit = AuditEntry::for_attempt(action, &finished, executed_at);
        audit.duration_ms = outcome.duration_ms;

        let executed = match &disposition {
            Disposition::Delivered => Executed::Delivered,
            Disposition::Retry(_) => Executed::Retried,
            Disposition::DeadLetter(_) => Executed::DeadLettered,
            Disposition::Cancelled => Executed::Cancelled,
        };

        let completion = AttemptCompletion {
            attempt_id: attempt.id,
            lease_token,
            outcome,
            disposition,
            executed_at,
            audit,
        };

        let executed = match self.ctx.storage.complete_attempt(&completion).await? {
            CompletionResult::Applied => executed,
            CompletionResult::RetryDropped => {
                info!(
                    worker_id = self.id,
                    attempt_id = %attempt.id,
                    subscription_id = %attempt.subscription_id,
                    "subscription deactivated, retry not scheduled"
                );
                return Ok(Executed::Cancelled);
            },
            CompletionResult::LeaseLost => {
                warn!(
                    worker_id = self.id,
                    attempt_id = %attempt.id,
                    "lease lost before completion, dropping result"
                );
                // the request went out, so the execution is still audited
                if action == AuditAction::Delivery {
                    self.ctx.storage.record_audit(&completion.audit).await?;
                }
                return Ok(Executed::LeaseLost);
            },
        };

        match &completion.disposition {
            Disposition::Delivered => info!(
                worker_id = self.id,
                attempt_id = %attempt.id,
                subscription_id = %attempt.subscription_id,
                status_code = ?completion.outcome.http_status,
                "webhook delivered successfully"
            ),
            Disposition::Retry(next) => debug!(
                worker_id = self.id,
                attempt_id = %attempt.id,
                next_attempt_id = %next.id,
                next_attempt_at = %next.scheduled_at,
                "retry scheduled"
            ),
            Disposition::DeadLetter(entry) => warn!(
                worker_id = self.id,
                attempt_id = %attempt.id,
                dead_letter_id = %entry.id,
                "retries exhausted, delivery dead-lettered"
            ),
            Disposition::Cancelled => {},
        }

        Ok(executed)
    }
}

fn duration_ms(duration: Duration) -> Option<i64> {
    i64::try_from(duration.as_millis()).ok()
}
