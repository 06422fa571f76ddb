//! Lease expiry and recovery of stalled attempts.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use courier_core::{
    AttemptCompletion, AttemptOutcome, AuditAction, AuditEntry, CompletionResult, DeliveryStatus,
    Disposition,
};
use courier_delivery::DeliveryStorage;
use courier_testing::{RecordingSubscriber, TestEnv};

#[tokio::test]
async fn expired_lease_returns_attempt_without_consuming_a_retry() {
    let env = TestEnv::new().expect("test env");
    let subscriber = RecordingSubscriber::with_status(200).await;
    env.seed_subscription(subscriber.url(), &["clip.approved"]).await;
    env.dispatch("clip.approved").await.unwrap();

    // a worker claims and then stalls
    let now = env.now();
    let stalled = env
        .storage
        .claim_due_attempts(10, now, now + ChronoDuration::seconds(60))
        .await
        .unwrap();
    assert_eq!(stalled.len(), 1);
    assert_eq!(env.process_batch().await.unwrap(), 0);

    env.advance(Duration::from_secs(30));
    assert_eq!(env.engine().reap_expired_leases().await.unwrap(), 0);

    env.advance(Duration::from_secs(31));
    assert_eq!(env.engine().reap_expired_leases().await.unwrap(), 1);

    let released = &env.attempts().await[0];
    assert_eq!(released.status, DeliveryStatus::Pending);
    assert_eq!(released.attempt_number, 1);
    assert!(released.lease_token.is_none());

    assert_eq!(env.process_batch().await.unwrap(), 1);
    assert_eq!(subscriber.request_count(), 1);
    assert_eq!(env.attempts().await[0].status, DeliveryStatus::Delivered);
    assert_eq!(env.stats().await.leases_released, 1);
}

#[tokio::test]
async fn stale_worker_cannot_complete_after_reclaim() {
    let env = TestEnv::new().expect("test env");
    let subscriber = RecordingSubscriber::with_status(200).await;
    env.seed_subscription(subscriber.url(), &["clip.approved"]).await;
    env.dispatch("clip.approved").await.unwrap();

    let now = env.now();
    let stalled = env
        .storage
        .claim_due_attempts(1, now, now + ChronoDuration::seconds(60))
        .await
        .unwrap()
        .remove(0);
    env.storage.expire_lease(stalled.id, now).await;

    env.advance(Duration::from_secs(1));
    env.engine().reap_expired_leases().await.unwrap();
    env.drain().await.unwrap();

    let mut late = stalled.clone();
    late.status = DeliveryStatus::Failed;
    let completion = AttemptCompletion {
        attempt_id: stalled.id,
        lease_token: stalled.lease_token.unwrap(),
        outcome: AttemptOutcome { error: Some("late".to_string()), ..Default::default() },
        disposition: Disposition::Cancelled,
        executed_at: env.now(),
        audit: AuditEntry::for_attempt(AuditAction::Delivery, &late, env.now()),
    };
    assert_eq!(
        env.storage.complete_attempt(&completion).await.unwrap(),
        CompletionResult::LeaseLost
    );

    let attempt = env.storage.find_attempt(stalled.id).await.unwrap().unwrap();
    assert_eq!(attempt.status, DeliveryStatus::Delivered);
    assert_eq!(env.storage.audit_entries().await.len(), 1);
}

#[tokio::test]
async fn batch_skips_attempt_whose_lease_was_revoked_mid_batch() {
    let env = TestEnv::new().expect("test env");
    let slow = RecordingSubscriber::with_delay(200, Duration::from_millis(500)).await;
    let fast = RecordingSubscriber::with_status(200).await;
    env.seed_subscription(slow.url(), &["clip.approved"]).await;
    env.seed_subscription(fast.url(), &["clip.submitted"]).await;

    env.dispatch("clip.approved").await.unwrap();
    env.advance(Duration::from_secs(1));
    env.dispatch("clip.submitted").await.unwrap();
    let queued = env.attempts().await[1].id;

    // while the first worker is on the slow request, the second attempt of
    // its batch is released and delivered by another worker
    let (claimed, ()) = tokio::join!(env.process_batch(), async {
        assert!(slow.wait_for_requests(1, Duration::from_secs(5)).await);
        env.storage.expire_lease(queued, env.now() - ChronoDuration::seconds(1)).await;
        assert_eq!(env.engine().reap_expired_leases().await.unwrap(), 1);
        assert_eq!(env.process_batch().await.unwrap(), 1);
    });

    assert_eq!(claimed.unwrap(), 2);
    assert_eq!(slow.request_count(), 1);
    assert_eq!(fast.request_count(), 1);
    assert!(env.attempts().await.iter().all(|a| a.status == DeliveryStatus::Delivered));
    assert_eq!(env.storage.audit_entries().await.len(), 2);
    assert_eq!(env.stats().await.leases_lost, 1);
}

#[tokio::test]
async fn each_attempt_gets_a_fresh_lease_before_execution() {
    let env = TestEnv::new().expect("test env");
    let subscriber = RecordingSubscriber::with_status(200).await;
    env.seed_subscription(subscriber.url(), &["clip.approved"]).await;
    env.dispatch("clip.approved").await.unwrap();

    let now = env.now();
    let claimed = env
        .storage
        .claim_due_attempts(1, now, now + ChronoDuration::seconds(60))
        .await
        .unwrap()
        .remove(0);

    env.advance(Duration::from_secs(45));
    let renewed_until = env.now() + ChronoDuration::seconds(60);
    assert!(env
        .storage
        .renew_lease(claimed.id, claimed.lease_token.unwrap(), renewed_until)
        .await
        .unwrap());

    // past the original expiry, inside the renewed one
    env.advance(Duration::from_secs(30));
    assert_eq!(env.engine().reap_expired_leases().await.unwrap(), 0);

    let attempt = env.storage.find_attempt(claimed.id).await.unwrap().unwrap();
    assert_eq!(attempt.status, DeliveryStatus::InFlight);
    assert_eq!(attempt.lease_expires_at, Some(renewed_until));
}

#[tokio::test]
async fn claim_failure_surfaces_from_process_batch() {
    let env = TestEnv::new().expect("test env");
    env.storage.inject_claim_error("connection reset").await;

    assert!(env.process_batch().await.is_err());
    assert_eq!(env.process_batch().await.unwrap(), 0);
}

#[tokio::test]
async fn one_attempt_per_pair_in_flight() {
    let env = TestEnv::new().expect("test env");
    let subscriber = RecordingSubscriber::with_status(500).await;
    let subscription = env.seed_subscription(subscriber.url(), &["clip.approved"]).await;
    let (event, _) = env.dispatch("clip.approved").await.unwrap();

    let now = env.now();
    let claimed = env
        .storage
        .claim_due_attempts(10, now, now + ChronoDuration::seconds(60))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    // a concurrent replay-style attempt for the same pair stays unclaimed
    let sibling =
        courier_core::DeliveryAttempt::pending(subscription.id, event.id, "clip.approved", 1, 1, now);
    assert!(env.storage.enqueue_attempt(&sibling).await.unwrap());

    let second = env
        .storage
        .claim_due_attempts(10, now, now + ChronoDuration::seconds(60))
        .await
        .unwrap();
    assert!(second.is_empty());
}
