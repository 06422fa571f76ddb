//! Dead-letter listing and replay.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use courier_core::{
    AuditAction, AuditFilter, DeadLetterEntry, DeadLetterFilter, DeliveryStatus, OwnerId,
    Pagination, Subscription,
};
use courier_delivery::{DeliveryStorage, RegistryError};
use courier_testing::{RecordingSubscriber, TestEnv};

async fn dead_lettered(
    env: &TestEnv,
    subscriber: &RecordingSubscriber,
) -> (Subscription, DeadLetterEntry) {
    let subscription = env.seed_subscription(subscriber.url(), &["clip.approved"]).await;
    env.dispatch("clip.approved").await.unwrap();
    env.run_to_completion().await.unwrap();

    let entries = env.storage.dead_letters().await;
    assert_eq!(entries.len(), 1);
    (subscription, entries[0].clone())
}

#[tokio::test]
async fn replay_starts_a_new_generation_and_delivers() {
    let env = TestEnv::new().expect("test env");
    let subscriber = RecordingSubscriber::with_statuses(&[500, 500, 500, 500, 500, 200]).await;
    let (subscription, entry) = dead_lettered(&env, &subscriber).await;

    let attempt = env.dead_letters().replay(entry.id, subscription.owner_id).await.unwrap();
    assert_eq!(attempt.generation, 1);
    assert_eq!(attempt.attempt_number, 1);
    assert_eq!(attempt.status, DeliveryStatus::Pending);
    assert_eq!(attempt.scheduled_at, env.now());

    assert_eq!(env.drain().await.unwrap(), 1);
    assert_eq!(subscriber.request_count(), 6);
    assert_eq!(subscriber.header(5, "X-Webhook-Replay").as_deref(), Some("true"));
    assert_eq!(subscriber.header(5, "X-Webhook-Attempt").as_deref(), Some("1"));

    let replayed = env.storage.find_attempt(attempt.id).await.unwrap().unwrap();
    assert_eq!(replayed.status, DeliveryStatus::Delivered);

    let stored = env.dead_letters().get(entry.id, subscription.owner_id).await.unwrap();
    assert_eq!(stored.replayed_by, Some(subscription.owner_id));
    assert_eq!(stored.replay_count, 1);
    assert!(stored.replayed_at.is_some());

    let replays = env
        .audit_log()
        .query(&AuditFilter { action: Some(AuditAction::Replay), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(replays.total, 1);
    assert_eq!(replays.items[0].actor, Some(subscription.owner_id));
    assert_eq!(replays.items[0].attempt_id, attempt.id);
}

#[tokio::test]
async fn replay_while_queued_conflicts() {
    let env = TestEnv::new().expect("test env");
    let subscriber = RecordingSubscriber::with_status(500).await;
    let (subscription, entry) = dead_lettered(&env, &subscriber).await;

    let store = env.dead_letters();
    store.replay(entry.id, subscription.owner_id).await.unwrap();

    let second = store.replay(entry.id, subscription.owner_id).await;
    assert!(matches!(second, Err(RegistryError::Conflict(_))));
}

#[tokio::test]
async fn exhausted_replay_dead_letters_again() {
    let env = TestEnv::new().expect("test env");
    let subscriber = RecordingSubscriber::with_status(500).await;
    let (subscription, entry) = dead_lettered(&env, &subscriber).await;

    env.dead_letters().replay(entry.id, subscription.owner_id).await.unwrap();
    assert_eq!(env.run_to_completion().await.unwrap(), 5);

    let entries = env.storage.dead_letters().await;
    assert_eq!(entries.len(), 2);
    assert_eq!(subscriber.request_count(), 10);

    let generation_one = env.attempts().await.into_iter().filter(|a| a.generation == 1).count();
    assert_eq!(generation_one, 5);

    let replayed_again =
        env.dead_letters().replay(entries[1].id, subscription.owner_id).await.unwrap();
    assert_eq!(replayed_again.generation, 2);
}

#[tokio::test]
async fn replay_by_another_owner_is_not_found() {
    let env = TestEnv::new().expect("test env");
    let subscriber = RecordingSubscriber::with_status(500).await;
    let (_, entry) = dead_lettered(&env, &subscriber).await;

    let result = env.dead_letters().replay(entry.id, OwnerId::new()).await;
    assert!(matches!(result, Err(RegistryError::NotFound(_))));
}

#[tokio::test]
async fn replay_of_inactive_subscription_is_rejected() {
    let env = TestEnv::new().expect("test env");
    let subscriber = RecordingSubscriber::with_status(500).await;
    let (subscription, entry) = dead_lettered(&env, &subscriber).await;

    env.registry().deactivate(subscription.id, subscription.owner_id).await.unwrap();

    let result = env.dead_letters().replay(entry.id, subscription.owner_id).await;
    assert!(matches!(result, Err(RegistryError::SubscriptionInactive(_))));
}

#[tokio::test]
async fn list_filters_by_owner_and_replay_state() {
    let env = TestEnv::new().expect("test env");
    let subscriber = RecordingSubscriber::with_status(500).await;
    let (subscription, entry) = dead_lettered(&env, &subscriber).await;
    let (other, _) = dead_lettered_again(&env, &subscriber).await;

    let store = env.dead_letters();
    let mine = store
        .list(&DeadLetterFilter { owner_id: Some(subscription.owner_id), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(mine.total, 1);
    assert_eq!(mine.items[0].id, entry.id);

    store.replay(entry.id, subscription.owner_id).await.unwrap();

    let untouched = store
        .list(&DeadLetterFilter { replayed: Some(false), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(untouched.total, 1);
    assert_eq!(untouched.items[0].owner_id, other.owner_id);

    let paged = store
        .list(&DeadLetterFilter { pagination: Pagination::new(2, 1), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(paged.total, 2);
    assert_eq!(paged.items.len(), 1);
}

async fn dead_lettered_again(
    env: &TestEnv,
    subscriber: &RecordingSubscriber,
) -> (Subscription, DeadLetterEntry) {
    let subscription = env.seed_subscription(subscriber.url(), &["clip.rejected"]).await;
    env.dispatch("clip.rejected").await.unwrap();
    env.run_to_completion().await.unwrap();

    let entry = env
        .storage
        .dead_letters()
        .await
        .into_iter()
        .find(|e| e.subscription_id == subscription.id)
        .unwrap();
    (subscription, entry)
}
