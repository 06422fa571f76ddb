//! Property tests over whole attempt chains.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use courier_core::DeliveryStatus;
use courier_testing::{RecordingSubscriber, TestEnv};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().expect("runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn chain_ends_delivered_or_dead_lettered(
        failures in proptest::collection::vec(prop_oneof![Just(400u16), Just(404), Just(500), Just(503)], 0..8),
    ) {
        runtime().block_on(async {
            let env = TestEnv::new().expect("test env");
            let mut statuses = failures.clone();
            statuses.push(200);
            let subscriber = RecordingSubscriber::with_statuses(&statuses).await;
            env.seed_subscription(subscriber.url(), &["clip.approved"]).await;

            env.dispatch("clip.approved").await.unwrap();
            env.run_to_completion().await.unwrap();

            let attempts = env.attempts().await;
            let expected = (failures.len() + 1).min(5);
            assert_eq!(attempts.len(), expected);
            assert_eq!(subscriber.request_count(), expected);

            // numbering is contiguous and nothing is left open
            for (i, attempt) in attempts.iter().enumerate() {
                assert_eq!(attempt.attempt_number as usize, i + 1);
                assert!(attempt.status.is_terminal());
            }

            let last = attempts.last().unwrap();
            let dead_letters = env.storage.dead_letters().await;
            if failures.len() >= 5 {
                assert_eq!(last.status, DeliveryStatus::DeadLettered);
                assert_eq!(dead_letters.len(), 1);
            } else {
                assert_eq!(last.status, DeliveryStatus::Delivered);
                assert!(dead_letters.is_empty());
            }

            // exactly one audit entry per execution
            assert_eq!(env.storage.audit_entries().await.len(), expected);
        });
    }
}
