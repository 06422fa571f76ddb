//! Model invariants: pagination bounds, filter semantics, time control.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{TimeZone, Utc};
use courier_core::{
    models::MAX_PAGE_LIMIT, AuditAction, AuditEntry, AuditFilter, Clock, DeadLetterEntry,
    DeadLetterFilter, DeadLetterId, DeliveryAttempt, DeliveryStatus, EventId, OwnerId, Pagination,
    SubscriptionId, TestClock,
};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};

fn proptest_config() -> ProptestConfig {
    ProptestConfig { cases: 200, failure_persistence: None, ..ProptestConfig::default() }
}

fn dead_letter(owner_id: OwnerId, event_type: &str) -> DeadLetterEntry {
    DeadLetterEntry {
        id: DeadLetterId::new(),
        attempt_id: courier_core::AttemptId::new(),
        subscription_id: SubscriptionId::new(),
        owner_id,
        event_id: EventId::new(),
        event_type: event_type.to_string(),
        failure_reason: Some("server error: HTTP 500".to_string()),
        last_http_status: Some(500),
        replayed_by: None,
        replayed_at: None,
        replay_count: 0,
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
    }
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn pagination_is_always_in_bounds(page in any::<u32>(), limit in any::<u32>()) {
        let pagination = Pagination::new(page, limit);

        prop_assert!(pagination.page >= 1);
        prop_assert!((1..=MAX_PAGE_LIMIT).contains(&pagination.limit));
        prop_assert_eq!(
            pagination.offset(),
            u64::from(pagination.page - 1) * u64::from(pagination.limit)
        );
    }

    #[test]
    fn consecutive_pages_do_not_overlap(page in 1u32..10_000, limit in 1u32..=100) {
        let current = Pagination::new(page, limit);
        let next = Pagination::new(page + 1, limit);

        prop_assert_eq!(next.offset() - current.offset(), u64::from(current.limit));
    }

    #[test]
    fn test_clock_advances_by_exact_amounts(steps in prop::collection::vec(0u64..10_000, 0..20)) {
        let start = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let clock = TestClock::with_start_time(start);

        let total: u64 = steps.iter().sum();
        for step in steps {
            clock.advance(Duration::from_millis(step));
        }

        prop_assert_eq!(clock.elapsed(), Duration::from_millis(total));
        prop_assert_eq!(clock.now_system(), start + Duration::from_millis(total));
    }
}

#[test]
fn empty_filters_match_everything() {
    let entry = dead_letter(OwnerId::new(), "clip.approved");
    assert!(DeadLetterFilter::default().matches(&entry));

    let attempt = DeliveryAttempt::pending(
        entry.subscription_id,
        entry.event_id,
        "clip.approved",
        0,
        1,
        Utc::now(),
    );
    let audit = AuditEntry::for_attempt(AuditAction::Delivery, &attempt, Utc::now());
    assert!(AuditFilter::default().matches(&audit));
}

#[test]
fn dead_letter_filter_checks_each_field() {
    let owner = OwnerId::new();
    let mut entry = dead_letter(owner, "clip.rejected");

    let by_owner = DeadLetterFilter { owner_id: Some(owner), ..Default::default() };
    assert!(by_owner.matches(&entry));
    assert!(!DeadLetterFilter { owner_id: Some(OwnerId::new()), ..Default::default() }
        .matches(&entry));

    let by_type =
        DeadLetterFilter { event_type: Some("clip.approved".to_string()), ..Default::default() };
    assert!(!by_type.matches(&entry));

    let window = DeadLetterFilter {
        from: Some(entry.created_at),
        to: Some(entry.created_at + chrono::Duration::seconds(1)),
        ..Default::default()
    };
    assert!(window.matches(&entry));
    let ended = DeadLetterFilter { to: Some(entry.created_at), ..Default::default() };
    assert!(!ended.matches(&entry));

    let untouched = DeadLetterFilter { replayed: Some(false), ..Default::default() };
    assert!(untouched.matches(&entry));
    entry.replayed_at = Some(entry.created_at);
    assert!(!untouched.matches(&entry));
}

#[test]
fn audit_entry_snapshots_attempt() {
    let mut attempt = DeliveryAttempt::pending(
        SubscriptionId::new(),
        EventId::new(),
        "clip.submitted",
        2,
        3,
        Utc::now(),
    );
    attempt.status = DeliveryStatus::Failed;
    attempt.http_status = Some(502);
    attempt.error = Some("server error: HTTP 502".to_string());

    let entry = AuditEntry::for_attempt(AuditAction::Delivery, &attempt, Utc::now());

    assert_eq!(entry.attempt_id, attempt.id);
    assert_eq!(entry.attempt_number, 3);
    assert_eq!(entry.status, DeliveryStatus::Failed);
    assert_eq!(entry.http_status, Some(502));
    assert!(entry.actor.is_none());
    assert!(attempt.is_replay());
}

#[test]
fn jump_to_past_keeps_monotonic_time() {
    let clock = TestClock::new();
    clock.advance(Duration::from_secs(10));
    let instant = clock.now();

    clock.jump_to(SystemTime::UNIX_EPOCH);

    assert_eq!(clock.now(), instant);
    assert_eq!(clock.now_system(), UNIX_EPOCH);
}
