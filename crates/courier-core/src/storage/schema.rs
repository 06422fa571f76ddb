//! Idempotent schema bootstrap.
//!
//! Creates every table and index the repositories rely on. Safe to run on
//! each start-up.

use sqlx::PgPool;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS webhook_subscriptions (
        id UUID PRIMARY KEY,
        owner_id UUID NOT NULL,
        url TEXT NOT NULL,
        secret TEXT NOT NULL,
        events TEXT[] NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        description TEXT,
        last_delivery_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        deleted_at TIMESTAMPTZ,
        CHECK (cardinality(events) > 0)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_webhook_subscriptions_owner
    ON webhook_subscriptions (owner_id, created_at DESC)
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_webhook_subscriptions_events
    ON webhook_subscriptions USING GIN (events)
    WHERE is_active AND deleted_at IS NULL
    ",
    r"
    CREATE TABLE IF NOT EXISTS webhook_events (
        id UUID PRIMARY KEY,
        event_type TEXT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        payload JSONB NOT NULL,
        received_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS delivery_attempts (
        id UUID PRIMARY KEY,
        subscription_id UUID NOT NULL REFERENCES webhook_subscriptions (id),
        event_id UUID NOT NULL REFERENCES webhook_events (id),
        event_type TEXT NOT NULL,
        generation INTEGER NOT NULL DEFAULT 0 CHECK (generation >= 0),
        attempt_number INTEGER NOT NULL CHECK (attempt_number >= 1),
        status TEXT NOT NULL
            CHECK (status IN ('pending', 'in_flight', 'delivered', 'failed', 'dead_lettered')),
        http_status INTEGER,
        response_excerpt TEXT,
        error TEXT,
        scheduled_at TIMESTAMPTZ NOT NULL,
        executed_at TIMESTAMPTZ,
        next_retry_at TIMESTAMPTZ,
        lease_token UUID,
        lease_expires_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (subscription_id, event_id, generation, attempt_number)
    )
    ",
    r"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_delivery_attempts_single_in_flight
    ON delivery_attempts (subscription_id, event_id)
    WHERE status = 'in_flight'
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_delivery_attempts_due
    ON delivery_attempts (status, scheduled_at)
    WHERE status IN ('pending', 'in_flight')
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_delivery_attempts_subscription
    ON delivery_attempts (subscription_id, created_at DESC)
    ",
    r"
    CREATE TABLE IF NOT EXISTS dead_letters (
        id UUID PRIMARY KEY,
        attempt_id UUID NOT NULL UNIQUE REFERENCES delivery_attempts (id),
        subscription_id UUID NOT NULL REFERENCES webhook_subscriptions (id),
        owner_id UUID NOT NULL,
        event_id UUID NOT NULL REFERENCES webhook_events (id),
        event_type TEXT NOT NULL,
        failure_reason TEXT,
        last_http_status INTEGER,
        replayed_by UUID,
        replayed_at TIMESTAMPTZ,
        replay_count INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_dead_letters_owner
    ON dead_letters (owner_id, created_at DESC)
    ",
    r"
    CREATE TABLE IF NOT EXISTS delivery_audit_log (
        id UUID PRIMARY KEY,
        action TEXT NOT NULL CHECK (action IN ('delivery', 'replay', 'cancellation')),
        attempt_id UUID NOT NULL,
        subscription_id UUID NOT NULL,
        event_id UUID NOT NULL,
        event_type TEXT NOT NULL,
        attempt_number INTEGER NOT NULL,
        status TEXT NOT NULL,
        http_status INTEGER,
        response_excerpt TEXT,
        error TEXT,
        duration_ms BIGINT,
        actor UUID,
        recorded_at TIMESTAMPTZ NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_audit_subscription
    ON delivery_audit_log (subscription_id, recorded_at DESC)
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_audit_event_type
    ON delivery_audit_log (event_type, recorded_at DESC)
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_audit_status
    ON delivery_audit_log (status, recorded_at DESC)
    ",
    r"
    CREATE OR REPLACE FUNCTION delivery_audit_log_immutable() RETURNS trigger AS $$
    BEGIN
        RAISE EXCEPTION 'delivery_audit_log is append-only';
    END;
    $$ LANGUAGE plpgsql
    ",
    r"
    DROP TRIGGER IF EXISTS delivery_audit_log_no_update ON delivery_audit_log
    ",
    r"
    CREATE TRIGGER delivery_audit_log_no_update
    BEFORE UPDATE OR DELETE ON delivery_audit_log
    FOR EACH ROW EXECUTE FUNCTION delivery_audit_log_immutable()
    ",
];

/// Creates all tables, indexes and triggers if they do not exist.
///
/// # Errors
///
/// Returns error if any statement fails.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;
    for statement in STATEMENTS {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_table_is_created() {
        let sql = STATEMENTS.join("\n");
        for table in [
            "webhook_subscriptions",
            "webhook_events",
            "delivery_attempts",
            "dead_letters",
            "delivery_audit_log",
        ] {
            assert!(
                sql.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "missing table {table}"
            );
        }
    }

    #[test]
    fn single_in_flight_is_enforced_by_index() {
        let sql = STATEMENTS.join("\n");
        assert!(sql.contains("idx_delivery_attempts_single_in_flight"));
        assert!(sql.contains("WHERE status = 'in_flight'"));
    }
}
