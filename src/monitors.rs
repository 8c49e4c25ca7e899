//! Monitor storage: eligibility scans, leases and the state sink.
//!
//! All scheduling state lives on the `monitored_links` row itself. A
//! monitor is eligible for dispatch iff it is active, due, and not covered
//! by a lease (`scheduler_locked_until` in the future). The lease is what
//! keeps at most one probe in flight per monitor across replicas.

use crate::probe::ProbeResult;
use crate::schema::{Environment, Monitor};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

const MONITOR_COLUMNS: &str = "id, convex_url_id, convex_user_id, long_url, short_url, \
     environment, interval_ms, next_check_at, scheduler_locked_until, is_active, \
     current_status, last_checked_at, last_status_code, last_latency_ms, \
     consecutive_failures, created_at, updated_at";

/// Fields accepted when registering a monitor.
#[derive(Debug, Clone)]
pub struct NewMonitor {
    /// Opaque external URL identity; the idempotency key for registration.
    pub convex_url_id: String,
    /// Opaque external owner identity.
    pub convex_user_id: String,
    /// The URL to probe.
    pub long_url: String,
    /// The short form, reported to the history sink.
    pub short_url: String,
    /// Polling interval in milliseconds.
    pub interval_ms: i64,
    /// History-sink deployment for this monitor.
    pub environment: Environment,
}

/// Insert a monitor, idempotent on `convex_url_id`.
///
/// Returns the new row id, or `None` when the URL is already registered.
/// The row is eligible immediately (`next_check_at` defaults to now).
pub async fn register(pool: &PgPool, new: &NewMonitor) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        r"
        INSERT INTO monitored_links
            (id, convex_url_id, convex_user_id, long_url, short_url, interval_ms, environment)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (convex_url_id) DO NOTHING
        RETURNING id
        ",
    )
    .bind(Uuid::new_v4())
    .bind(&new.convex_url_id)
    .bind(&new.convex_user_id)
    .bind(&new.long_url)
    .bind(&new.short_url)
    .bind(new.interval_ms)
    .bind(new.environment)
    .fetch_optional(pool)
    .await
}

/// Fetch a monitor by id.
pub async fn find(pool: &PgPool, id: Uuid) -> Result<Option<Monitor>, sqlx::Error> {
    sqlx::query_as::<_, Monitor>(&format!(
        "SELECT {MONITOR_COLUMNS} FROM monitored_links WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Soft-delete a monitor. Returns false when the id is unknown.
pub async fn deactivate(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE monitored_links SET is_active = FALSE, updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Select up to `batch_size` eligible monitors, oldest-overdue first.
///
/// Eligible: active, due, and not covered by a live lease. Ties on
/// `next_check_at` break on the id for a deterministic order.
pub async fn due_monitors(pool: &PgPool, batch_size: i64) -> Result<Vec<Monitor>, sqlx::Error> {
    sqlx::query_as::<_, Monitor>(&format!(
        r"
        SELECT {MONITOR_COLUMNS}
        FROM monitored_links
        WHERE is_active
          AND next_check_at <= NOW()
          AND (scheduler_locked_until IS NULL OR scheduler_locked_until <= NOW())
        ORDER BY next_check_at ASC, id ASC
        LIMIT $1
        ",
    ))
    .bind(batch_size)
    .fetch_all(pool)
    .await
}

/// Take the scheduling lease on a monitor and advance its `next_check_at`.
///
/// Runs inside the same transaction as the job enqueue. The update
/// re-checks full eligibility, so it doubles as the atomic claim: a
/// monitor deactivated since selection, or already claimed by a
/// concurrent replica's tick, matches nothing and the caller skips the
/// enqueue.
pub async fn lease(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    lock_duration_ms: i64,
) -> Result<bool, sqlx::Error> {
    let leased = sqlx::query_scalar::<_, Uuid>(
        r"
        UPDATE monitored_links
        SET next_check_at = NOW() + interval_ms * INTERVAL '1 millisecond',
            scheduler_locked_until = NOW() + $2 * INTERVAL '1 millisecond',
            updated_at = NOW()
        WHERE id = $1
          AND is_active
          AND next_check_at <= NOW()
          AND (scheduler_locked_until IS NULL OR scheduler_locked_until <= NOW())
        RETURNING id
        ",
    )
    .bind(id)
    .bind(lock_duration_ms)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(leased.is_some())
}

/// State sink: write one probe observation onto the monitor row.
///
/// Clears the scheduling lease and folds the observation into the
/// last-observation cache. The failure counter uses a relative increment so
/// concurrent writers compose.
pub async fn record_observation(
    pool: &PgPool,
    id: Uuid,
    result: &ProbeResult,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE monitored_links
        SET last_checked_at = NOW(),
            current_status = $2,
            last_status_code = $3,
            last_latency_ms = $4,
            consecutive_failures = CASE WHEN $5 THEN 0 ELSE consecutive_failures + 1 END,
            scheduler_locked_until = NULL,
            updated_at = NOW()
        WHERE id = $1
        ",
    )
    .bind(id)
    .bind(result.health_status)
    .bind(result.status_code)
    .bind(i32::try_from(result.latency_ms).unwrap_or(i32::MAX))
    .bind(result.is_healthy)
    .execute(pool)
    .await?;

    Ok(())
}

/// Number of active monitors whose lease has expired without being cleared.
///
/// A non-zero value after the lease horizon usually means a worker died
/// mid-probe; the next tick will pick these monitors up again.
pub async fn expired_lease_count(pool: &PgPool, now: DateTime<Utc>) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM monitored_links \
         WHERE is_active AND scheduler_locked_until IS NOT NULL AND scheduler_locked_until <= $1",
    )
    .bind(now)
    .fetch_one(pool)
    .await
}
