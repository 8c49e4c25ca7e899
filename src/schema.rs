//! Database row types.
//!
//! Queue rows (`background_jobs` and its forensics tables) and the
//! `monitored_links` monitor rows share this module so every storage
//! function maps onto a type defined here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// A pending (or retryable) job in the `background_jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct BackgroundJob {
    /// Unique identifier for the job.
    pub id: i64,
    /// Type identifier for the job (used for dispatch).
    pub job_type: String,
    /// JSON payload.
    pub data: Value,
    /// Number of failed attempts so far.
    pub retries: i32,
    /// Timestamp of the last failed attempt.
    pub last_retry: DateTime<Utc>,
    /// Timestamp when the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// Priority of the job (higher = dispatched sooner).
    pub priority: i16,
}

/// A job retained in `completed_jobs` after a successful run.
#[derive(Debug, Clone, FromRow)]
pub struct CompletedJob {
    /// The original job columns.
    #[sqlx(flatten)]
    pub job: BackgroundJob,
    /// When the job finished.
    pub completed_at: DateTime<Utc>,
}

/// A job retained in `failed_jobs` after exhausting its attempts.
#[derive(Debug, Clone, FromRow)]
pub struct FailedJob {
    /// The original job columns.
    #[sqlx(flatten)]
    pub job: BackgroundJob,
    /// Rendered error from the final attempt.
    pub error: String,
    /// When the job was buried.
    pub failed_at: DateTime<Utc>,
}

/// Health classification of a monitored link.
///
/// `Pending` only ever appears before the first probe completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "health_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No probe has completed yet.
    Pending,
    /// Healthy and responding within the degraded threshold.
    Up,
    /// Healthy but slower than the degraded threshold.
    Degraded,
    /// Unreachable, timed out, or a non-2xx/3xx response.
    Down,
}

/// Which history-sink deployment a monitor reports to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "environment", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Development deployment.
    Dev,
    /// Production deployment.
    Prod,
}

/// One watched URL: scheduling state plus the latest-observation cache.
#[derive(Debug, Clone, FromRow)]
pub struct Monitor {
    /// Locally generated identity.
    pub id: Uuid,
    /// Opaque external URL identity, unique across monitors.
    pub convex_url_id: String,
    /// Opaque external owner identity.
    pub convex_user_id: String,
    /// The URL that is probed.
    pub long_url: String,
    /// The short form, carried through to the history sink.
    pub short_url: String,
    /// Selects the history-sink deployment.
    pub environment: Environment,
    /// Polling interval in milliseconds, at least 1000.
    pub interval_ms: i64,
    /// When the monitor next becomes due.
    pub next_check_at: DateTime<Utc>,
    /// Scheduling lease; while in the future, no new job may be enqueued.
    pub scheduler_locked_until: Option<DateTime<Utc>>,
    /// Soft-delete flag; inactive monitors are never scheduled.
    pub is_active: bool,
    /// Classification of the most recent probe.
    pub current_status: HealthStatus,
    /// When the most recent probe completed.
    pub last_checked_at: Option<DateTime<Utc>>,
    /// HTTP status of the most recent probe.
    pub last_status_code: Option<i32>,
    /// Latency of the most recent probe.
    pub last_latency_ms: Option<i32>,
    /// Length of the trailing run of unhealthy probes.
    pub consecutive_failures: i32,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last row update time.
    pub updated_at: DateTime<Utc>,
}
