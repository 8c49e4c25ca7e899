//! The health-check job: probe one URL and fan the result out to both sinks.

use crate::background_job::BackgroundJob;
use crate::history::{HealthCheckRecord, HistorySinks};
use crate::monitors;
use crate::probe::ProbeEngine;
use crate::schema::{Environment, Monitor};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Priority for scheduled checks.
pub const SCHEDULED_PRIORITY: i16 = 0;
/// Priority for operator-requested force checks; dispatched before any
/// pending scheduled work.
pub const FORCE_CHECK_PRIORITY: i16 = 100;

/// Shared context handed to every job.
#[derive(Clone)]
pub struct AppContext {
    /// Process-wide connection pool (also the state sink).
    pub pool: PgPool,
    /// Stateless probe executor.
    pub probe: Arc<ProbeEngine>,
    /// Per-environment history clients.
    pub history: Arc<HistorySinks>,
}

/// The queue envelope: immutable probe inputs for one monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckJob {
    /// Monitor row id.
    pub link_id: Uuid,
    /// Opaque external URL identity.
    pub convex_url_id: String,
    /// Opaque external owner identity.
    pub convex_user_id: String,
    /// The URL to probe.
    pub long_url: String,
    /// Reported to the history sink only.
    pub short_url: String,
    /// Selects the history-sink deployment.
    pub environment: Environment,
}

impl From<&Monitor> for HealthCheckJob {
    fn from(monitor: &Monitor) -> Self {
        Self {
            link_id: monitor.id,
            convex_url_id: monitor.convex_url_id.clone(),
            convex_user_id: monitor.convex_user_id.clone(),
            long_url: monitor.long_url.clone(),
            short_url: monitor.short_url.clone(),
            environment: monitor.environment,
        }
    }
}

impl BackgroundJob for HealthCheckJob {
    const JOB_NAME: &'static str = "health_check";
    const PRIORITY: i16 = SCHEDULED_PRIORITY;
    // A still-pending scheduled check for the same monitor suppresses a
    // duplicate scheduled enqueue. Force checks enqueue at a different
    // priority and are never suppressed.
    const DEDUPLICATED: bool = true;

    type Context = AppContext;

    /// Probe, then update both sinks.
    ///
    /// Sink failures are logged and reported but do not fail the job: the
    /// probe already happened, and failing here would only trigger a
    /// re-probe storm. A state-sink miss leaves the lease in place; the
    /// monitor becomes schedulable again once the lease expires.
    async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
        let result = ctx.probe.probe(&self.long_url).await?;
        let checked_at = Utc::now().timestamp_millis();

        info!(
            link_id = %self.link_id,
            url = %self.long_url,
            status = result.status_code,
            latency_ms = result.latency_ms,
            health = ?result.health_status,
            "probe complete"
        );

        if let Err(e) = monitors::record_observation(&ctx.pool, self.link_id, &result).await {
            error!(link_id = %self.link_id, "state sink update failed: {e}");
            sentry_core::capture_error(&e);
        }

        if let Some(client) = ctx.history.client(self.environment) {
            let record = HealthCheckRecord {
                shared_secret: ctx.history.shared_secret().unwrap_or_default().to_string(),
                url_id: self.convex_url_id.clone(),
                user_id: self.convex_user_id.clone(),
                short_url: self.short_url.clone(),
                long_url: self.long_url.clone(),
                status_code: result.status_code,
                latency_ms: result.latency_ms,
                is_healthy: result.is_healthy,
                health_status: result.health_status,
                error_message: result.error_message.clone(),
                checked_at,
            };

            if let Err(e) = client.record_health_check(&record).await {
                error!(link_id = %self.link_id, "history sink write failed: {e}");
                sentry_core::capture_error(&e);
            }
        }

        Ok(())
    }
}
