//! History sink: permanent per-probe records in a Convex deployment.
//!
//! One client per environment. Every observation becomes one
//! `linkHealth:recordHealthCheck` mutation; the deployment deduplicates on
//! `{urlId, checkedAt}`, so at-least-once delivery from the worker side is
//! fine. All errors here are treated as transient by the caller.

use crate::schema::{Environment, HealthStatus};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

const RECORD_HEALTH_CHECK: &str = "linkHealth:recordHealthCheck";

/// Errors from the history sink. Always transient from the worker's point
/// of view: the job still succeeds.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// The deployment was reached but rejected the mutation.
    #[error("history sink rejected {function}: {status}")]
    Rejected {
        /// Mutation that was attempted.
        function: &'static str,
        /// HTTP status of the rejection.
        status: reqwest::StatusCode,
    },

    /// The deployment could not be reached.
    #[error("history sink request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// One probe observation, shaped for the `recordHealthCheck` mutation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckRecord {
    /// Shared secret authenticating the monitoring service.
    pub shared_secret: String,
    /// External URL identity.
    pub url_id: String,
    /// External owner identity.
    pub user_id: String,
    /// Short form of the link.
    pub short_url: String,
    /// The probed URL.
    pub long_url: String,
    /// Final HTTP status (408 timeout, 0 transport failure).
    pub status_code: i32,
    /// Probe latency.
    pub latency_ms: i64,
    /// Whether the observation counts as healthy.
    pub is_healthy: bool,
    /// up / degraded / down.
    pub health_status: HealthStatus,
    /// Cause, when the probe failed in transport.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Observation time, epoch milliseconds. Part of the idempotency key.
    pub checked_at: i64,
}

#[derive(Serialize)]
struct MutationRequest<'a, T> {
    path: &'a str,
    args: &'a T,
    format: &'a str,
}

/// Client for one Convex deployment.
#[derive(Debug, Clone)]
pub struct HistoryClient {
    client: reqwest::Client,
    mutation_url: String,
}

impl HistoryClient {
    /// Create a client for a deployment base URL (e.g. `https://x.convex.cloud`).
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            mutation_url: format!("{}/api/mutation", base_url.trim_end_matches('/')),
        }
    }

    /// Record one health check.
    pub async fn record_health_check(&self, record: &HealthCheckRecord) -> Result<(), HistoryError> {
        let body = MutationRequest {
            path: RECORD_HEALTH_CHECK,
            args: record,
            format: "json",
        };

        let response = self
            .client
            .post(&self.mutation_url)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(HistoryError::Rejected {
                function: RECORD_HEALTH_CHECK,
                status,
            });
        }

        Ok(())
    }
}

/// The per-environment history clients, built once at boot.
///
/// A missing deployment URL or shared secret disables the affected sink
/// with a warning; probes keep running and the state sink still updates.
#[derive(Debug, Clone, Default)]
pub struct HistorySinks {
    dev: Option<HistoryClient>,
    prod: Option<HistoryClient>,
    shared_secret: Option<String>,
}

impl HistorySinks {
    /// Build the sinks from the configured deployment URLs and secret.
    pub fn new(
        client: reqwest::Client,
        dev_url: Option<&str>,
        prod_url: Option<&str>,
        shared_secret: Option<String>,
    ) -> Self {
        if shared_secret.is_none() {
            warn!("MONITORING_SHARED_SECRET is not set; history sink disabled");
            return Self::default();
        }
        if dev_url.is_none() {
            warn!("CONVEX_URL_DEV is not set; history sink disabled for dev monitors");
        }
        if prod_url.is_none() {
            warn!("CONVEX_URL_PROD is not set; history sink disabled for prod monitors");
        }

        Self {
            dev: dev_url.map(|url| HistoryClient::new(client.clone(), url)),
            prod: prod_url.map(|url| HistoryClient::new(client, url)),
            shared_secret,
        }
    }

    /// The client for an environment, if configured.
    pub fn client(&self, environment: Environment) -> Option<&HistoryClient> {
        match environment {
            Environment::Dev => self.dev.as_ref(),
            Environment::Prod => self.prod.as_ref(),
        }
    }

    /// The shared secret stamped into every record.
    pub fn shared_secret(&self) -> Option<&str> {
        self.shared_secret.as_deref()
    }
}
