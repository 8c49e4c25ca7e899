//! Admin HTTP API.
//!
//! Thin wrappers over the monitor store and the queue: registration,
//! force-checks, status reads and soft deletes. The scheduling core never
//! depends on this module.

use crate::background_job::BackgroundJob;
use crate::errors::EnqueueError;
use crate::jobs::{FORCE_CHECK_PRIORITY, HealthCheckJob};
use crate::monitors::{self, NewMonitor};
use crate::schema::{Environment, HealthStatus, Monitor};
use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::StatusCode,
    http::header::AUTHORIZATION,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Process-wide connection pool.
    pub pool: PgPool,
    /// Bearer secret; `None` means auth is not configured.
    pub api_secret: Option<String>,
    /// Reject unauthenticated requests even without a configured secret.
    pub strict_auth: bool,
}

/// Errors surfaced by admin-API handlers.
#[derive(Debug, Error)]
pub enum AppError {
    /// Request body failed validation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// Unknown (or inactive, for force-checks) monitor.
    #[error("Not Found")]
    NotFound,
    /// Missing or mismatched bearer token.
    #[error("Unauthorized")]
    Unauthorized,
    /// Monitor store failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Queue insert failure.
    #[error("Queue error: {0}")]
    Enqueue(#[from] EnqueueError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound => (StatusCode::NOT_FOUND, "Monitor not found".to_string()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::Database(err) => {
                error!("Database error in admin API: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Enqueue(err) => {
                error!("Enqueue error in admin API: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "error": error_message }))).into_response()
    }
}

/// Build the admin router. `/health` is open; everything under `/monitors`
/// requires the bearer secret.
pub fn router(state: AppState) -> Router {
    let monitor_routes = Router::new()
        .route("/register", post(register_monitor))
        .route("/batch", post(register_batch))
        .route("/{id}/force-check", post(force_check))
        .route("/{id}", get(get_monitor).delete(delete_monitor))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    Router::new()
        .route("/health", get(health))
        .nest("/monitors", monitor_routes)
        .with_state(state)
}

async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    match &state.api_secret {
        Some(secret) => {
            let token = request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "));

            if token == Some(secret.as_str()) {
                Ok(next.run(request).await)
            } else {
                Err(AppError::Unauthorized)
            }
        }
        None if state.strict_auth => Err(AppError::Unauthorized),
        None => {
            warn!("MONITORING_API_SECRET is not set; allowing unauthenticated admin request");
            Ok(next.run(request).await)
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "linkwatch",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Registration payload; `convexUrlId` is the idempotency key.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMonitor {
    convex_url_id: String,
    convex_user_id: String,
    long_url: String,
    short_url: String,
    interval_ms: Option<i64>,
    environment: Option<Environment>,
}

impl RegisterMonitor {
    fn into_new_monitor(self) -> Result<NewMonitor, AppError> {
        let interval_ms = self.interval_ms.unwrap_or(60_000);
        if interval_ms < 1000 {
            return Err(AppError::InvalidInput(
                "intervalMs must be at least 1000".to_string(),
            ));
        }

        Ok(NewMonitor {
            convex_url_id: self.convex_url_id,
            convex_user_id: self.convex_user_id,
            long_url: self.long_url,
            short_url: self.short_url,
            interval_ms,
            environment: self.environment.unwrap_or(Environment::Prod),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterOutcome {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    link_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
}

impl RegisterOutcome {
    fn registered(link_id: Uuid) -> Self {
        Self {
            success: true,
            link_id: Some(link_id),
            message: None,
        }
    }

    fn already_registered() -> Self {
        Self {
            success: true,
            link_id: None,
            message: Some("Already registered"),
        }
    }
}

async fn register_monitor(
    State(state): State<AppState>,
    Json(payload): Json<RegisterMonitor>,
) -> Result<Json<RegisterOutcome>, AppError> {
    let new = payload.into_new_monitor()?;

    let outcome = match monitors::register(&state.pool, &new).await? {
        Some(link_id) => RegisterOutcome::registered(link_id),
        None => RegisterOutcome::already_registered(),
    };

    Ok(Json(outcome))
}

async fn register_batch(
    State(state): State<AppState>,
    Json(payload): Json<Vec<RegisterMonitor>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut results = Vec::with_capacity(payload.len());

    for entry in payload {
        let new = entry.into_new_monitor()?;
        let outcome = match monitors::register(&state.pool, &new).await? {
            Some(link_id) => RegisterOutcome::registered(link_id),
            None => RegisterOutcome::already_registered(),
        };
        results.push(outcome);
    }

    Ok(Json(serde_json::json!({
        "success": true,
        "results": results,
    })))
}

/// Enqueue an out-of-band probe at high priority.
///
/// Does not touch `next_check_at`: the regular cadence is unaffected.
async fn force_check(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let monitor = monitors::find(&state.pool, id)
        .await?
        .filter(|monitor| monitor.is_active)
        .ok_or(AppError::NotFound)?;

    let job_id = HealthCheckJob::from(&monitor)
        .enqueue_with_priority(&state.pool, FORCE_CHECK_PRIORITY)
        .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "jobId": job_id,
    })))
}

/// Read-only status projection of a monitor row.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    link_id: Uuid,
    convex_url_id: String,
    long_url: String,
    short_url: String,
    environment: Environment,
    is_active: bool,
    interval_ms: i64,
    current_status: HealthStatus,
    last_checked_at: Option<DateTime<Utc>>,
    last_status_code: Option<i32>,
    last_latency_ms: Option<i32>,
    consecutive_failures: i32,
    next_check_at: DateTime<Utc>,
}

impl From<Monitor> for MonitorStatus {
    fn from(monitor: Monitor) -> Self {
        Self {
            link_id: monitor.id,
            convex_url_id: monitor.convex_url_id,
            long_url: monitor.long_url,
            short_url: monitor.short_url,
            environment: monitor.environment,
            is_active: monitor.is_active,
            interval_ms: monitor.interval_ms,
            current_status: monitor.current_status,
            last_checked_at: monitor.last_checked_at,
            last_status_code: monitor.last_status_code,
            last_latency_ms: monitor.last_latency_ms,
            consecutive_failures: monitor.consecutive_failures,
            next_check_at: monitor.next_check_at,
        }
    }
}

async fn get_monitor(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<MonitorStatus>, AppError> {
    let monitor = monitors::find(&state.pool, id)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(Json(monitor.into()))
}

async fn delete_monitor(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !monitors::deactivate(&state.pool, id).await? {
        return Err(AppError::NotFound);
    }

    Ok(Json(serde_json::json!({ "success": true })))
}
