//! Environment-driven configuration.
//!
//! `DATABASE_URL` is the only required value; everything else has a
//! default or degrades with a warning at boot. Parsing is injected with a
//! lookup function so tests never touch the process environment.

use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// Process environment, governing auth strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    /// Local development: a missing API secret logs and allows requests.
    Development,
    /// Production: requests without a valid bearer token are rejected.
    Production,
}

/// Configuration errors are fatal at boot.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is absent.
    #[error("missing required configuration: {0}")]
    Missing(&'static str),

    /// A variable is present but unparseable.
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// The offending value.
        value: String,
        /// Why it did not parse.
        reason: String,
    },
}

/// All runtime configuration, resolved once at boot.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. Required.
    pub database_url: String,
    /// Convex deployment for `dev` monitors.
    pub convex_url_dev: Option<String>,
    /// Convex deployment for `prod` monitors.
    pub convex_url_prod: Option<String>,
    /// Secret stamped into every history-sink record.
    pub monitoring_shared_secret: Option<String>,
    /// Bearer secret for the admin API.
    pub monitoring_api_secret: Option<String>,
    /// dev or prod process environment.
    pub app_env: AppEnv,
    /// Admin API listen port.
    pub port: u16,
    /// Scheduler tick period.
    pub scheduler_interval_ms: u64,
    /// Max monitors dispatched per tick.
    pub scheduler_batch_size: i64,
    /// Lease horizon taken on each dispatched monitor.
    pub lock_duration_ms: i64,
    /// Concurrent probe workers.
    pub worker_concurrency: usize,
    /// Max dispatches per rate-limit window, across all workers.
    pub queue_rate_limit_max: u32,
    /// Rate-limit window length.
    pub queue_rate_limit_duration_ms: u64,
    /// Per-probe deadline.
    pub check_timeout_ms: u64,
    /// Healthy responses slower than this classify as degraded.
    pub degraded_threshold_ms: i64,
    /// Default tracing filter when RUST_LOG is unset.
    pub log_level: String,
    /// Optional Sentry DSN.
    pub sentry_dsn: Option<String>,
    /// Role gate: serve the admin API.
    pub run_api: bool,
    /// Role gate: run the scheduler ticker.
    pub run_scheduler: bool,
    /// Role gate: run the worker pool.
    pub run_worker: bool,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary lookup function.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            convex_url_dev: get("CONVEX_URL_DEV"),
            convex_url_prod: get("CONVEX_URL_PROD"),
            monitoring_shared_secret: get("MONITORING_SHARED_SECRET"),
            monitoring_api_secret: get("MONITORING_API_SECRET"),
            app_env: parse_app_env(&get)?,
            port: parse_or(&get, "PORT", 3001)?,
            scheduler_interval_ms: parse_or(&get, "SCHEDULER_INTERVAL_MS", 10_000)?,
            scheduler_batch_size: parse_or(&get, "SCHEDULER_BATCH_SIZE", 500)?,
            lock_duration_ms: parse_or(&get, "LOCK_DURATION_MS", 30_000)?,
            worker_concurrency: parse_or(&get, "WORKER_CONCURRENCY", 10)?,
            queue_rate_limit_max: parse_or(&get, "QUEUE_RATE_LIMIT_MAX", 100)?,
            queue_rate_limit_duration_ms: parse_or(&get, "QUEUE_RATE_LIMIT_DURATION_MS", 1_000)?,
            check_timeout_ms: parse_or(&get, "CHECK_TIMEOUT_MS", 10_000)?,
            degraded_threshold_ms: parse_or(&get, "DEGRADED_THRESHOLD_MS", 3_000)?,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            sentry_dsn: get("SENTRY_DSN"),
            run_api: parse_bool(&get, "RUN_API", true)?,
            run_scheduler: parse_bool(&get, "RUN_SCHEDULER", true)?,
            run_worker: parse_bool(&get, "RUN_WORKER", true)?,
        })
    }

    /// Whether this process enforces admin-API auth unconditionally.
    pub fn is_production(&self) -> bool {
        self.app_env == AppEnv::Production
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match get(name) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value,
            reason: e.to_string(),
        }),
    }
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(name) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid {
                name,
                value,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}

fn parse_app_env(get: &impl Fn(&str) -> Option<String>) -> Result<AppEnv, ConfigError> {
    match get("APP_ENV") {
        None => Ok(AppEnv::Development),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(AppEnv::Development),
            "prod" | "production" => Ok(AppEnv::Production),
            _ => Err(ConfigError::Invalid {
                name: "APP_ENV",
                value,
                reason: "expected dev or prod".to_string(),
            }),
        },
    }
}
