//! Browser-emulating HTTP probes.
//!
//! A probe issues a `HEAD` request with a realistic desktop-browser header
//! set, follows redirects, and falls back to `GET` when the response looks
//! like a bot challenge. Transport failures are classified, not raised:
//! only an engine-level bug (an unbuildable request) surfaces as an error
//! and reaches the queue's retry machinery.

use crate::schema::HealthStatus;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use std::error::Error as _;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Response statuses that indicate the probe was blocked by anti-automation
/// rather than the target being down. A `HEAD` hitting one of these is
/// retried as `GET` under the remaining deadline.
const BOT_CHALLENGE_STATUSES: [u16; 5] = [403, 405, 406, 429, 503];

/// Realistic desktop browser identities, one picked per probe.
const USER_AGENTS: [&str; 6] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
];

/// The in-memory outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// HTTP status of the final response; 408 for timeouts, 0 for other
    /// transport failures.
    pub status_code: i32,
    /// Milliseconds from request start to the final response (or failure).
    pub latency_ms: i64,
    /// Whether the response counts as healthy (2xx/3xx).
    pub is_healthy: bool,
    /// Classification derived from status and latency.
    pub health_status: HealthStatus,
    /// Human-readable cause when the probe failed in transport.
    pub error_message: Option<String>,
}

/// Engine-level failure: the request could not even be attempted.
///
/// Transport failures do NOT produce this; they classify as `down`.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The request could not be built (malformed URL or headers).
    #[error("failed to build probe request: {0}")]
    Request(#[source] reqwest::Error),
}

/// Stateless probe executor, shared by all workers.
#[derive(Debug)]
pub struct ProbeEngine {
    client: reqwest::Client,
    timeout: Duration,
    degraded_threshold_ms: i64,
}

impl ProbeEngine {
    /// Build an engine with the given per-probe deadline and degraded-latency
    /// threshold.
    pub fn new(timeout: Duration, degraded_threshold_ms: i64) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;

        Ok(Self {
            client,
            timeout,
            degraded_threshold_ms,
        })
    }

    /// Probe a URL once.
    pub async fn probe(&self, url: &str) -> Result<ProbeResult, ProbeError> {
        let started = Instant::now();
        let user_agent = USER_AGENTS[rand::thread_rng().gen_range(0..USER_AGENTS.len())];
        let headers = browser_headers(user_agent);

        let head = self
            .client
            .head(url)
            .headers(headers.clone())
            .timeout(self.timeout)
            .send()
            .await;

        let response = match head {
            Ok(response) if BOT_CHALLENGE_STATUSES.contains(&response.status().as_u16()) => {
                let blocked_status = response.status().as_u16();
                debug!(status = blocked_status, %url, "bot challenge on HEAD, retrying as GET");

                let jitter = Duration::from_millis(100 + rand::thread_rng().gen_range(0..200));
                tokio::time::sleep(jitter).await;

                let remaining = self.timeout.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    return Ok(self.timed_out(started));
                }

                match self
                    .client
                    .get(url)
                    .headers(headers)
                    .timeout(remaining)
                    .send()
                    .await
                {
                    Ok(response) => response,
                    Err(err) => return self.failed(err, started),
                }
            }
            Ok(response) => response,
            Err(err) => return self.failed(err, started),
        };

        let status_code = response.status().as_u16();
        let latency_ms = started.elapsed().as_millis() as i64;
        let (is_healthy, health_status) =
            classify(status_code, latency_ms, self.degraded_threshold_ms);

        Ok(ProbeResult {
            status_code: i32::from(status_code),
            latency_ms,
            is_healthy,
            health_status,
            error_message: None,
        })
    }

    fn failed(
        &self,
        err: reqwest::Error,
        started: Instant,
    ) -> Result<ProbeResult, ProbeError> {
        if err.is_builder() {
            return Err(ProbeError::Request(err));
        }

        if err.is_timeout() {
            return Ok(self.timed_out(started));
        }

        Ok(ProbeResult {
            status_code: 0,
            latency_ms: started.elapsed().as_millis() as i64,
            is_healthy: false,
            health_status: HealthStatus::Down,
            error_message: Some(render_error(&err)),
        })
    }

    fn timed_out(&self, started: Instant) -> ProbeResult {
        let latency_ms = started.elapsed().as_millis() as i64;
        ProbeResult {
            status_code: 408,
            latency_ms,
            is_healthy: false,
            health_status: HealthStatus::Down,
            error_message: Some(format!("timeout after {latency_ms} ms")),
        }
    }
}

/// Classify a completed response. Pure and total: every input yields
/// exactly one of up/degraded/down.
pub fn classify(
    status_code: u16,
    latency_ms: i64,
    degraded_threshold_ms: i64,
) -> (bool, HealthStatus) {
    let is_healthy = (200..400).contains(&status_code);

    let health_status = if !is_healthy {
        HealthStatus::Down
    } else if latency_ms > degraded_threshold_ms {
        HealthStatus::Degraded
    } else {
        HealthStatus::Up
    };

    (is_healthy, health_status)
}

/// Compose the browser-style header set for a probe.
///
/// Chromium identities additionally carry the client-hint and fetch
/// metadata headers a real Chrome/Edge would send on navigation.
fn browser_headers(user_agent: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_str(user_agent).unwrap_or(HeaderValue::from_static("Mozilla/5.0")));
    headers.insert(
        "Accept",
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert("Accept-Language", HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert("Accept-Encoding", HeaderValue::from_static("gzip, deflate, br"));
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Pragma", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));
    headers.insert("Upgrade-Insecure-Requests", HeaderValue::from_static("1"));

    if is_chromium(user_agent) {
        let brand = if user_agent.contains("Edg/") {
            "\"Chromium\";v=\"124\", \"Microsoft Edge\";v=\"124\", \"Not-A.Brand\";v=\"99\""
        } else {
            "\"Chromium\";v=\"124\", \"Google Chrome\";v=\"124\", \"Not-A.Brand\";v=\"99\""
        };
        let platform = ua_platform(user_agent);

        headers.insert("Sec-CH-UA", HeaderValue::from_static(brand));
        headers.insert("Sec-CH-UA-Mobile", HeaderValue::from_static("?0"));
        headers.insert(
            "Sec-CH-UA-Platform",
            HeaderValue::from_str(&format!("\"{platform}\""))
                .unwrap_or(HeaderValue::from_static("\"Windows\"")),
        );
        headers.insert("Sec-Fetch-Dest", HeaderValue::from_static("document"));
        headers.insert("Sec-Fetch-Mode", HeaderValue::from_static("navigate"));
        headers.insert("Sec-Fetch-Site", HeaderValue::from_static("none"));
        headers.insert("Sec-Fetch-User", HeaderValue::from_static("?1"));
    }

    headers
}

fn is_chromium(user_agent: &str) -> bool {
    user_agent.contains("Chrome/")
}

fn ua_platform(user_agent: &str) -> &'static str {
    if user_agent.contains("Windows") {
        "Windows"
    } else if user_agent.contains("Macintosh") {
        "macOS"
    } else {
        "Linux"
    }
}

fn render_error(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
