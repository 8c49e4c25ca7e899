#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod api;
mod background_job;
pub mod config;
mod errors;
pub mod history;
mod job_registry;
pub mod jobs;
pub mod monitors;
pub mod probe;
mod rate_limit;
pub mod retention;
mod runner;
pub mod schema;
pub mod scheduler;
pub mod storage;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::{BackgroundJob, enqueue_in_transaction};
/// Error type for job enqueueing operations.
pub use self::errors::EnqueueError;
/// Shared dispatch rate limiter.
pub use self::rate_limit::RateLimiter;
/// The worker-pool runner and its shutdown handle.
pub use self::runner::{RunHandle, Runner};
