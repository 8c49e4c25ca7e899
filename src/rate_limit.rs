//! Dispatch rate limiting shared by all workers of a queue.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Fixed-window rate limiter.
///
/// Caps the number of job dispatches across all workers of a queue to
/// `max` per `window`. Acquiring a slot when the window is exhausted waits
/// until the window rolls over.
#[derive(Debug)]
pub struct RateLimiter {
    max: u32,
    window: Duration,
    state: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    started_at: Instant,
    dispatched: u32,
}

impl RateLimiter {
    /// Create a limiter allowing `max` dispatches per `window`.
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max: max.max(1),
            window,
            state: Mutex::new(Window {
                started_at: Instant::now(),
                dispatched: 0,
            }),
        }
    }

    /// Wait until a dispatch slot is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("rate limiter lock poisoned");
                let now = Instant::now();
                if now.duration_since(state.started_at) >= self.window {
                    state.started_at = now;
                    state.dispatched = 0;
                }
                if state.dispatched < self.max {
                    state.dispatched += 1;
                    return;
                }
                self.window - now.duration_since(state.started_at)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Consume a slot if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        if now.duration_since(state.started_at) >= self.window {
            state.started_at = now;
            state.dispatched = 0;
        }
        if state.dispatched < self.max {
            state.dispatched += 1;
            true
        } else {
            false
        }
    }
}
