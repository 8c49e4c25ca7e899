//! The scheduler: converts due monitors into queued health-check jobs.
//!
//! One logical ticker per process; multiple replicas may tick concurrently
//! because the per-monitor lease (`scheduler_locked_until`) serializes
//! dispatch across processes. Within a process a reentrancy guard skips a
//! tick while the previous one is still running.

use crate::background_job::enqueue_in_transaction;
use crate::jobs::HealthCheckJob;
use crate::monitors;
use crate::schema::Monitor;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

/// Periodic due-monitor scan and dispatch.
#[derive(Clone)]
pub struct Scheduler {
    pool: PgPool,
    tick_every: Duration,
    batch_size: i64,
    lock_duration_ms: i64,
    running: Arc<Mutex<()>>,
}

impl Scheduler {
    /// Create a scheduler.
    pub fn new(pool: PgPool, tick_every: Duration, batch_size: i64, lock_duration_ms: i64) -> Self {
        Self {
            pool,
            tick_every,
            batch_size,
            lock_duration_ms,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Start the ticker. It stops after the stop signal fires; an in-flight
    /// tick always completes first.
    pub fn spawn(self, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.tick_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(every = ?self.tick_every, "Scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.running.clone().try_lock_owned() {
                            Ok(guard) => {
                                let scheduler = self.clone();
                                tokio::spawn(async move {
                                    let _guard = guard;
                                    scheduler.tick().await;
                                });
                            }
                            Err(_) => {
                                warn!("Previous scheduler tick still running, skipping this tick");
                            }
                        }
                    }
                    _ = stop.changed() => break,
                }
            }

            // Wait for any in-flight tick before reporting the scheduler down.
            let _drain = self.running.lock().await;
            info!("Scheduler stopped");
        })
    }

    /// One tick: select due monitors and dispatch each in its own
    /// transaction. Never propagates an error to the caller.
    pub async fn tick(&self) {
        let started = Instant::now();

        let batch = match monitors::due_monitors(&self.pool, self.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                error!("Failed to select due monitors: {e}");
                return;
            }
        };

        let selected = batch.len();
        let mut queued = 0usize;

        for monitor in &batch {
            match self.dispatch(monitor).await {
                Ok(true) => queued += 1,
                Ok(false) => {
                    debug!(link_id = %monitor.id, "Monitor no longer eligible, skipping");
                }
                Err(e) => {
                    // Abandon the rest of the batch; the untouched tail is
                    // still due and the next tick will pick it up.
                    error!(link_id = %monitor.id, "Failed to dispatch monitor: {e}");
                    break;
                }
            }
        }

        info!(
            selected,
            queued,
            tick_duration_ms = started.elapsed().as_millis() as u64,
            "Scheduler tick complete"
        );
    }

    /// Lease one monitor and enqueue its job, atomically.
    ///
    /// Returns false when the monitor stopped being eligible between
    /// selection and dispatch (deactivated, or claimed by another replica).
    async fn dispatch(&self, monitor: &Monitor) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        if !monitors::lease(&mut tx, monitor.id, self.lock_duration_ms).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        enqueue_in_transaction(&HealthCheckJob::from(monitor), &mut tx).await?;
        tx.commit().await?;

        Ok(true)
    }
}
