#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use chrono::Utc;
use claims::{assert_none, assert_some};
use linkwatch::BackgroundJob;
use linkwatch::jobs::{FORCE_CHECK_PRIORITY, HealthCheckJob};
use linkwatch::monitors::{self, NewMonitor};
use linkwatch::probe::ProbeResult;
use linkwatch::schema::{Environment, HealthStatus};
use linkwatch::scheduler::Scheduler;
use linkwatch::storage::pending_job_count;
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let postgres_image = Postgres::default();
        let container = postgres_image.start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok((pool, container))
    }

    pub(super) fn new_monitor(tag: &str) -> NewMonitor {
        NewMonitor {
            convex_url_id: format!("url-{tag}"),
            convex_user_id: format!("user-{tag}"),
            long_url: format!("https://example.com/{tag}"),
            short_url: format!("https://s.example/{tag}"),
            interval_ms: 60_000,
            environment: Environment::Prod,
        }
    }

    pub(super) fn scheduler(pool: PgPool, batch_size: i64) -> Scheduler {
        Scheduler::new(pool, Duration::from_secs(10), batch_size, 30_000)
    }
}

async fn monitor_row_count(pool: &PgPool) -> anyhow::Result<i64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM monitored_links")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[tokio::test]
async fn register_is_idempotent_on_convex_url_id() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let new = test_utils::new_monitor("a");
    let first = assert_some!(monitors::register(&pool, &new).await?);
    assert_none!(monitors::register(&pool, &new).await?);

    assert_eq!(monitor_row_count(&pool).await?, 1);

    // The submitted fields round-trip through the store.
    let monitor = assert_some!(monitors::find(&pool, first).await?);
    assert_eq!(monitor.convex_url_id, "url-a");
    assert_eq!(monitor.convex_user_id, "user-a");
    assert_eq!(monitor.long_url, "https://example.com/a");
    assert_eq!(monitor.short_url, "https://s.example/a");
    assert_eq!(monitor.interval_ms, 60_000);
    assert_eq!(monitor.environment, Environment::Prod);
    assert_eq!(monitor.current_status, HealthStatus::Pending);
    assert_eq!(monitor.consecutive_failures, 0);
    assert!(monitor.is_active);

    Ok(())
}

#[tokio::test]
async fn tick_enqueues_due_monitors_and_takes_leases() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let first = assert_some!(monitors::register(&pool, &test_utils::new_monitor("a")).await?);
    let second = assert_some!(monitors::register(&pool, &test_utils::new_monitor("b")).await?);

    let scheduler = test_utils::scheduler(pool.clone(), 500);
    scheduler.tick().await;

    assert_eq!(pending_job_count(&pool).await?, 2);

    for id in [first, second] {
        let monitor = assert_some!(monitors::find(&pool, id).await?);
        let lease = assert_some!(monitor.scheduler_locked_until);
        assert!(lease > Utc::now());
        assert!(monitor.next_check_at > Utc::now());
    }

    // The leases and advanced deadlines make a second tick a no-op.
    scheduler.tick().await;
    assert_eq!(pending_job_count(&pool).await?, 2);

    Ok(())
}

#[tokio::test]
async fn tick_dispatches_at_most_batch_size_jobs() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    for tag in ["a", "b", "c", "d", "e"] {
        assert_some!(monitors::register(&pool, &test_utils::new_monitor(tag)).await?);
    }

    let scheduler = test_utils::scheduler(pool.clone(), 2);
    scheduler.tick().await;

    assert_eq!(pending_job_count(&pool).await?, 2);

    Ok(())
}

#[tokio::test]
async fn deactivated_monitors_are_never_dispatched() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let id = assert_some!(monitors::register(&pool, &test_utils::new_monitor("a")).await?);
    assert!(monitors::deactivate(&pool, id).await?);

    let scheduler = test_utils::scheduler(pool.clone(), 500);
    scheduler.tick().await;

    assert_eq!(pending_job_count(&pool).await?, 0);

    // Unknown ids report as not found.
    assert!(!monitors::deactivate(&pool, Uuid::new_v4()).await?);

    Ok(())
}

#[tokio::test]
async fn expired_leases_make_monitors_eligible_again() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let id = assert_some!(monitors::register(&pool, &test_utils::new_monitor("a")).await?);

    let scheduler = test_utils::scheduler(pool.clone(), 500);
    scheduler.tick().await;
    assert_eq!(pending_job_count(&pool).await?, 1);

    // Simulate a worker that died after dequeue: the job is gone but the
    // lease was never cleared.
    sqlx::query("DELETE FROM background_jobs").execute(&pool).await?;
    sqlx::query(
        "UPDATE monitored_links
         SET scheduler_locked_until = NOW() - INTERVAL '1 second',
             next_check_at = NOW() - INTERVAL '1 second'
         WHERE id = $1",
    )
    .bind(id)
    .execute(&pool)
    .await?;

    assert_eq!(monitors::expired_lease_count(&pool, Utc::now()).await?, 1);

    scheduler.tick().await;
    assert_eq!(pending_job_count(&pool).await?, 1);

    Ok(())
}

#[tokio::test]
async fn force_check_enqueues_without_touching_the_schedule() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let id = assert_some!(monitors::register(&pool, &test_utils::new_monitor("a")).await?);
    let before = assert_some!(monitors::find(&pool, id).await?);

    let job = HealthCheckJob::from(&before);
    let job_id = assert_some!(
        job.enqueue_with_priority(&pool, FORCE_CHECK_PRIORITY)
            .await?
    );

    let after = assert_some!(monitors::find(&pool, id).await?);
    assert_eq!(after.next_check_at, before.next_check_at);
    assert_none!(after.scheduler_locked_until);

    let priority =
        sqlx::query_scalar::<_, i16>("SELECT priority FROM background_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_one(&pool)
            .await?;
    assert_eq!(priority, FORCE_CHECK_PRIORITY);

    Ok(())
}

#[tokio::test]
async fn scheduled_jobs_carry_the_probe_envelope() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let id = assert_some!(monitors::register(&pool, &test_utils::new_monitor("a")).await?);

    let scheduler = test_utils::scheduler(pool.clone(), 500);
    scheduler.tick().await;

    let data = sqlx::query_scalar::<_, serde_json::Value>(
        "SELECT data FROM background_jobs WHERE job_type = $1",
    )
    .bind(HealthCheckJob::JOB_NAME)
    .fetch_one(&pool)
    .await?;

    let job: HealthCheckJob = serde_json::from_value(data)?;
    assert_eq!(job.link_id, id);
    assert_eq!(job.convex_url_id, "url-a");
    assert_eq!(job.long_url, "https://example.com/a");
    assert_eq!(job.environment, Environment::Prod);

    Ok(())
}

#[tokio::test]
async fn observations_fold_into_the_last_observation_cache() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let id = assert_some!(monitors::register(&pool, &test_utils::new_monitor("a")).await?);

    let scheduler = test_utils::scheduler(pool.clone(), 500);
    scheduler.tick().await;

    let down = ProbeResult {
        status_code: 408,
        latency_ms: 10_000,
        is_healthy: false,
        health_status: HealthStatus::Down,
        error_message: Some("timeout after 10000 ms".to_string()),
    };

    monitors::record_observation(&pool, id, &down).await?;
    let monitor = assert_some!(monitors::find(&pool, id).await?);
    assert_eq!(monitor.current_status, HealthStatus::Down);
    assert_eq!(monitor.last_status_code, Some(408));
    assert_eq!(monitor.consecutive_failures, 1);
    // A completed observation clears the lease.
    assert_none!(monitor.scheduler_locked_until);
    assert_some!(monitor.last_checked_at);

    monitors::record_observation(&pool, id, &down).await?;
    let monitor = assert_some!(monitors::find(&pool, id).await?);
    assert_eq!(monitor.consecutive_failures, 2);

    let up = ProbeResult {
        status_code: 200,
        latency_ms: 50,
        is_healthy: true,
        health_status: HealthStatus::Up,
        error_message: None,
    };

    monitors::record_observation(&pool, id, &up).await?;
    let monitor = assert_some!(monitors::find(&pool, id).await?);
    assert_eq!(monitor.current_status, HealthStatus::Up);
    assert_eq!(monitor.last_status_code, Some(200));
    assert_eq!(monitor.last_latency_ms, Some(50));
    assert_eq!(monitor.consecutive_failures, 0);

    Ok(())
}
