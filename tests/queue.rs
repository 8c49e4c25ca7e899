#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use claims::{assert_none, assert_some};
use insta::assert_compact_json_snapshot;
use linkwatch::retention::{ForensicsTable, RetentionPolicy, sweep_once};
use linkwatch::storage::{
    completed_job_count, failed_job_count, get_completed_jobs, get_failed_jobs, pending_job_count,
    retried_job_count,
};
use linkwatch::{BackgroundJob, Runner};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::{Barrier, Mutex};

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the pool and container
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

    /// Create a test runner with common configuration
    pub(super) fn create_test_runner<Context: Clone + Send + Sync + 'static>(
        pool: PgPool,
        context: Context,
    ) -> Runner<Context> {
        Runner::new(pool, context)
            .num_workers(2)
            .shutdown_when_queue_empty()
    }
}

async fn all_jobs(pool: &PgPool) -> anyhow::Result<Vec<(String, Value)>> {
    let jobs = sqlx::query("SELECT job_type, data FROM background_jobs ORDER BY id")
        .fetch_all(pool)
        .await?;

    Ok(jobs
        .into_iter()
        .map(|row| {
            let job_type: String = row.get("job_type");
            let data: Value = row.get("data");
            (job_type, data)
        })
        .collect())
}

async fn job_exists(id: i64, pool: &PgPool) -> anyhow::Result<bool> {
    let result =
        sqlx::query_scalar::<_, Option<i64>>("SELECT id FROM background_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    Ok(result.is_some())
}

async fn job_is_locked(id: i64, pool: &PgPool) -> anyhow::Result<bool> {
    let result = sqlx::query_scalar::<_, Option<i64>>(
        "SELECT id FROM background_jobs WHERE id = $1 FOR UPDATE SKIP LOCKED",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(result.is_none())
}

#[tokio::test]
async fn migrations_create_the_queue_tables() {
    let (pool, _container) = test_utils::setup_test_db().await.unwrap();

    let table_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables
         WHERE table_name IN ('background_jobs', 'completed_jobs', 'failed_jobs', 'monitored_links')
         AND table_schema = 'public'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    assert_eq!(table_count, 4);
}

#[tokio::test]
async fn jobs_are_locked_when_fetched() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct TestContext {
        job_started_barrier: Arc<Barrier>,
        assertions_finished_barrier: Arc<Barrier>,
    }

    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = TestContext;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
            ctx.job_started_barrier.wait().await;
            ctx.assertions_finished_barrier.wait().await;
            Ok(())
        }
    }

    let test_context = TestContext {
        job_started_barrier: Arc::new(Barrier::new(2)),
        assertions_finished_barrier: Arc::new(Barrier::new(2)),
    };

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner =
        test_utils::create_test_runner(pool.clone(), test_context.clone()).register::<TestJob>();

    let job_id = assert_some!(TestJob.enqueue(&pool).await?);

    assert!(job_exists(job_id, &pool).await?);
    assert!(!job_is_locked(job_id, &pool).await?);

    let runner = runner.start();
    test_context.job_started_barrier.wait().await;

    assert!(job_exists(job_id, &pool).await?);
    assert!(job_is_locked(job_id, &pool).await?);

    test_context.assertions_finished_barrier.wait().await;
    runner.wait_for_shutdown().await;

    assert!(!job_exists(job_id, &pool).await?);

    Ok(())
}

#[tokio::test]
async fn successful_jobs_move_to_the_completed_set() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob {
        message: String,
    }

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner = test_utils::create_test_runner(pool.clone(), ()).register::<TestJob>();

    assert_eq!(pending_job_count(&pool).await?, 0);

    let job = TestJob {
        message: "hello".to_string(),
    };
    job.enqueue(&pool).await?;
    assert_eq!(pending_job_count(&pool).await?, 1);
    assert_eq!(completed_job_count(&pool).await?, 0);

    let runner = runner.start();
    runner.wait_for_shutdown().await;

    assert_eq!(pending_job_count(&pool).await?, 0);
    assert_eq!(completed_job_count(&pool).await?, 1);

    let completed = get_completed_jobs(&pool, 10).await?;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].job.job_type, "test");
    assert_compact_json_snapshot!(completed[0].job.data, @r#"{"message": "hello"}"#);

    Ok(())
}

#[tokio::test]
async fn failed_jobs_do_not_release_lock_before_updating_retry_time() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct TestContext {
        job_started_barrier: Arc<Barrier>,
    }

    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = TestContext;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
            ctx.job_started_barrier.wait().await;
            panic!();
        }
    }

    let test_context = TestContext {
        job_started_barrier: Arc::new(Barrier::new(2)),
    };

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner =
        test_utils::create_test_runner(pool.clone(), test_context.clone()).register::<TestJob>();

    TestJob.enqueue(&pool).await?;

    let runner = runner.start();
    test_context.job_started_barrier.wait().await;

    // `SKIP LOCKED` is intentionally omitted here, so we block until
    // the lock on the first job is released.
    // If there is any point where the row is unlocked, but the retry
    // count is not updated, we will get a row here.
    let available_jobs =
        sqlx::query_scalar::<_, i64>("SELECT id FROM background_jobs WHERE retries = 0 FOR UPDATE")
            .fetch_all(&pool)
            .await?;
    assert_eq!(available_jobs.len(), 0);

    // Sanity check to make sure the job actually is there
    let total_jobs_including_failed =
        sqlx::query_scalar::<_, i64>("SELECT id FROM background_jobs FOR UPDATE")
            .fetch_all(&pool)
            .await?;
    assert_eq!(total_jobs_including_failed.len(), 1);

    runner.wait_for_shutdown().await;

    Ok(())
}

#[tokio::test]
async fn panicking_in_jobs_updates_retry_counter() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
            panic!()
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner = test_utils::create_test_runner(pool.clone(), ()).register::<TestJob>();

    let job_id = assert_some!(TestJob.enqueue(&pool).await?);

    let runner = runner.start();
    runner.wait_for_shutdown().await;

    let tries =
        sqlx::query_scalar::<_, i32>("SELECT retries FROM background_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_one(&pool)
            .await?;
    assert_eq!(tries, 1);
    assert_eq!(retried_job_count(&pool).await?, 1);

    Ok(())
}

#[tokio::test]
async fn jobs_are_buried_after_exhausting_attempts() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner = Runner::new(pool.clone(), ())
        .register::<TestJob>()
        .num_workers(1)
        .max_attempts(1)
        .shutdown_when_queue_empty();

    TestJob.enqueue(&pool).await?;

    let runner = runner.start();
    runner.wait_for_shutdown().await;

    assert_eq!(pending_job_count(&pool).await?, 0);
    assert_eq!(failed_job_count(&pool).await?, 1);

    let failed = get_failed_jobs(&pool, Some("test"), None).await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].job.retries, 1);
    assert!(failed[0].error.contains("boom"));

    Ok(())
}

#[tokio::test]
async fn jobs_can_be_deduplicated() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct TestContext {
        runs: Arc<AtomicU8>,
        job_started_barrier: Arc<Barrier>,
        assertions_finished_barrier: Arc<Barrier>,
    }

    #[derive(Serialize, Deserialize)]
    struct TestJob {
        value: String,
    }

    impl TestJob {
        fn new(value: impl Into<String>) -> Self {
            let value = value.into();
            Self { value }
        }
    }

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        const DEDUPLICATED: bool = true;
        type Context = TestContext;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
            let runs = ctx.runs.fetch_add(1, Ordering::SeqCst);
            if runs == 0 {
                ctx.job_started_barrier.wait().await;
                ctx.assertions_finished_barrier.wait().await;
            }
            Ok(())
        }
    }

    let test_context = TestContext {
        runs: Arc::new(AtomicU8::new(0)),
        job_started_barrier: Arc::new(Barrier::new(2)),
        assertions_finished_barrier: Arc::new(Barrier::new(2)),
    };

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner = Runner::new(pool.clone(), test_context.clone())
        .register::<TestJob>()
        .shutdown_when_queue_empty();

    // Enqueue first job
    assert_some!(TestJob::new("foo").enqueue(&pool).await?);
    assert_compact_json_snapshot!(all_jobs(&pool).await?, @r#"[["test", {"value": "foo"}]]"#);

    // Try to enqueue the same job again, which should be deduplicated
    assert_none!(TestJob::new("foo").enqueue(&pool).await?);
    assert_compact_json_snapshot!(all_jobs(&pool).await?, @r#"[["test", {"value": "foo"}]]"#);

    // Start processing the first job
    let runner = runner.start();
    test_context.job_started_barrier.wait().await;

    // Enqueue the same job again, which should NOT be deduplicated,
    // since the first job already still running
    assert_some!(TestJob::new("foo").enqueue(&pool).await?);
    assert_compact_json_snapshot!(all_jobs(&pool).await?, @r#"[["test", {"value": "foo"}], ["test", {"value": "foo"}]]"#);

    // Try to enqueue the same job again, which should be deduplicated again
    assert_none!(TestJob::new("foo").enqueue(&pool).await?);
    assert_compact_json_snapshot!(all_jobs(&pool).await?, @r#"[["test", {"value": "foo"}], ["test", {"value": "foo"}]]"#);

    // Enqueue the same job but with different data, which should
    // NOT be deduplicated
    assert_some!(TestJob::new("bar").enqueue(&pool).await?);
    assert_compact_json_snapshot!(all_jobs(&pool).await?, @r#"[["test", {"value": "foo"}], ["test", {"value": "foo"}], ["test", {"value": "bar"}]]"#);

    // Resolve the final barrier to finish the test
    test_context.assertions_finished_barrier.wait().await;
    runner.wait_for_shutdown().await;

    Ok(())
}

#[tokio::test]
async fn high_priority_jobs_dispatch_first() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct OrderContext {
        order: Arc<Mutex<Vec<String>>>,
    }

    #[derive(Serialize, Deserialize)]
    struct OrderJob {
        tag: String,
    }

    impl BackgroundJob for OrderJob {
        const JOB_NAME: &'static str = "order";
        type Context = OrderContext;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
            ctx.order.lock().await.push(self.tag.clone());
            Ok(())
        }
    }

    let context = OrderContext {
        order: Arc::new(Mutex::new(Vec::new())),
    };

    let (pool, _container) = test_utils::setup_test_db().await?;

    let first = OrderJob {
        tag: "scheduled-1".to_string(),
    };
    let second = OrderJob {
        tag: "scheduled-2".to_string(),
    };
    let forced = OrderJob {
        tag: "forced".to_string(),
    };

    first.enqueue_with_priority(&pool, 0).await?;
    second.enqueue_with_priority(&pool, 0).await?;
    forced.enqueue_with_priority(&pool, 100).await?;

    // A single worker makes dispatch order observable.
    let runner = Runner::new(pool.clone(), context.clone())
        .register::<OrderJob>()
        .num_workers(1)
        .shutdown_when_queue_empty();

    let runner = runner.start();
    runner.wait_for_shutdown().await;

    let order = context.order.lock().await;
    assert_eq!(*order, vec!["forced", "scheduled-1", "scheduled-2"]);

    Ok(())
}

#[tokio::test]
async fn retention_keeps_only_the_newest_completions() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob {
        n: u32,
    }

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner = Runner::new(pool.clone(), ())
        .register::<TestJob>()
        .num_workers(1)
        .shutdown_when_queue_empty();

    for n in 0..5 {
        TestJob { n }.enqueue(&pool).await?;
    }

    let runner = runner.start();
    runner.wait_for_shutdown().await;
    assert_eq!(completed_job_count(&pool).await?, 5);

    // Spread the timestamps so the count cutoff is unambiguous.
    sqlx::query("UPDATE completed_jobs SET completed_at = completed_at + id * INTERVAL '1 millisecond'")
        .execute(&pool)
        .await?;

    sweep_once(ForensicsTable::Completed, RetentionPolicy::MaxCount(2), &pool).await?;
    assert_eq!(completed_job_count(&pool).await?, 2);

    sweep_once(
        ForensicsTable::Completed,
        RetentionPolicy::MaxAge(chrono::Duration::zero()),
        &pool,
    )
    .await?;
    assert_eq!(completed_job_count(&pool).await?, 0);

    Ok(())
}
