use crate::errors::EnqueueError;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::future::Future;
use tracing::instrument;

/// Trait for defining background jobs that can be enqueued and executed asynchronously.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the task.
    ///
    /// This MUST be unique for the whole application.
    const JOB_NAME: &'static str;

    /// Default priority of the task.
    ///
    /// Higher priorities are dispatched sooner. [`Self::enqueue_with_priority`]
    /// can be used to override the value per enqueue.
    const PRIORITY: i16 = 0;

    /// Whether the job should be deduplicated.
    ///
    /// If true, the job will not be enqueued if there is already an unstarted
    /// job with the same data and priority.
    const DEDUPLICATED: bool = false;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Execute the task. This method should define its logic.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Enqueue this job for background execution.
    ///
    /// Returns the job ID if successfully enqueued, or None if deduplicated.
    fn enqueue<'a>(&'a self, pool: &'a PgPool) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
        self.enqueue_with_priority(pool, Self::PRIORITY)
    }

    /// Enqueue this job with an explicit priority.
    #[instrument(name = "queue.enqueue", skip(self, pool), fields(message = Self::JOB_NAME))]
    fn enqueue_with_priority<'a>(
        &'a self,
        pool: &'a PgPool,
        priority: i16,
    ) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
        let data = match serde_json::to_value(self) {
            Ok(data) => data,
            Err(err) => return async move { Err(EnqueueError::SerializationError(err)) }.boxed(),
        };

        if Self::DEDUPLICATED {
            enqueue_deduplicated(pool, Self::JOB_NAME, data, priority)
        } else {
            let future = enqueue_simple(pool, Self::JOB_NAME, data, priority);
            async move { Ok(Some(future.await?)) }.boxed()
        }
    }
}

/// Enqueue a job inside an open transaction.
///
/// Used by the scheduler so that taking a monitor lease and dispatching its
/// job commit or roll back together. Deduplication is skipped on purpose:
/// the lease already guarantees at most one scheduled enqueue per monitor.
pub async fn enqueue_in_transaction<J: BackgroundJob>(
    job: &J,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<i64, EnqueueError> {
    let data = serde_json::to_value(job)?;

    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO background_jobs (job_type, data, priority) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(J::JOB_NAME)
    .bind(data)
    .bind(J::PRIORITY)
    .fetch_one(&mut **tx)
    .await?;

    Ok(id)
}

fn enqueue_deduplicated<'a>(
    pool: &'a PgPool,
    job_type: &'a str,
    data: Value,
    priority: i16,
) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
    async move {
        // Try to insert only if no similar job exists (not locked)
        let result = sqlx::query_scalar::<_, Option<i64>>(
            r"
            INSERT INTO background_jobs (job_type, data, priority)
            SELECT $1, $2, $3
            WHERE NOT EXISTS (
                SELECT 1 FROM background_jobs
                WHERE job_type = $1 AND data = $2 AND priority = $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            ",
        )
        .bind(job_type)
        .bind(data)
        .bind(priority)
        .fetch_optional(pool)
        .await?;

        Ok(result.flatten())
    }
    .boxed()
}

fn enqueue_simple<'a>(
    pool: &'a PgPool,
    job_type: &'a str,
    data: Value,
    priority: i16,
) -> BoxFuture<'a, Result<i64, EnqueueError>> {
    async move {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO background_jobs (job_type, data, priority) VALUES ($1, $2, $3) RETURNING id"
        )
        .bind(job_type)
        .bind(data)
        .bind(priority)
        .fetch_one(pool)
        .await?;

        Ok(id)
    }
    .boxed()
}
