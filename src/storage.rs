//! Queue storage: locked fetch, completion, burial and counts.
//!
//! A job stays in `background_jobs` until it either completes (moved to
//! `completed_jobs`) or exhausts its attempts (moved to `failed_jobs` with
//! the final error). Both destination tables exist for operator forensics
//! only and are pruned by the retention sweeper.

use crate::schema::{BackgroundJob, CompletedJob, FailedJob};
use sqlx::{PgPool, Postgres, Transaction};

/// The number of jobs that have failed at least once and are still queued.
pub async fn retried_job_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM background_jobs WHERE retries > 0")
        .fetch_one(pool)
        .await
}

/// The number of jobs waiting in the queue.
pub async fn pending_job_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM background_jobs")
        .fetch_one(pool)
        .await
}

/// Finds the next job that is unlocked and ready to run or be retried.
///
/// Retry eligibility implements exponential backoff starting at one second:
/// a job with `retries = n` becomes eligible `2^(n-1)` seconds after its
/// last failed attempt.
pub(crate) async fn find_next_unlocked_job_tx(
    tx: &mut Transaction<'_, Postgres>,
    job_types: &[String],
) -> Result<BackgroundJob, sqlx::Error> {
    sqlx::query_as::<_, BackgroundJob>(
        r"
        SELECT id, job_type, data, retries, last_retry, created_at, priority
        FROM background_jobs
        WHERE job_type = ANY($1)
          AND (retries = 0 OR last_retry < NOW() - INTERVAL '1 second' * POWER(2, retries - 1))
        ORDER BY priority DESC, id ASC
        FOR UPDATE SKIP LOCKED
        LIMIT 1
        ",
    )
    .bind(job_types)
    .fetch_one(&mut **tx)
    .await
}

/// Records a successful run: the row moves to `completed_jobs`.
pub(crate) async fn complete_successful_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO completed_jobs (id, job_type, data, retries, last_retry, created_at, priority)
        SELECT id, job_type, data, retries, last_retry, created_at, priority
        FROM background_jobs
        WHERE id = $1
        ",
    )
    .bind(job_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM background_jobs WHERE id = $1")
        .bind(job_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Marks that we just tried and failed to run a job.
pub(crate) async fn update_failed_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE background_jobs SET retries = retries + 1, last_retry = NOW() WHERE id = $1",
    )
    .bind(job_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Buries a job that has exhausted its attempts: the row moves to
/// `failed_jobs` together with the rendered error of the final attempt.
pub(crate) async fn bury_failed_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
    error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO failed_jobs (id, job_type, data, retries, last_retry, created_at, priority, error)
        SELECT id, job_type, data, retries + 1, NOW(), created_at, priority, $2
        FROM background_jobs
        WHERE id = $1
        ",
    )
    .bind(job_id)
    .bind(error)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM background_jobs WHERE id = $1")
        .bind(job_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Terminally failed jobs for a job type, newest first.
pub async fn get_failed_jobs(
    pool: &PgPool,
    job_type: Option<&str>,
    limit: Option<i64>,
) -> Result<Vec<FailedJob>, sqlx::Error> {
    let mut query = String::from(
        "SELECT id, job_type, data, retries, last_retry, created_at, priority, error, failed_at \
         FROM failed_jobs",
    );

    if job_type.is_some() {
        query.push_str(" WHERE job_type = $1");
    }

    query.push_str(" ORDER BY failed_at DESC");

    if limit.is_some() {
        if job_type.is_some() {
            query.push_str(" LIMIT $2");
        } else {
            query.push_str(" LIMIT $1");
        }
    }

    let mut query_builder = sqlx::query_as::<_, FailedJob>(&query);

    if let Some(job_type_val) = job_type {
        query_builder = query_builder.bind(job_type_val);
    }

    if let Some(limit_val) = limit {
        query_builder = query_builder.bind(limit_val);
    }

    query_builder.fetch_all(pool).await
}

/// Recently completed jobs, newest first.
pub async fn get_completed_jobs(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<CompletedJob>, sqlx::Error> {
    sqlx::query_as::<_, CompletedJob>(
        r"
        SELECT id, job_type, data, retries, last_retry, created_at, priority, completed_at
        FROM completed_jobs
        ORDER BY completed_at DESC
        LIMIT $1
        ",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Count of terminally failed jobs.
pub async fn failed_job_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM failed_jobs")
        .fetch_one(pool)
        .await
}

/// Count of retained completed jobs.
pub async fn completed_job_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM completed_jobs")
        .fetch_one(pool)
        .await
}
