use linkwatch::Runner;
use linkwatch::api::{self, AppState};
use linkwatch::config::Config;
use linkwatch::history::HistorySinks;
use linkwatch::jobs::{AppContext, HealthCheckJob};
use linkwatch::probe::ProbeEngine;
use linkwatch::retention::{
    ForensicsTable, RetentionConfiguration, RetentionPolicy, RetentionSweeper,
};
use linkwatch::scheduler::Scheduler;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const RETENTION_SWEEP_EVERY: Duration = Duration::from_secs(600);
const COMPLETED_JOBS_RETAINED: usize = 1000;
const FAILED_JOBS_RETAINED: usize = 5000;

fn init_logging(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("{default_filter},sqlx=warn"))),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config.log_level);

    let _sentry_guard = config.sentry_dsn.as_ref().map(|dsn| {
        sentry::init((
            dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    info!(
        api = config.run_api,
        scheduler = config.run_scheduler,
        worker = config.run_worker,
        "Starting linkwatch"
    );

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let probe = Arc::new(ProbeEngine::new(
        Duration::from_millis(config.check_timeout_ms),
        config.degraded_threshold_ms,
    )?);
    let history = Arc::new(HistorySinks::new(
        reqwest::Client::new(),
        config.convex_url_dev.as_deref(),
        config.convex_url_prod.as_deref(),
        config.monitoring_shared_secret.clone(),
    ));
    let context = AppContext {
        pool: pool.clone(),
        probe,
        history,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, draining…");
        let _ = shutdown_tx.send(true);
    });

    let scheduler_handle = config.run_scheduler.then(|| {
        Scheduler::new(
            pool.clone(),
            Duration::from_millis(config.scheduler_interval_ms),
            config.scheduler_batch_size,
            config.lock_duration_ms,
        )
        .spawn(shutdown_rx.clone())
    });

    let (worker_handle, retention_tasks) = if config.run_worker {
        let runner = Runner::new(pool.clone(), context)
            .register::<HealthCheckJob>()
            .num_workers(config.worker_concurrency)
            .rate_limit(
                config.queue_rate_limit_max,
                Duration::from_millis(config.queue_rate_limit_duration_ms),
            );
        let handle = runner.start();

        let sweeper = RetentionSweeper::new()
            .configure(
                ForensicsTable::Completed,
                RetentionConfiguration {
                    sweep_every: RETENTION_SWEEP_EVERY,
                    policy: RetentionPolicy::MaxCount(COMPLETED_JOBS_RETAINED),
                },
            )
            .configure(
                ForensicsTable::Failed,
                RetentionConfiguration {
                    sweep_every: RETENTION_SWEEP_EVERY,
                    policy: RetentionPolicy::MaxCount(FAILED_JOBS_RETAINED),
                },
            )
            .run(&pool);

        (Some(handle), Some(sweeper))
    } else {
        (None, None)
    };

    let api_handle = if config.run_api {
        let state = AppState {
            pool: pool.clone(),
            api_secret: config.monitoring_api_secret.clone(),
            strict_auth: config.is_production(),
        };
        let router = api::router(state);
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
        info!(port = config.port, "Admin API listening");

        let mut api_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = api_shutdown.changed().await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("Admin API server error: {e}");
            }
        }))
    } else {
        None
    };

    let mut wait_for_shutdown = shutdown_rx.clone();
    let _ = wait_for_shutdown.changed().await;

    // Drain order: stop pulling new jobs first, let the scheduler finish its
    // tick, then let the API connections close.
    if let Some(handle) = worker_handle {
        handle.stop();
        handle.wait_for_shutdown().await;
    }
    if let Some(handle) = scheduler_handle {
        let _ = handle.await;
    }
    if let Some(mut tasks) = retention_tasks {
        tasks.shutdown().await;
    }
    if let Some(handle) = api_handle {
        let _ = handle.await;
    }

    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}
