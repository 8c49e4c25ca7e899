use crate::BackgroundJob;
use crate::job_registry::JobRegistry;
use crate::rate_limit::RateLimiter;
use crate::worker::Worker;
use futures_util::future::join_all;
use sqlx::PgPool;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_MAX_ATTEMPTS: i32 = 3;
const DEFAULT_RATE_LIMIT_MAX: u32 = 100;
const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_millis(1000);

/// Marker type for a runner with at least one registered job type
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for a runner without registered job types
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// The worker-pool runner: drains the queue with a configurable number of
/// concurrent workers under a shared dispatch rate limit.
pub struct Runner<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    connection_pool: PgPool,
    job_registry: JobRegistry<Context>,
    context: Context,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    max_attempts: i32,
    rate_limit_max: u32,
    rate_limit_window: Duration,
    shutdown_when_queue_empty: bool,
    _state: PhantomData<State>,
}

impl<Context: std::fmt::Debug + Clone + Sync + Send, State: std::fmt::Debug> std::fmt::Debug
    for Runner<Context, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("job_types", &self.job_registry.job_types())
            .field("context", &self.context)
            .field("num_workers", &self.num_workers)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given connection pool and context.
    pub fn new(connection_pool: PgPool, context: Context) -> Self {
        Self {
            connection_pool,
            job_registry: JobRegistry::default(),
            context,
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            rate_limit_max: DEFAULT_RATE_LIMIT_MAX,
            rate_limit_window: DEFAULT_RATE_LIMIT_WINDOW,
            shutdown_when_queue_empty: false,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Runner<Context, State> {
    /// Configure a job type to run on this runner's queue.
    pub fn register<J: BackgroundJob<Context = Context>>(mut self) -> Runner<Context, Configured> {
        self.job_registry.register::<J>();

        Runner {
            connection_pool: self.connection_pool,
            job_registry: self.job_registry,
            context: self.context,
            num_workers: self.num_workers,
            poll_interval: self.poll_interval,
            jitter: self.jitter,
            max_attempts: self.max_attempts,
            rate_limit_max: self.rate_limit_max,
            rate_limit_window: self.rate_limit_window,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            _state: PhantomData,
        }
    }

    /// Set the number of concurrent workers.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }

    /// Set how often workers poll for new jobs when the queue is empty.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the total number of attempts before a job is buried.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Cap dispatches across all workers at `max` per `window`.
    pub fn rate_limit(mut self, max: u32, window: Duration) -> Self {
        self.rate_limit_max = max;
        self.rate_limit_window = window;
        self
    }

    /// Set the runner to shut down when the background job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context, Configured> {
    /// Start the background workers.
    ///
    /// This returns a [`RunHandle`] which can be used to stop the pool and
    /// wait for the workers to shut down.
    pub fn start(&self) -> RunHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let rate_limiter = Arc::new(RateLimiter::new(
            self.rate_limit_max,
            self.rate_limit_window,
        ));
        let job_registry = Arc::new(self.job_registry.clone());

        let mut handles = Vec::new();
        for i in 1..=self.num_workers {
            let name = format!("background-worker-{i}");
            info!(worker.name = %name, "Starting worker…");

            let worker = Worker {
                connection_pool: self.connection_pool.clone(),
                context: self.context.clone(),
                job_registry: job_registry.clone(),
                rate_limiter: rate_limiter.clone(),
                shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                max_attempts: self.max_attempts,
                poll_interval: self.poll_interval,
                jitter: self.jitter,
            };

            let stop_rx = stop_rx.clone();
            let span = info_span!("worker", worker.name = %name);
            let handle = tokio::spawn(async move { worker.run(stop_rx).instrument(span).await });

            handles.push(handle);
        }

        RunHandle {
            handles,
            stop: stop_tx,
        }
    }
}

/// Handle to a running worker pool.
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
    stop: watch::Sender<bool>,
}

impl RunHandle {
    /// Signal all workers to stop fetching new jobs.
    ///
    /// In-flight jobs finish under their own deadlines.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Wait for all background workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });
    }
}
