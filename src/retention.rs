//! Bounded retention for the queue's forensics tables.

use std::{collections::HashMap, marker::PhantomData, time::Duration};
use tracing::{debug, error};

use sqlx::PgPool;
use tokio::task::JoinSet;

/// Marker type for a sweeper with at least one configured table
#[derive(Clone, Copy, Debug)]
pub struct Configured;

/// Marker type for a sweeper without configured tables
#[derive(Clone, Copy, Debug)]
pub struct Unconfigured;

/// Which forensics table a retention rule applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ForensicsTable {
    /// `completed_jobs`: successful runs.
    Completed,
    /// `failed_jobs`: terminally failed runs.
    Failed,
}

impl ForensicsTable {
    fn table_name(self) -> &'static str {
        match self {
            Self::Completed => "completed_jobs",
            Self::Failed => "failed_jobs",
        }
    }

    fn timestamp_column(self) -> &'static str {
        match self {
            Self::Completed => "completed_at",
            Self::Failed => "failed_at",
        }
    }
}

/// How to prune retained job rows.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RetentionPolicy {
    /// Keep all entries newer than `now - Duration`
    MaxAge(chrono::Duration),
    /// Keep at most n entries
    MaxCount(usize),
    /// Discard entries older than the `max_age` _and_ keep at most `max_count`
    Mixed {
        /// Maximum age of an entry to keep
        max_age: chrono::Duration,
        /// Maximum number of entries to keep
        max_count: usize,
    },
}

/// Configuration for pruning one forensics table.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetentionConfiguration {
    /// Interval at which to run
    pub sweep_every: Duration,
    /// How to go about pruning the table
    pub policy: RetentionPolicy,
}

/// The `RetentionSweeper` spawns a task per configured forensics table that
/// keeps the table bounded. Uses typestate to ensure you cannot start a
/// sweeper that will do nothing.
#[derive(Debug)]
pub struct RetentionSweeper<State = Unconfigured> {
    configurations: HashMap<ForensicsTable, RetentionConfiguration>,
    _state: PhantomData<State>,
}

impl RetentionSweeper {
    /// Create a new, unconfigured, `RetentionSweeper`
    pub fn new() -> RetentionSweeper<Unconfigured> {
        Self {
            configurations: HashMap::new(),
            _state: PhantomData,
        }
    }

    async fn sweep_loop(table: ForensicsTable, config: RetentionConfiguration, pool: PgPool) {
        let mut ticker = tokio::time::interval(config.sweep_every);
        // interval() fires immediately; the first sweep waits a full period.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if let Err(e) = sweep_once(table, config.policy, &pool).await {
                error!(table = table.table_name(), "Failed to prune retained jobs: {e}");
                break;
            }
            debug!(table = table.table_name(), "Pruned retained jobs");
        }
    }
}

/// Apply a retention policy to one table, once.
pub async fn sweep_once(
    table: ForensicsTable,
    policy: RetentionPolicy,
    pool: &PgPool,
) -> Result<(), sqlx::Error> {
    let name = table.table_name();
    let ts = table.timestamp_column();

    match policy {
        RetentionPolicy::MaxAge(max_age) => {
            sqlx::query(&format!(
                "DELETE FROM {name} WHERE {ts} < NOW() - $1 * INTERVAL '1 millisecond'"
            ))
            .bind(max_age.num_milliseconds())
            .execute(pool)
            .await?;
        }
        RetentionPolicy::MaxCount(count) => {
            sqlx::query(&format!(
                r"DELETE FROM {name}
                  WHERE {ts} < (SELECT {ts} FROM {name}
                                ORDER BY {ts} DESC OFFSET {offset} LIMIT 1)",
                offset = count.saturating_sub(1)
            ))
            .execute(pool)
            .await?;
        }
        RetentionPolicy::Mixed { max_age, max_count } => {
            sqlx::query(&format!(
                r"DELETE FROM {name}
                  WHERE {ts} < NOW() - $1 * INTERVAL '1 millisecond'
                     OR {ts} < (SELECT {ts} FROM {name}
                                ORDER BY {ts} DESC OFFSET {offset} LIMIT 1)",
                offset = max_count.saturating_sub(1)
            ))
            .bind(max_age.num_milliseconds())
            .execute(pool)
            .await?;
        }
    }

    Ok(())
}

impl<State> RetentionSweeper<State> {
    /// Configure the sweeper for a forensics table.
    pub fn configure(
        mut self,
        table: ForensicsTable,
        configuration: RetentionConfiguration,
    ) -> RetentionSweeper<Configured> {
        self.configurations.insert(table, configuration);

        RetentionSweeper {
            configurations: self.configurations,
            _state: PhantomData,
        }
    }
}

impl RetentionSweeper<Configured> {
    /// Start the sweeper, spawning a task for each configured table.
    /// Returns a `JoinSet` containing all spawned tasks for easy cancellation.
    pub fn run(self, pool: &PgPool) -> JoinSet<()> {
        let mut set = JoinSet::new();
        for (table, config) in self.configurations {
            set.spawn(RetentionSweeper::sweep_loop(table, config, pool.clone()));
        }
        set
    }
}
