pub mod ancestry;
pub mod dedup;
mod jobs;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod state;
pub mod tasks;
pub mod throttle;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use apalis::{
    layers::retry::{
        HasherRng, RetryPolicy,
        backoff::{ExponentialBackoffMaker, MakeBackoff},
    },
    prelude::*,
};
use apalis_codec::json::JsonCodec;
use apalis_sqlite::{CompactType, SqliteStorage, fetcher::SqliteFetcher};
use ci_insights_core::config::{Config, DbConfig, WorkerConfig};
use ci_insights_db::Database;
use ci_insights_gitlab::GitLab;
pub use jobs::{
    process_build_commit_parents, process_in_progress_job, process_job_run,
    process_recalculate_test_statistics,
};
use metrics::MetricsSink;
use queue::TaskQueue;
use sqlx::{Sqlite, migrate::MigrateDatabase, sqlite::SqlitePool};
use state::ProcessingState;
use tasks::{Task, TaskDecodeError, TaskEnvelope};
use tokio_util::sync::CancellationToken;

/// Shared context available to all task handlers.
#[derive(Clone)]
pub struct JobContext {
    pub config: Arc<Config>,
    pub db: Arc<Database>,
    pub gitlab: Arc<GitLab>,
    pub queue: Arc<dyn TaskQueue>,
    pub metrics: Arc<dyn MetricsSink>,
    pub state: Arc<ProcessingState>,
    /// Cancelled on shutdown; in-flight handlers are dropped at their next await.
    pub shutdown: CancellationToken,
}

/// Type alias for the default codec used by SqliteStorage.
type DefaultCodec = JsonCodec<CompactType>;

/// Type alias for task storage.
pub type TaskStorage = SqliteStorage<TaskEnvelope, DefaultCodec, SqliteFetcher>;

/// Storage handle for pushing tasks.
#[derive(Clone)]
pub struct JobStorage {
    tasks: TaskStorage,
}

impl JobStorage {
    /// Set up task storage tables and create the storage instance.
    pub async fn setup(db: &DbConfig) -> Result<Arc<Self>> {
        if !Sqlite::database_exists(&db.jobs_url).await.unwrap_or(false) {
            tracing::info!(url = %db.jobs_url, "Creating database");
            Sqlite::create_database(&db.jobs_url).await.context("Failed to create database")?;
            tracing::info!("Database created");
        }
        let pool =
            SqlitePool::connect(&db.jobs_url).await.context("Failed to connect to database")?;
        SqliteStorage::setup(&pool).await?;
        Ok(Arc::new(Self { tasks: create_storage(&pool) }))
    }

    /// Get a clone of the task storage for pushing tasks.
    pub fn tasks(&self) -> TaskStorage { self.tasks.clone() }
}

fn create_storage<T>(pool: &SqlitePool) -> SqliteStorage<T, DefaultCodec, SqliteFetcher> {
    let config = apalis_sqlite::Config::new(std::any::type_name::<T>()).with_poll_interval(
        StrategyBuilder::new()
            .apply(
                IntervalStrategy::new(Duration::from_millis(100))
                    .with_backoff(BackoffConfig::new(Duration::from_secs(1))),
            )
            .build(),
    );
    SqliteStorage::new_with_config(pool, &config)
}

/// Create the task monitor.
pub fn create_monitor(
    storage: Arc<JobStorage>,
    context: JobContext,
    config: &WorkerConfig,
) -> Result<Monitor> {
    let &WorkerConfig { concurrency, retry_attempts } = config;

    let backoff = ExponentialBackoffMaker::new(
        Duration::from_secs(1),
        Duration::from_secs(120),
        1.25,
        HasherRng::default(),
    )
    .map_err(|e| anyhow!("Invalid retry backoff: {:?}", e))?
    .make_backoff();
    let retry_policy =
        RetryPolicy::retries(retry_attempts).with_backoff(backoff).retry_if(is_retryable);

    Ok(Monitor::new()
        .register(move |_| {
            WorkerBuilder::new("task-worker")
                .backend(storage.tasks.clone())
                .retry(retry_policy.clone())
                .enable_tracing()
                .catch_panic()
                .concurrency(concurrency)
                .data(context.clone())
                .build(process_task)
        })
        .shutdown_timeout(Duration::from_secs(30)))
}

/// Whether the worker should run a failed task again.
///
/// Aborted tasks and payloads that cannot be decoded fail the same way every time.
pub fn is_retryable(e: &BoxDynError) -> bool {
    e.downcast_ref::<AbortError>().is_none() && e.downcast_ref::<TaskDecodeError>().is_none()
}

/// Worker entry point: decode the envelope and run its handler until done or shutdown.
///
/// Decode failures are boxed as the bare [`TaskDecodeError`] rather than through
/// `anyhow`, so [`is_retryable`] can still downcast them.
pub async fn process_task(
    envelope: TaskEnvelope,
    ctx: Data<JobContext>,
) -> Result<(), BoxDynError> {
    let task = match envelope.decode() {
        Ok(task) => task,
        Err(e) => {
            tracing::error!(
                "Dropping undecodable {} task {}: {:?}",
                envelope.task_type,
                envelope.partition_key,
                e
            );
            return Err(Box::new(e));
        }
    };
    tokio::select! {
        result = handle_task(&ctx, task) => result.map_err(Into::into),
        _ = ctx.shutdown.cancelled() => {
            tracing::warn!(
                "Cancelled {} task {} on shutdown",
                envelope.task_type,
                envelope.partition_key
            );
            Err(anyhow!("Task {} cancelled", envelope.partition_key).into())
        }
    }
}

/// Dispatch a decoded task to its handler.
pub async fn handle_task(ctx: &JobContext, task: Task) -> Result<()> {
    match task {
        Task::ProcessJobRun(task) => process_job_run(ctx, &task).await,
        Task::ProcessInProgressJob(task) => process_in_progress_job(ctx, &task).await,
        Task::BuildCommitParents(task) => process_build_commit_parents(ctx, &task).await,
        Task::RecalculateTestStatistics(task) => {
            process_recalculate_test_statistics(ctx, &task).await
        }
    }
}
