use std::sync::Arc;

use anyhow::Context;
use ci_insights_core::config::Config;
use ci_insights_db::Database;
use ci_insights_gitlab::GitLab;
use ci_insights_jobs::{
    JobContext, JobStorage, create_monitor, metrics::TracingMetrics, state::ProcessingState,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let config = Arc::new(Config::load().expect("Failed to load config"));
    let db = Arc::new(Database::new(&config.db).await.expect("Failed to open database"));
    let gitlab = Arc::new(GitLab::new(&config.gitlab).expect("Failed to create GitLab client"));
    let jobs = JobStorage::setup(&config.db).await.expect("Failed to set up job storage");

    let shutdown = CancellationToken::new();
    let job_context = JobContext {
        config: config.clone(),
        db: db.clone(),
        gitlab,
        queue: jobs.clone(),
        metrics: Arc::new(TracingMetrics),
        state: Arc::new(ProcessingState::new(&config.processing)),
        shutdown: shutdown.clone(),
    };
    let monitor =
        create_monitor(jobs, job_context, &config.worker).expect("Failed to create job monitor");
    tracing::info!(
        "Job monitor: {} workers, {} retries",
        config.worker.concurrency,
        config.worker.retry_attempts
    );

    // Cancel in-flight handlers as soon as the signal arrives; the monitor
    // then drains its workers
    let signal = async move {
        let result = shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
        result
    };
    if let Err(e) = monitor.run_with_signal(signal).await.context("Job monitor error") {
        tracing::error!("{e:?}");
    }
    tracing::info!("Job monitor stopped");

    db.close().await;
    tracing::info!("Shut down gracefully");
}

/// Shutdown signal that returns io::Result for apalis compatibility.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}
