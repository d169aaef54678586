use std::time::Instant;

use anyhow::{Context, Result};
use ci_insights_core::models::JobStatus;
use ci_insights_gitlab::is_forbidden;
use time::OffsetDateTime;

use crate::{
    JobContext,
    ancestry::build_commit_parents,
    metrics::{MetricPoint, emit},
    processor::JobProcessor,
    tasks::{ProcessJobRunTask, RecalculateTestStatisticsTask, Task},
};

enum Outcome {
    Stored { job_id: String, state: JobStatus, tests: u32 },
    AlreadyStored,
    StillActive,
}

/// Ingest a finished job run: its metadata, test results and commit changes.
///
/// A job that is inaccessible upstream (403) is skipped without error; any
/// other failure is returned so the queue retries the task.
pub async fn process_job_run(ctx: &JobContext, task: &ProcessJobRunTask) -> Result<()> {
    let start = Instant::now();
    let result = store_job_run(ctx, task).await;
    let elapsed_ms = start.elapsed().as_millis() as f64;

    let (job_id, state, outcome) = match &result {
        Ok(Outcome::Stored { job_id, state, .. }) => (job_id.as_str(), state.as_str(), "stored"),
        Ok(Outcome::AlreadyStored) => ("", "", "duplicate"),
        Ok(Outcome::StillActive) => ("", "", "active"),
        Err(e) if is_forbidden(e) => ("", "", "forbidden"),
        Err(_) => ("", "", "error"),
    };
    emit(
        ctx.metrics.as_ref(),
        MetricPoint::new("job_run.processed", elapsed_ms)
            .tag("project", task.project_id)
            .tag("job", job_id)
            .tag("state", state)
            .tag("outcome", outcome),
    );
    if let Ok(Outcome::Stored { job_id, tests, .. }) = &result {
        emit(
            ctx.metrics.as_ref(),
            MetricPoint::new("job_run.tests", *tests as f64)
                .tag("project", task.project_id)
                .tag("job", job_id),
        );
    }

    match result {
        Ok(_) => Ok(()),
        Err(e) if is_forbidden(&e) => {
            tracing::info!(
                "Job run {} in project {} is not accessible, skipping",
                task.job_run_id,
                task.project_id
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(
                "Failed to process job run {} in project {}: {:?}",
                task.job_run_id,
                task.project_id,
                e
            );
            Err(e)
        }
    }
}

async fn store_job_run(ctx: &JobContext, task: &ProcessJobRunTask) -> Result<Outcome> {
    let &ProcessJobRunTask { project_id, job_run_id } = task;
    if ctx.db.job_run_exists(job_run_id).await.context("Failed to check job run")? {
        tracing::info!("Job run {} in project {} already processed", job_run_id, project_id);
        return Ok(Outcome::AlreadyStored);
    }

    let job = ctx.gitlab.get_job(project_id, job_run_id).await.with_context(|| {
        format!("Failed to fetch job {} in project {}", job_run_id, project_id)
    })?;
    if job.status.is_active() {
        tracing::info!(
            "Job run {} in project {} is still {:?}, skipping",
            job_run_id,
            project_id,
            job.status
        );
        return Ok(Outcome::StillActive);
    }

    build_commit_parents(ctx, project_id, &job.commit.id).await?;
    let process_failed_job =
        ctx.db.has_job_type(project_id, &job.name).await.context("Failed to check job type")?;

    let processor = JobProcessor::new(&ctx.gitlab, &ctx.state.branches, &ctx.config.processing);
    let result = processor.process(project_id, job_run_id, Some(job), process_failed_job).await?;
    let Some(mut job_info) = result.job_info else {
        return Ok(Outcome::StillActive);
    };
    job_info.changes_since_last_run = ctx
        .db
        .get_commit_changes(
            project_id,
            &job_info.commit_sha,
            &job_info.run.job_id,
            &job_info.run.branch_name,
        )
        .await
        .context("Failed to fetch commit changes")?;

    if let Some(report) = &result.test_report {
        ctx.db
            .insert_test_runs(&job_info.run, &report.runs)
            .await
            .context("Failed to insert test runs")?;
    }
    if !ctx.db.insert_job_run(&job_info).await.context("Failed to insert job run")? {
        tracing::info!("Job run {} in project {} stored concurrently", job_run_id, project_id);
        return Ok(Outcome::AlreadyStored);
    }
    tracing::info!(
        "Stored job run {} ({}) in project {}: {} on {}, {} tests ({} failed)",
        job_run_id,
        job_info.run.job_id,
        project_id,
        job_info.state,
        job_info.run.branch_name,
        job_info.counters.total,
        job_info.counters.failed
    );

    let run = &job_info.run;
    let now = OffsetDateTime::now_utc();
    if ctx.state.recalculate.should_enqueue(project_id, &run.job_id, now).await {
        ctx.queue
            .enqueue(Task::RecalculateTestStatistics(RecalculateTestStatisticsTask {
                project_id,
                job_id: run.job_id.clone(),
                branch_name: run.branch_name.clone(),
            }))
            .await
            .context("Failed to enqueue statistics recalculation")?;
    }

    Ok(Outcome::Stored {
        job_id: job_info.run.job_id,
        state: job_info.state,
        tests: job_info.counters.total,
    })
}
