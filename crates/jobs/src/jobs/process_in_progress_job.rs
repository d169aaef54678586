use anyhow::{Context, Result};
use ci_insights_core::models::InProgressJobInfo;
use ci_insights_gitlab::models::JobState;

use crate::{
    JobContext,
    ancestry::build_commit_parents,
    processor::{non_empty, run_info},
    tasks::ProcessInProgressJobTask,
};

/// Record a snapshot of a running job for "currently running" views.
pub async fn process_in_progress_job(
    ctx: &JobContext,
    task: &ProcessInProgressJobTask,
) -> Result<()> {
    let &ProcessInProgressJobTask { project_id, job_run_id } = task;
    let keys = &ctx.state.in_progress_jobs;
    let key = (project_id, job_run_id);
    if keys.contains(&key) {
        return Ok(());
    }
    let _permit = keys.lock(&key).await.context("Failed to lock job run")?;
    if keys.contains(&key) {
        return Ok(());
    }

    let job = match ctx.gitlab.get_job(project_id, job_run_id).await {
        Ok(job) => job,
        Err(e) if e.is_forbidden() => {
            tracing::info!(
                "Job run {} in project {} is not accessible, skipping",
                job_run_id,
                project_id
            );
            keys.mark_processed(key).await;
            return Ok(());
        }
        Err(e) => {
            return Err(e).with_context(|| {
                format!("Failed to fetch job {} in project {}", job_run_id, project_id)
            });
        }
    };
    if job.status != JobState::Running {
        tracing::debug!(
            "Job run {} in project {} is {:?}, not running",
            job_run_id,
            project_id,
            job.status
        );
        keys.mark_processed(key).await;
        return Ok(());
    }
    if ctx.db.in_progress_job_exists(job_run_id).await.context("Failed to check job run")? {
        keys.mark_processed(key).await;
        return Ok(());
    }

    // Changes are read from the stored ancestry
    build_commit_parents(ctx, project_id, &job.commit.id).await?;
    let branch_name =
        ctx.state.branches.resolve(&ctx.gitlab, project_id, &job.ref_name).await.with_context(
            || format!("Failed to resolve ref {} in project {}", job.ref_name, project_id),
        )?;
    let changes_since_last_run = ctx
        .db
        .get_commit_changes(project_id, &job.commit.id, &job.name, &branch_name)
        .await
        .context("Failed to fetch commit changes")?;

    let info = InProgressJobInfo {
        run: run_info(&job, project_id, branch_name),
        started_at: job.started_at,
        triggered_by: job.user.as_ref().map(|u| u.username.clone()),
        pipeline_source: job.pipeline.source.clone(),
        commit_sha: job.commit.id.clone(),
        commit_message: non_empty(&job.commit.message),
        commit_author: non_empty(&job.commit.author_name),
        changes_since_last_run,
    };
    ctx.db.insert_in_progress_job(&info).await.context("Failed to insert in-progress job")?;
    tracing::info!(
        "Recorded running job {} ({}) in project {}",
        job_run_id,
        info.run.job_id,
        project_id
    );
    keys.mark_processed(key).await;
    Ok(())
}
