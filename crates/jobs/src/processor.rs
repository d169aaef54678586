use anyhow::{Context, Result};
use ci_insights_core::{
    config::ProcessingConfig,
    models::{FullJobInfo, JobRunInfo, JobStatus, TestReportData},
    util,
};
use ci_insights_gitlab::{
    GitLab,
    models::{Job, JobState},
    refs::BranchCache,
    trace::extract_custom_status_message,
};
use ci_insights_reports::{ArtifactsContentsInfo, extract_artifacts_contents};
use time::OffsetDateTime;

const TIMEOUT_FAILURE_REASON: &str = "job_execution_timeout";

/// What processing a job run produced. Both parts are empty for jobs that
/// have not finished yet.
#[derive(Debug, Clone, Default)]
pub struct JobProcessingResult {
    pub test_report: Option<TestReportData>,
    pub job_info: Option<FullJobInfo>,
}

/// Artifact archives are downloaded only when strictly smaller than the cap.
pub fn artifacts_eligible(declared_size: u64, max_size: u64) -> bool { declared_size < max_size }

/// Local status of a finished job; anything unrecognised counts as a failure.
pub fn job_status(job: &Job) -> JobStatus {
    match job.status {
        JobState::Success => JobStatus::Success,
        JobState::Canceled => JobStatus::Canceled,
        JobState::Failed if job.failure_reason.as_deref() == Some(TIMEOUT_FAILURE_REASON) => {
            JobStatus::Timeouted
        }
        _ => JobStatus::Failed,
    }
}

pub fn run_info(job: &Job, project_id: u64, branch_name: String) -> JobRunInfo {
    let agent_name = job
        .runner
        .as_ref()
        .and_then(|r| r.description.clone().filter(|d| !d.is_empty()).or_else(|| r.name.clone()))
        .unwrap_or_default();
    let agent_os =
        job.runner_manager.as_ref().and_then(|m| m.platform.clone()).unwrap_or_default();
    JobRunInfo {
        job_id: job.name.clone(),
        project_id,
        pipeline_id: job.pipeline.id,
        job_run_id: job.id,
        branch_name,
        agent_name,
        agent_os,
        job_url: job.web_url.clone(),
    }
}

pub(crate) fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Turns GitLab job metadata and artifacts into a normalized job record.
pub struct JobProcessor<'a> {
    gitlab: &'a GitLab,
    branches: &'a BranchCache,
    config: &'a ProcessingConfig,
}

impl<'a> JobProcessor<'a> {
    pub fn new(
        gitlab: &'a GitLab,
        branches: &'a BranchCache,
        config: &'a ProcessingConfig,
    ) -> Self {
        Self { gitlab, branches, config }
    }

    /// Process one job run, fetching its metadata unless `job` is given.
    ///
    /// Artifacts of failed and canceled jobs are only read when
    /// `process_failed_job` is set.
    pub async fn process(
        &self,
        project_id: u64,
        job_run_id: u64,
        job: Option<Job>,
        process_failed_job: bool,
    ) -> Result<JobProcessingResult> {
        let job = match job {
            Some(job) => job,
            None => self.gitlab.get_job(project_id, job_run_id).await.with_context(|| {
                format!("Failed to fetch job {} in project {}", job_run_id, project_id)
            })?,
        };
        if job.status.is_active() {
            tracing::info!(
                "Job {} in project {} is still {:?}, nothing to process",
                job.id,
                project_id,
                job.status
            );
            return Ok(JobProcessingResult::default());
        }

        let state = job_status(&job);
        let contents = if state == JobStatus::Success || process_failed_job {
            self.read_artifacts(project_id, &job).await?
        } else {
            tracing::debug!(
                "Skipping artifacts of {} job {} in project {}",
                state,
                job.id,
                project_id
            );
            ArtifactsContentsInfo::default()
        };
        let branch_name =
            self.branches.resolve(self.gitlab, project_id, &job.ref_name).await.with_context(
                || format!("Failed to resolve ref {} in project {}", job.ref_name, project_id),
            )?;
        let custom_status_message = self.custom_status_message(project_id, job.id).await?;

        let counters = contents.test_report.as_ref().map(|r| r.counters).unwrap_or_default();
        let duration_ms = job.duration.map(|secs| (secs * 1000.0).round() as u64).unwrap_or(0);
        let job_info = FullJobInfo {
            run: run_info(&job, project_id, branch_name),
            state,
            duration_ms,
            started_at: job.started_at,
            ended_at: job.finished_at,
            triggered_by: job.user.as_ref().map(|u| u.username.clone()),
            pipeline_source: job.pipeline.source.clone(),
            commit_sha: job.commit.id.clone(),
            commit_message: non_empty(&job.commit.message),
            commit_author: non_empty(&job.commit.author_name),
            counters,
            custom_status_message,
            has_code_quality_report: contents.has_code_quality_report,
            changes_since_last_run: vec![],
        };
        Ok(JobProcessingResult { test_report: contents.test_report, job_info: Some(job_info) })
    }

    async fn read_artifacts(&self, project_id: u64, job: &Job) -> Result<ArtifactsContentsInfo> {
        let Some(size) = job.artifacts_archive_size() else {
            tracing::debug!("Job {} in project {} has no artifacts", job.id, project_id);
            return Ok(ArtifactsContentsInfo::default());
        };
        if !artifacts_eligible(size, self.config.max_artifact_size) {
            tracing::info!(
                "Skipping artifacts of job {} in project {}: {} exceeds the {} limit",
                job.id,
                project_id,
                util::size(size),
                util::size(self.config.max_artifact_size)
            );
            return Ok(ArtifactsContentsInfo::default());
        }
        let Some(bytes) =
            self.gitlab.get_job_artifacts(project_id, job.id).await.with_context(|| {
                format!("Failed to download artifacts of job {} in project {}", job.id, project_id)
            })?
        else {
            tracing::debug!("Artifacts of job {} in project {} are gone", job.id, project_id);
            return Ok(ArtifactsContentsInfo::default());
        };
        let fallback_start_time =
            job.started_at.or(job.created_at).unwrap_or_else(OffsetDateTime::now_utc);
        let result = tokio::task::spawn_blocking(move || {
            extract_artifacts_contents(&bytes, fallback_start_time)
        })
        .await
        .context("Artifact parsing task failed")?;
        match result {
            Ok(contents) => {
                if let Some(report) = &contents.test_report {
                    tracing::info!(
                        "Read {} tests ({} failed) from artifacts of job {} in project {}",
                        report.counters.total,
                        report.counters.failed,
                        job.id,
                        project_id
                    );
                }
                Ok(contents)
            }
            Err(e) => {
                tracing::warn!(
                    "Unreadable artifacts of job {} in project {}: {:?}",
                    job.id,
                    project_id,
                    e
                );
                Ok(ArtifactsContentsInfo::default())
            }
        }
    }

    async fn custom_status_message(&self, project_id: u64, job_id: u64) -> Result<Option<String>> {
        match self.gitlab.get_job_trace(project_id, job_id).await {
            Ok(trace) => Ok(extract_custom_status_message(&trace)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e).with_context(|| {
                format!("Failed to fetch trace of job {} in project {}", job_id, project_id)
            }),
        }
    }
}
