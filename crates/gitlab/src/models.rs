//! Subset of the GitLab REST v4 payloads the ingestion pipeline reads.

use serde::Deserialize;
use time::OffsetDateTime;

/// Archive name GitLab gives the downloadable artifacts bundle.
pub const ARTIFACTS_ARCHIVE: &str = "artifacts.zip";

#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Pending,
    Preparing,
    WaitingForResource,
    Running,
    Success,
    Failed,
    Canceling,
    Canceled,
    Skipped,
    Manual,
    Scheduled,
    #[serde(other)]
    Unknown,
}

impl JobState {
    /// The job has not reached a final state yet.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Created
                | Self::Pending
                | Self::Preparing
                | Self::WaitingForResource
                | Self::Running
                | Self::Canceling
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: u64,
    pub name: String,
    pub status: JobState,
    #[serde(rename = "ref")]
    pub ref_name: String,
    #[serde(default)]
    pub tag: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    /// Seconds.
    pub duration: Option<f64>,
    pub failure_reason: Option<String>,
    pub web_url: String,
    pub user: Option<User>,
    pub commit: JobCommit,
    pub pipeline: JobPipeline,
    #[serde(default)]
    pub artifacts: Vec<JobArtifact>,
    pub artifacts_file: Option<ArtifactsFile>,
    pub runner: Option<Runner>,
    pub runner_manager: Option<RunnerManager>,
}

impl Job {
    /// Declared size of the downloadable artifacts archive, if the job has one.
    pub fn artifacts_archive_size(&self) -> Option<u64> {
        self.artifacts
            .iter()
            .find(|a| a.filename == ARTIFACTS_ARCHIVE)
            .map(|a| a.size)
            .or_else(|| {
                self.artifacts_file
                    .as_ref()
                    .filter(|f| f.filename == ARTIFACTS_ARCHIVE)
                    .map(|f| f.size)
            })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobCommit {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub author_email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobPipeline {
    pub id: u64,
    pub project_id: u64,
    pub sha: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobArtifact {
    pub file_type: String,
    pub size: u64,
    pub filename: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactsFile {
    pub filename: String,
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Runner {
    pub id: u64,
    pub description: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerManager {
    pub platform: Option<String>,
    pub architecture: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryCommit {
    pub id: String,
    #[serde(default)]
    pub parent_ids: Vec<String>,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub author_email: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeRequest {
    pub iid: u64,
    pub source_branch: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_job_state() {
        let state: JobState = serde_json::from_str("\"some_new_state\"").unwrap();
        assert_eq!(state, JobState::Unknown);
        let state: JobState = serde_json::from_str("\"waiting_for_resource\"").unwrap();
        assert_eq!(state, JobState::WaitingForResource);
    }

    #[test]
    fn test_artifacts_archive_size() {
        let job: Job = serde_json::from_value(serde_json::json!({
            "id": 7,
            "name": "test",
            "status": "success",
            "ref": "main",
            "web_url": "https://gitlab.example.com/g/p/-/jobs/7",
            "commit": { "id": "abc" },
            "pipeline": { "id": 3, "project_id": 1 },
            "artifacts": [
                { "file_type": "trace", "size": 1000, "filename": "job.log" },
                { "file_type": "archive", "size": 2048, "filename": "artifacts.zip" }
            ]
        }))
        .unwrap();
        assert_eq!(job.artifacts_archive_size(), Some(2048));
        assert!(job.started_at.is_none());
    }
}
