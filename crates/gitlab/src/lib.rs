mod error;
pub mod models;
pub mod refs;
pub mod trace;

use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use ci_insights_core::config::GitLabConfig;
pub use error::{GitLabError, is_forbidden};
use models::{Job, MergeRequest, RepositoryCommit};
use reqwest::{
    StatusCode,
    header::{HeaderMap, HeaderValue},
};
use serde::de::DeserializeOwned;

const USER_AGENT: &str = concat!("ci-insights/", env!("CARGO_PKG_VERSION"));
const MAX_PAGE_SIZE: usize = 100;

/// Client for the parts of the GitLab REST v4 API the pipeline needs.
#[derive(Clone)]
pub struct GitLab {
    client: reqwest::Client,
    api_url: String,
}

impl GitLab {
    pub fn new(config: &GitLabConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut token =
            HeaderValue::from_str(&config.token).context("GitLab token is not a valid header")?;
        token.set_sensitive(true);
        headers.insert("PRIVATE-TOKEN", token);
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create GitLab client")?;
        let api_url = format!("{}/api/v4", config.url.as_str().trim_end_matches('/'));
        Ok(Self { client, api_url })
    }

    pub async fn get_job(&self, project_id: u64, job_id: u64) -> Result<Job, GitLabError> {
        self.get_json(&format!("projects/{project_id}/jobs/{job_id}"), &[]).await
    }

    /// Download the job's artifacts archive; `None` when the job has none.
    pub async fn get_job_artifacts(
        &self,
        project_id: u64,
        job_id: u64,
    ) -> Result<Option<Bytes>, GitLabError> {
        match self.get(&format!("projects/{project_id}/jobs/{job_id}/artifacts"), &[]).await {
            Ok(response) => Ok(Some(response.bytes().await?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn get_job_trace(&self, project_id: u64, job_id: u64) -> Result<String, GitLabError> {
        let response = self.get(&format!("projects/{project_id}/jobs/{job_id}/trace"), &[]).await?;
        Ok(response.text().await?)
    }

    /// Up to `limit` commits reachable from `sha`, most recent first.
    pub async fn get_commit_history(
        &self,
        project_id: u64,
        sha: &str,
        limit: usize,
    ) -> Result<Vec<RepositoryCommit>, GitLabError> {
        let per_page = limit.clamp(1, MAX_PAGE_SIZE);
        let per_page_param = per_page.to_string();
        let mut commits = Vec::with_capacity(limit);
        let mut page = 1u32;
        while commits.len() < limit {
            let page_param = page.to_string();
            let items: Vec<RepositoryCommit> = self
                .get_json(&format!("projects/{project_id}/repository/commits"), &[
                    ("ref_name", sha),
                    ("per_page", per_page_param.as_str()),
                    ("page", page_param.as_str()),
                ])
                .await?;
            let last_page = items.len() < per_page;
            commits.extend(items);
            if last_page {
                break;
            }
            page += 1;
        }
        commits.truncate(limit);
        Ok(commits)
    }

    pub async fn get_merge_request(
        &self,
        project_id: u64,
        iid: u64,
    ) -> Result<MergeRequest, GitLabError> {
        self.get_json(&format!("projects/{project_id}/merge_requests/{iid}"), &[]).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, GitLabError> {
        Ok(self.get(path, query).await?.json().await?)
    }

    async fn get(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response, GitLabError> {
        let url = format!("{}/{}", self.api_url, path);
        tracing::debug!("GET {}", url);
        let response = self.client.get(&url).query(query).send().await?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::FORBIDDEN => Err(GitLabError::Forbidden { url }),
            StatusCode::NOT_FOUND => Err(GitLabError::NotFound { url }),
            status => Err(GitLabError::Status { status, url }),
        }
    }
}
