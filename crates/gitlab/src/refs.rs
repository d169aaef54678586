use std::sync::OnceLock;

use moka::future::Cache;
use regex::Regex;

use crate::{GitLab, GitLabError};

/// IID of the merge request behind a `refs/merge-requests/<iid>/head` ref.
pub fn merge_request_iid(ref_name: &str) -> Option<u64> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| Regex::new(r"^refs/merge-requests/(\d+)/head$").unwrap());
    regex.captures(ref_name)?.get(1)?.as_str().parse().ok()
}

/// Process-wide cache of merge-request refs resolved to their source branch.
///
/// Unbounded: refs are few per deployment lifetime.
#[derive(Clone)]
pub struct BranchCache {
    branches: Cache<(u64, String), String>,
}

impl Default for BranchCache {
    fn default() -> Self { Self::new() }
}

impl BranchCache {
    pub fn new() -> Self { Self { branches: Cache::builder().build() } }

    /// Resolve a job ref to a branch name, looking up merge-request refs upstream.
    pub async fn resolve(
        &self,
        gitlab: &GitLab,
        project_id: u64,
        ref_name: &str,
    ) -> Result<String, GitLabError> {
        let Some(iid) = merge_request_iid(ref_name) else {
            return Ok(ref_name.to_string());
        };
        let key = (project_id, ref_name.to_string());
        if let Some(branch) = self.branches.get(&key).await {
            return Ok(branch);
        }
        let merge_request = gitlab.get_merge_request(project_id, iid).await?;
        tracing::debug!(
            "Resolved {} in project {} to branch {}",
            ref_name,
            project_id,
            merge_request.source_branch
        );
        self.branches.insert(key, merge_request.source_branch.clone()).await;
        Ok(merge_request.source_branch)
    }
}
