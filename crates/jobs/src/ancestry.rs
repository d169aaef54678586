use std::collections::HashSet;

use anyhow::{Context, Result};
use ci_insights_core::{
    models::{BranchType, CommitParentsEntry},
    util::message_preview,
};
use ci_insights_gitlab::models::RepositoryCommit;

use crate::JobContext;

/// Label each commit of a most-recent-first history as main line or side branch.
///
/// Heuristic: a commit is on the main line unless only a merged-in side branch
/// reached it so far. A main-line commit's first parent stays on the main line
/// and its other parents start side branches; every parent of a side commit is
/// a side commit.
pub fn classify_commits(
    project_id: u64,
    commit_sha: &str,
    commits: &[RepositoryCommit],
    preview_length: usize,
) -> Vec<CommitParentsEntry> {
    let mut main_commits = HashSet::<&str>::new();
    let mut side_commits = HashSet::<&str>::new();
    let mut entries = Vec::with_capacity(commits.len());
    for (depth, commit) in commits.iter().enumerate() {
        let id = commit.id.as_str();
        let branch_type = if side_commits.contains(id) && !main_commits.contains(id) {
            BranchType::Side
        } else {
            BranchType::Main
        };
        match branch_type {
            BranchType::Main => {
                if let Some((first, rest)) = commit.parent_ids.split_first() {
                    side_commits.remove(first.as_str());
                    main_commits.insert(first.as_str());
                    side_commits.extend(rest.iter().map(String::as_str));
                }
            }
            BranchType::Side => side_commits.extend(commit.parent_ids.iter().map(String::as_str)),
        }
        entries.push(CommitParentsEntry {
            project_id,
            commit_sha: commit_sha.to_string(),
            parent_commit_sha: commit.id.clone(),
            depth: depth as u32,
            author_name: commit.author_name.clone(),
            author_email: commit.author_email.clone(),
            message_preview: message_preview(&commit.message, preview_length),
            branch_type,
        });
    }
    entries
}

/// Resolve and store the ancestry of a commit once per (project, commit).
pub async fn build_commit_parents(
    ctx: &JobContext,
    project_id: u64,
    commit_sha: &str,
) -> Result<()> {
    let keys = &ctx.state.commit_parents;
    let key = (project_id, commit_sha.to_string());
    if keys.contains(&key) {
        return Ok(());
    }
    let _permit = keys.lock(&key).await.context("Failed to lock commit")?;
    if keys.contains(&key) {
        return Ok(());
    }
    if ctx
        .db
        .commit_parents_exist(project_id, commit_sha)
        .await
        .context("Failed to check commit parents")?
    {
        keys.mark_processed(key).await;
        return Ok(());
    }

    let processing = &ctx.config.processing;
    let commits = ctx
        .gitlab
        .get_commit_history(project_id, commit_sha, processing.commit_history_limit)
        .await
        .with_context(|| {
            format!("Failed to fetch history of {} in project {}", commit_sha, project_id)
        })?;
    if commits.is_empty() {
        tracing::warn!("No history found for {} in project {}", commit_sha, project_id);
        return Ok(());
    }
    let entries =
        classify_commits(project_id, commit_sha, &commits, processing.message_preview_length);
    ctx.db.insert_commit_parents(&entries).await.context("Failed to insert commit parents")?;
    tracing::info!(
        "Stored {} ancestors of {} in project {}",
        entries.len(),
        commit_sha,
        project_id
    );
    keys.mark_processed(key).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(id: &str, parents: &[&str]) -> RepositoryCommit {
        RepositoryCommit {
            id: id.to_string(),
            parent_ids: parents.iter().map(|p| p.to_string()).collect(),
            author_name: "Dev".to_string(),
            author_email: "dev@example.com".to_string(),
            message: format!("Commit {id}\n\nDetails"),
        }
    }

    fn labels(entries: &[CommitParentsEntry]) -> Vec<(&str, BranchType)> {
        entries.iter().map(|e| (e.parent_commit_sha.as_str(), e.branch_type)).collect()
    }

    #[test]
    fn test_linear_history_is_main() {
        let commits = [commit("c", &["b"]), commit("b", &["a"]), commit("a", &[])];
        let entries = classify_commits(1, "c", &commits, 100);
        assert_eq!(labels(&entries), [
            ("c", BranchType::Main),
            ("b", BranchType::Main),
            ("a", BranchType::Main)
        ]);
        assert_eq!(entries[1].depth, 1);
        assert_eq!(entries[1].commit_sha, "c");
        assert_eq!(entries[1].message_preview, "Commit b");
    }

    #[test]
    fn test_merged_branch_is_side() {
        // m merges feature commits f2 <- f1 into main line b <- a
        let commits = [
            commit("m", &["b", "f2"]),
            commit("f2", &["f1"]),
            commit("b", &["a"]),
            commit("f1", &["a"]),
            commit("a", &[]),
        ];
        let entries = classify_commits(1, "m", &commits, 100);
        assert_eq!(labels(&entries), [
            ("m", BranchType::Main),
            ("f2", BranchType::Side),
            ("b", BranchType::Main),
            ("f1", BranchType::Side),
            ("a", BranchType::Main),
        ]);
    }

    #[test]
    fn test_side_parent_reached_from_main_line() {
        // The side branch forked from b; b stays on the main line
        let commits = [
            commit("m", &["b", "f1"]),
            commit("f1", &["b"]),
            commit("b", &["a"]),
            commit("a", &[]),
        ];
        let entries = classify_commits(1, "m", &commits, 100);
        assert_eq!(labels(&entries), [
            ("m", BranchType::Main),
            ("f1", BranchType::Side),
            ("b", BranchType::Main),
            ("a", BranchType::Main),
        ]);
    }

    #[test]
    fn test_preview_length() {
        let entries = classify_commits(1, "c", &[commit("c", &[])], 4);
        assert_eq!(entries[0].message_preview, "Comm");
    }
}
