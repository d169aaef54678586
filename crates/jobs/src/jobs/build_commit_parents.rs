use anyhow::Result;

use crate::{JobContext, ancestry::build_commit_parents, tasks::BuildCommitParentsTask};

pub async fn process_build_commit_parents(
    ctx: &JobContext,
    task: &BuildCommitParentsTask,
) -> Result<()> {
    tracing::debug!("Building parents of {} in project {}", task.commit_sha, task.project_id);
    build_commit_parents(ctx, task.project_id, &task.commit_sha).await
}
