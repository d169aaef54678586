use anyhow::Result;

use crate::{JobContext, tasks::RecalculateTestStatisticsTask};

/// Accepts recalculation requests; the statistics themselves are computed downstream.
pub async fn process_recalculate_test_statistics(
    _ctx: &JobContext,
    task: &RecalculateTestStatisticsTask,
) -> Result<()> {
    tracing::info!(
        "Recalculate test statistics requested: project={} job={} branch={}",
        task.project_id,
        task.job_id,
        task.branch_name
    );
    Ok(())
}
