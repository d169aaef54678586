use anyhow::{Context, Result, bail};
use argp::FromArgs;
use ci_insights_core::config::Config;
use ci_insights_jobs::{
    JobStorage,
    queue::TaskQueue,
    tasks::{
        BuildCommitParentsTask, ProcessInProgressJobTask, ProcessJobRunTask,
        RecalculateTestStatisticsTask, Task, TaskType,
    },
};

use crate::util::task_type;

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Push a single task into the configured queue.
#[argp(subcommand, name = "enqueue")]
pub struct Args {
    #[argp(positional, from_str_fn(task_type))]
    /// task type
    task_type: TaskType,
    #[argp(option)]
    /// project id
    project: u64,
    #[argp(option)]
    /// job run id (process_job_run, process_in_progress_job)
    job_run: Option<u64>,
    #[argp(option)]
    /// commit sha (build_commit_parents)
    commit: Option<String>,
    #[argp(option)]
    /// job name (recalculate_test_statistics)
    job: Option<String>,
    #[argp(option)]
    /// branch name (recalculate_test_statistics)
    branch: Option<String>,
}

pub async fn run(args: Args) -> Result<()> {
    let task = build_task(args)?;
    let config = Config::load()?;
    let storage = JobStorage::setup(&config.db).await.context("Failed to set up job storage")?;
    let partition_key = task.partition_key();
    storage.enqueue(task).await?;
    tracing::info!("Enqueued {}", partition_key);
    println!("Enqueued {partition_key}");
    Ok(())
}

fn build_task(args: Args) -> Result<Task> {
    let Args { task_type, project: project_id, job_run, commit, job, branch } = args;
    let job_run_id = || job_run.context("--job-run is required");
    Ok(match task_type {
        TaskType::ProcessJobRun => {
            Task::ProcessJobRun(ProcessJobRunTask { project_id, job_run_id: job_run_id()? })
        }
        TaskType::ProcessInProgressJob => Task::ProcessInProgressJob(ProcessInProgressJobTask {
            project_id,
            job_run_id: job_run_id()?,
        }),
        TaskType::BuildCommitParents => {
            let Some(commit_sha) = commit else { bail!("--commit is required") };
            Task::BuildCommitParents(BuildCommitParentsTask { project_id, commit_sha })
        }
        TaskType::RecalculateTestStatistics => {
            let (Some(job_id), Some(branch_name)) = (job, branch) else {
                bail!("--job and --branch are required");
            };
            Task::RecalculateTestStatistics(RecalculateTestStatisticsTask {
                project_id,
                job_id,
                branch_name,
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(task_type: TaskType) -> Args {
        Args { task_type, project: 7, job_run: None, commit: None, job: None, branch: None }
    }

    #[test]
    fn test_build_task() {
        let task = build_task(Args { job_run: Some(42), ..args(TaskType::ProcessJobRun) }).unwrap();
        assert_eq!(task, Task::ProcessJobRun(ProcessJobRunTask { project_id: 7, job_run_id: 42 }));

        let task = build_task(Args {
            commit: Some("abc".to_string()),
            ..args(TaskType::BuildCommitParents)
        })
        .unwrap();
        assert_eq!(task.task_type(), TaskType::BuildCommitParents);
    }

    #[test]
    fn test_build_task_missing_fields() {
        let cases: &[TaskType] = &[
            TaskType::ProcessJobRun,
            TaskType::ProcessInProgressJob,
            TaskType::BuildCommitParents,
            TaskType::RecalculateTestStatistics,
        ];
        for &task_type in cases {
            assert!(build_task(args(task_type)).is_err(), "{task_type}");
        }
    }
}
