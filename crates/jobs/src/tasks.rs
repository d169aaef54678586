use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Kinds of work the pipeline accepts from the queue.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ProcessJobRun,
    ProcessInProgressJob,
    BuildCommitParents,
    RecalculateTestStatistics,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        Self::ProcessJobRun,
        Self::ProcessInProgressJob,
        Self::BuildCommitParents,
        Self::RecalculateTestStatistics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessJobRun => "process_job_run",
            Self::ProcessInProgressJob => "process_in_progress_job",
            Self::BuildCommitParents => "build_commit_parents",
            Self::RecalculateTestStatistics => "recalculate_test_statistics",
        }
    }
}

impl FromStr for TaskType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|t| t.as_str() == s).ok_or(())
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A finished job run to ingest.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProcessJobRunTask {
    pub project_id: u64,
    pub job_run_id: u64,
}

/// A job run that was still executing when it was announced.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProcessInProgressJobTask {
    pub project_id: u64,
    pub job_run_id: u64,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BuildCommitParentsTask {
    pub project_id: u64,
    pub commit_sha: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RecalculateTestStatisticsTask {
    pub project_id: u64,
    pub job_id: String,
    pub branch_name: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Task {
    ProcessJobRun(ProcessJobRunTask),
    ProcessInProgressJob(ProcessInProgressJobTask),
    BuildCommitParents(BuildCommitParentsTask),
    RecalculateTestStatistics(RecalculateTestStatisticsTask),
}

impl Task {
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::ProcessJobRun(_) => TaskType::ProcessJobRun,
            Self::ProcessInProgressJob(_) => TaskType::ProcessInProgressJob,
            Self::BuildCommitParents(_) => TaskType::BuildCommitParents,
            Self::RecalculateTestStatistics(_) => TaskType::RecalculateTestStatistics,
        }
    }

    /// Key grouping tasks that touch the same rows.
    pub fn partition_key(&self) -> String {
        match self {
            Self::ProcessJobRun(t) => format!("{}:{}", t.project_id, t.job_run_id),
            Self::ProcessInProgressJob(t) => format!("{}:{}", t.project_id, t.job_run_id),
            Self::BuildCommitParents(t) => format!("{}:{}", t.project_id, t.commit_sha),
            Self::RecalculateTestStatistics(t) => format!("{}:{}", t.project_id, t.job_id),
        }
    }

    pub fn into_envelope(self) -> Result<TaskEnvelope, serde_json::Error> {
        let task_type = self.task_type();
        let partition_key = self.partition_key();
        let payload = match self {
            Self::ProcessJobRun(t) => serde_json::to_value(t),
            Self::ProcessInProgressJob(t) => serde_json::to_value(t),
            Self::BuildCommitParents(t) => serde_json::to_value(t),
            Self::RecalculateTestStatistics(t) => serde_json::to_value(t),
        }?;
        Ok(TaskEnvelope { task_type: task_type.as_str().to_string(), partition_key, payload })
    }
}

/// What the queue stores: a string-tagged JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_type: String,
    pub partition_key: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskDecodeError {
    #[error("unknown task type {0:?}")]
    UnknownType(String),
    #[error("failed to decode {payload} for task {task_type}")]
    Payload {
        task_type: TaskType,
        payload: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl TaskEnvelope {
    /// Resolve the tag and deserialize the payload into its task variant.
    pub fn decode(&self) -> Result<Task, TaskDecodeError> {
        let task_type = self
            .task_type
            .parse::<TaskType>()
            .map_err(|()| TaskDecodeError::UnknownType(self.task_type.clone()))?;
        Ok(match task_type {
            TaskType::ProcessJobRun => Task::ProcessJobRun(self.payload(task_type)?),
            TaskType::ProcessInProgressJob => Task::ProcessInProgressJob(self.payload(task_type)?),
            TaskType::BuildCommitParents => Task::BuildCommitParents(self.payload(task_type)?),
            TaskType::RecalculateTestStatistics => {
                Task::RecalculateTestStatistics(self.payload(task_type)?)
            }
        })
    }

    fn payload<T: DeserializeOwned>(&self, task_type: TaskType) -> Result<T, TaskDecodeError> {
        T::deserialize(&self.payload).map_err(|source| TaskDecodeError::Payload {
            task_type,
            payload: std::any::type_name::<T>(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_task_type_names() {
        for task_type in TaskType::ALL {
            assert_eq!(task_type.as_str().parse::<TaskType>(), Ok(task_type));
            assert_eq!(
                serde_json::to_value(task_type).unwrap(),
                serde_json::Value::String(task_type.as_str().to_string())
            );
        }
        assert_eq!("ProcessJobRun".parse::<TaskType>(), Err(()));
    }

    #[test]
    fn test_envelope_decode() {
        let tasks = [
            Task::ProcessJobRun(ProcessJobRunTask { project_id: 1, job_run_id: 2 }),
            Task::ProcessInProgressJob(ProcessInProgressJobTask { project_id: 1, job_run_id: 3 }),
            Task::BuildCommitParents(BuildCommitParentsTask {
                project_id: 1,
                commit_sha: "abc".into(),
            }),
            Task::RecalculateTestStatistics(RecalculateTestStatisticsTask {
                project_id: 1,
                job_id: "unit-tests".into(),
                branch_name: "main".into(),
            }),
        ];
        let keys = ["1:2", "1:3", "1:abc", "1:unit-tests"];
        for (task, key) in tasks.into_iter().zip(keys) {
            let envelope = task.clone().into_envelope().unwrap();
            assert_eq!(envelope.partition_key, key);
            assert_eq!(envelope.decode().unwrap(), task);
        }
    }

    #[test]
    fn test_decode_errors() {
        let envelope = TaskEnvelope {
            task_type: "refresh_everything".into(),
            partition_key: "1".into(),
            payload: json!({}),
        };
        assert!(matches!(
            envelope.decode(),
            Err(TaskDecodeError::UnknownType(t)) if t == "refresh_everything"
        ));

        let envelope = TaskEnvelope {
            task_type: "process_job_run".into(),
            partition_key: "1:2".into(),
            payload: json!({ "project_id": "one" }),
        };
        let err = envelope.decode().unwrap_err();
        assert!(err.to_string().contains("ProcessJobRunTask"), "{err}");
        assert!(matches!(err, TaskDecodeError::Payload { task_type: TaskType::ProcessJobRun, .. }));
    }
}
