use anyhow::{Context, Result};
use apalis::prelude::TaskSink;
use async_trait::async_trait;

use crate::{JobStorage, tasks::Task};

/// Where handlers put follow-up work.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<()>;
}

#[async_trait]
impl TaskQueue for JobStorage {
    async fn enqueue(&self, task: Task) -> Result<()> {
        let task_type = task.task_type();
        let envelope = task.into_envelope().context("Failed to encode task")?;
        tracing::debug!("Enqueueing {} task {}", task_type, envelope.partition_key);
        let mut storage = self.tasks();
        storage
            .push(envelope)
            .await
            .with_context(|| format!("Failed to enqueue {task_type} task"))?;
        Ok(())
    }
}
