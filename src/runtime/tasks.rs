//! Task store for human work items
//!
//! Tasks are created when a task or approval node is entered and are never
//! removed; they leave the open set only through a status transition. The
//! engine mutates a task only while it holds the owning instance's lock, so
//! the store itself needs nothing stronger than a map-level RwLock.

use crate::workflow::types::{
    InstanceMetadata, TaskComment, TaskConfig, TaskKind, TaskStatus, WorkflowNode, WorkflowTask,
};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Longest task timeout a node may declare (ten years)
pub const MAX_TASK_TIMEOUT_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Default)]
pub struct TaskManager {
    tasks: RwLock<HashMap<String, WorkflowTask>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending task for a freshly entered task/approval node
    pub async fn create(
        &self,
        instance_id: &str,
        workflow_id: &str,
        node: &WorkflowNode,
        kind: TaskKind,
        config: &TaskConfig,
        metadata: &InstanceMetadata,
    ) -> WorkflowTask {
        let now = Utc::now();
        // The node timeout wins; otherwise the task inherits the instance due date
        let due_date = config
            .timeout_secs
            .and_then(|secs| {
                let due = due_after(now, secs);
                if due.is_none() {
                    tracing::warn!(node_id = %node.id, timeout_secs = secs, "task timeout out of range, ignored");
                }
                due
            })
            .or(metadata.due_date);

        let task = WorkflowTask {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            workflow_id: workflow_id.to_string(),
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            kind,
            status: TaskStatus::Pending,
            assignees: config.assignees.clone(),
            assignee_type: config.assignee_type,
            due_date,
            comments: Vec::new(),
            created_at: now,
            claimed_by: None,
            completed_at: None,
            completed_by: None,
            result: None,
        };

        self.tasks.write().await.insert(task.id.clone(), task.clone());
        tracing::debug!(task_id = %task.id, node_id = %node.id, "task created");
        task
    }

    pub async fn get(&self, task_id: &str) -> Option<WorkflowTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// Apply `update` to a task and return the new state
    pub async fn update<F>(&self, task_id: &str, update: F) -> Option<WorkflowTask>
    where
        F: FnOnce(&mut WorkflowTask),
    {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(task_id)?;
        update(task);
        Some(task.clone())
    }

    /// All tasks, oldest first
    pub async fn list(&self) -> Vec<WorkflowTask> {
        let mut tasks: Vec<WorkflowTask> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// Open tasks the principal is assigned to
    pub async fn by_assignee(&self, principal: &str) -> Vec<WorkflowTask> {
        self.list()
            .await
            .into_iter()
            .filter(|task| task.status.is_open())
            .filter(|task| task.assignees.iter().any(|a| a == principal))
            .collect()
    }

    pub async fn for_instance(&self, instance_id: &str) -> Vec<WorkflowTask> {
        self.list()
            .await
            .into_iter()
            .filter(|task| task.instance_id == instance_id)
            .collect()
    }

    /// Cancel every open task of an instance, returning the canceled tasks
    pub async fn cancel_open(&self, instance_id: &str) -> Vec<WorkflowTask> {
        let now = Utc::now();
        let mut tasks = self.tasks.write().await;
        tasks
            .values_mut()
            .filter(|task| task.instance_id == instance_id && task.status.is_open())
            .map(|task| {
                task.status = TaskStatus::Canceled;
                task.completed_at = Some(now);
                task.clone()
            })
            .collect()
    }
}

/// `now + secs`, or `None` when the timeout is beyond `MAX_TASK_TIMEOUT_SECS`
fn due_after(now: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    if secs > MAX_TASK_TIMEOUT_SECS {
        return None;
    }
    let delta = TimeDelta::try_seconds(i64::try_from(secs).ok()?)?;
    now.checked_add_signed(delta)
}

/// Append a comment to a task
pub(crate) fn push_comment(task: &mut WorkflowTask, author: &str, text: &str) {
    task.comments.push(TaskComment {
        author: author.to_string(),
        text: text.to_string(),
        created_at: Utc::now(),
    });
}
