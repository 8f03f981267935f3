//! Engine error taxonomy
//!
//! Every variant carries a stable machine code and a suggested HTTP status so
//! callers of the exposed operations can surface failures synchronously.

use crate::workflow::types::{InstanceStatus, TaskStatus};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid workflow definition: {0}")]
    InvalidWorkflowDefinition(String),

    #[error("Workflow instance {instance_id} is {status}, expected running")]
    InvalidWorkflowStatus {
        instance_id: String,
        status: InstanceStatus,
    },

    #[error("Task {task_id} is {status}, expected pending or in_progress")]
    InvalidTaskStatus { task_id: String, status: TaskStatus },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),
}

impl EngineError {
    /// Stable code for API consumers
    pub fn code(&self) -> &'static str {
        match self {
            Self::WorkflowNotFound(_) => "WORKFLOW_NOT_FOUND",
            Self::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            Self::TaskNotFound(_) => "TASK_NOT_FOUND",
            Self::InvalidWorkflowDefinition(_) => "INVALID_WORKFLOW_DEFINITION",
            Self::InvalidWorkflowStatus { .. } => "INVALID_WORKFLOW_STATUS",
            Self::InvalidTaskStatus { .. } => "INVALID_TASK_STATUS",
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::ExecutionError(_) => "EXECUTION_ERROR",
        }
    }

    /// Suggested HTTP status for the error
    pub fn http_status(&self) -> u16 {
        match self {
            Self::WorkflowNotFound(_) | Self::InstanceNotFound(_) | Self::TaskNotFound(_) => 404,
            Self::InvalidWorkflowDefinition(_) => 422,
            Self::InvalidWorkflowStatus { .. } | Self::InvalidTaskStatus { .. } => 409,
            Self::ValidationError(_) => 400,
            Self::ExecutionError(_) => 500,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
