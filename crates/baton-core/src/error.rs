use thiserror::Error;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("No history record for task {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Persistence write error: {0}")]
    Write(String),
}

#[derive(Error, Debug)]
pub enum TaskError {
    /// The loop observed its own abort flag. Expected during disposal.
    #[error("Task {task_id}.{instance_id} aborted")]
    Aborted { task_id: String, instance_id: String },

    #[error("Model error: {0}")]
    Model(String),

    #[error(transparent)]
    Persistence(#[from] HistoryError),

    #[error("Task manager is no longer available")]
    HostUnavailable,

    #[error("Subtask error: {0}")]
    Subtask(String),
}

impl TaskError {
    /// Whether the failure is the kind a torn-down task produces.
    pub fn is_abort_shaped(&self) -> bool {
        match self {
            TaskError::Aborted { .. } => true,
            other => {
                let text = other.to_string().to_ascii_lowercase();
                text.contains("aborted") || text.contains("abandoned")
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum DelegationError {
    #[error("[delegate] parent task not found: {0}")]
    TargetNotFound(String),

    #[error("[delegate] parent task {parent_task_id} is already awaiting child {child_task_id}")]
    AlreadyDelegated {
        parent_task_id: String,
        child_task_id: String,
    },

    #[error("Error during parent disposal (non-fatal): {0}")]
    ParentDisposal(String),

    #[error("[delegate] {0}")]
    Persistence(#[from] HistoryError),
}
