use std::sync::Arc;

use async_trait::async_trait;

use baton_types::{HistoryItem, HistoryUpdate, TodoItem};

use crate::config::CoreConfig;
use crate::error::{DelegationError, HistoryError, TaskError};
use crate::task::Task;

#[derive(Debug, Clone)]
pub struct DelegateParams {
    pub parent_task_id: String,
    pub message: String,
    pub initial_todos: Vec<TodoItem>,
    pub mode: String,
}

#[derive(Debug, Clone)]
pub struct ReopenParams {
    pub parent_task_id: String,
    pub child_task_id: String,
    pub completion_result_summary: String,
}

/// What a running task may ask of the manager that owns it.
///
/// Tasks hold this as a `Weak` reference; the manager owns the tasks.
#[async_trait]
pub trait TaskHost: Send + Sync {
    fn config(&self) -> CoreConfig;

    fn find_task(&self, task_id: &str) -> Option<Arc<Task>>;

    fn current_task(&self) -> Option<Arc<Task>>;

    /// Reports a failure the user should see.
    fn report_error(&self, message: &str);

    async fn delegate_parent_and_open_child(
        &self,
        params: DelegateParams,
    ) -> Result<Arc<Task>, DelegationError>;

    async fn reopen_parent_from_delegation(&self, params: ReopenParams) -> Result<(), TaskError>;

    /// Pause-based flow: opens `message` as a child on top of `parent`.
    async fn create_subtask(
        &self,
        parent: &Arc<Task>,
        message: String,
        initial_todos: Vec<TodoItem>,
    ) -> Result<Arc<Task>, TaskError>;

    /// Pause-based flow: closes the current child and hands `result` to the
    /// task underneath it.
    async fn finish_subtask(&self, result: &str) -> Result<(), TaskError>;

    async fn handle_mode_switch(&self, mode: &str);

    async fn update_task_history(&self, update: HistoryUpdate)
        -> Result<HistoryItem, HistoryError>;
}
