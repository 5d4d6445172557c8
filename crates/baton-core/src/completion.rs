use std::sync::Arc;

use tracing::{info, Level};

use baton_observability::{emit_event, ObservabilityEvent, ProcessKind};
use baton_types::{has_open_todos, AskKind, HistoryUpdate, SayKind, TaskStatus};

use crate::error::TaskError;
use crate::host::ReopenParams;
use crate::task::Task;

pub const ATTEMPT_COMPLETION_TOOL: &str = "attempt_completion";

pub const OPEN_TODOS_ERROR: &str = "Cannot complete task while there are incomplete todos. \
Finish or update the remaining todos before calling attempt_completion.";

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// Refused; the text goes back to the model as a tool error.
    Blocked(String),
    /// Control went back to the parent task.
    Delegated,
    /// Top-level task finished and is waiting on the user.
    Completed,
}

/// `attempt_completion` tool.
///
/// A task with a parent (by persisted relation, whether or not the parent is
/// live) hands its result upward; a top-level task finishes in place.
pub async fn attempt_completion(
    task: &Arc<Task>,
    result: &str,
) -> Result<CompletionOutcome, TaskError> {
    let config = task.config();

    if config.prevent_completion_with_open_todos && has_open_todos(&task.todos()) {
        task.record_mistake();
        task.record_tool_error(ATTEMPT_COMPLETION_TOOL);
        info!(task_id = %task.task_id(), "completion refused: open todos");
        return Ok(CompletionOutcome::Blocked(OPEN_TODOS_ERROR.to_string()));
    }

    task.reset_mistakes();
    task.say(SayKind::CompletionResult, result).await?;

    if let Some(parent_task_id) = task.parent_task_id() {
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("task.completion.delegated", "completion")
                .task(task.task_id())
                .parent(parent_task_id)
                .status(if config.metadata_driven_subtasks() {
                    "reopen_parent"
                } else {
                    "finish_subtask"
                }),
        );
        return hand_back_to_parent(
            task,
            parent_task_id,
            result,
            config.metadata_driven_subtasks(),
        )
        .await;
    }

    task.ask(AskKind::CompletionResult, None).await?;
    task.mark_completed();
    let mut item = task.history_item();
    item.status = Some(TaskStatus::Completed);
    task.host()?
        .update_task_history(HistoryUpdate::partial(item))
        .await?;
    Ok(CompletionOutcome::Completed)
}

async fn hand_back_to_parent(
    task: &Arc<Task>,
    parent_task_id: &str,
    result: &str,
    metadata_driven: bool,
) -> Result<CompletionOutcome, TaskError> {
    let host = task.host()?;
    if metadata_driven {
        host.reopen_parent_from_delegation(ReopenParams {
            parent_task_id: parent_task_id.to_string(),
            child_task_id: task.task_id().to_string(),
            completion_result_summary: result.to_string(),
        })
        .await?;
    } else {
        host.finish_subtask(result).await?;
    }
    Ok(CompletionOutcome::Delegated)
}
