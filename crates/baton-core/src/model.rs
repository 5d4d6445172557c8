use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use baton_types::{ApiMessage, TodoItem, TokenUsage};

/// Tool invocation the model asked for at the end of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    NewTask {
        message: String,
        #[serde(default)]
        todos: Vec<TodoItem>,
        mode: String,
    },
    AttemptCompletion {
        result: String,
    },
    UpdateTodoList {
        todos: Vec<TodoItem>,
    },
    #[serde(rename = "ask_followup_question")]
    AskFollowup {
        question: String,
    },
}

impl ToolCall {
    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::NewTask { .. } => "new_task",
            ToolCall::AttemptCompletion { .. } => "attempt_completion",
            ToolCall::UpdateTodoList { .. } => "update_todo_list",
            ToolCall::AskFollowup { .. } => "ask_followup_question",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    TextDelta(String),
    ToolCall(ToolCall),
    Done {
        usage: Option<TokenUsage>,
        response_id: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub task_id: String,
    pub mode: String,
    pub messages: Vec<ApiMessage>,
    /// `None` when the task asked to skip response chaining for this call.
    pub previous_response_id: Option<String>,
}

/// One assistant turn assembled from a chunk stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelTurn {
    pub text: String,
    pub tool_call: Option<ToolCall>,
    pub usage: TokenUsage,
    pub response_id: Option<String>,
}

pub type ModelStream = Pin<Box<dyn Stream<Item = anyhow::Result<ModelChunk>> + Send>>;

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn create_message(
        &self,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<ModelStream>;
}
