use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UiMessageType {
    Ask,
    Say,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AskKind {
    CompletionResult,
    ApiReqFailed,
    MistakeLimitReached,
    ResumeTask,
    ResumeCompletedTask,
    Followup,
    Tool,
    Command,
}

/// Which of the three pending-ask slots an ask occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskSlot {
    Idle,
    Resumable,
    Interactive,
}

impl AskKind {
    pub fn slot(self) -> AskSlot {
        match self {
            AskKind::CompletionResult | AskKind::ApiReqFailed | AskKind::MistakeLimitReached => {
                AskSlot::Idle
            }
            AskKind::ResumeTask | AskKind::ResumeCompletedTask => AskSlot::Resumable,
            AskKind::Followup | AskKind::Tool | AskKind::Command => AskSlot::Interactive,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SayKind {
    Text,
    Error,
    CompletionResult,
    SubtaskResult,
    CheckpointSaved,
}

/// Entry of the UI-facing log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UiMessage {
    pub ts: i64,
    #[serde(rename = "type")]
    pub kind: UiMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<AskKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub say: Option<SayKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
}

impl UiMessage {
    pub fn say(say: SayKind, text: impl Into<String>) -> Self {
        Self {
            ts: crate::now_ms(),
            kind: UiMessageType::Say,
            ask: None,
            say: Some(say),
            text: Some(text.into()),
            partial: None,
        }
    }

    pub fn ask(ask: AskKind, text: Option<String>) -> Self {
        Self {
            ts: crate::now_ms(),
            kind: UiMessageType::Ask,
            ask: Some(ask),
            say: None,
            text,
            partial: None,
        }
    }

    /// Synthetic entry carrying a finished child's summary into its parent.
    pub fn subtask_result(summary: &str) -> Self {
        Self::say(SayKind::SubtaskResult, summary)
    }

    pub fn is_say(&self, kind: SayKind) -> bool {
        self.kind == UiMessageType::Say && self.say == Some(kind)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApiRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn as_text(&self) -> &str {
        match self {
            ContentBlock::Text { text } => text,
        }
    }
}

/// Entry of the model-facing conversation log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiMessage {
    pub role: ApiRole,
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

impl ApiMessage {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: ApiRole::User,
            content,
            ts: Some(crate::now_ms()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ApiRole::Assistant,
            content: vec![ContentBlock::text(text)],
            ts: Some(crate::now_ms()),
        }
    }

    /// Synthetic user turn telling the parent model what its child produced.
    pub fn subtask_completed(child_task_id: &str, summary: &str) -> Self {
        Self::user(vec![ContentBlock::text(format!(
            "Subtask {child_task_id} completed. Result: {summary}"
        ))])
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
