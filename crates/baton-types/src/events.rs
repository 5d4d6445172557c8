use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cache_writes: u64,
    pub cache_reads: u64,
    pub total_cost: f64,
}

/// Lifecycle event published on a single task's own bus.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Started,
    Active,
    Idle,
    Resumable,
    Interactive,
    Paused,
    Unpaused,
    Spawned { child_task_id: String },
    Aborted,
    Completed { usage: TokenUsage },
}

/// Event published by the task stack manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    TaskCreated {
        task_id: String,
    },
    TaskDelegated {
        parent_task_id: String,
        child_task_id: String,
    },
    TaskDelegationCompleted {
        parent_task_id: String,
        child_task_id: String,
        summary: String,
    },
    TaskDelegationResumed {
        parent_task_id: String,
        child_task_id: String,
    },
}

/// Process-wide event surface, task-scoped events tagged with their task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiEvent {
    TaskCreated {
        task_id: String,
    },
    TaskStarted {
        task_id: String,
    },
    TaskActive {
        task_id: String,
    },
    TaskIdle {
        task_id: String,
    },
    TaskResumable {
        task_id: String,
    },
    TaskInteractive {
        task_id: String,
    },
    TaskPaused {
        task_id: String,
    },
    TaskUnpaused {
        task_id: String,
    },
    TaskSpawned {
        task_id: String,
        child_task_id: String,
    },
    TaskAborted {
        task_id: String,
    },
    TaskCompleted {
        task_id: String,
        usage: TokenUsage,
    },
    TaskDelegated {
        parent_task_id: String,
        child_task_id: String,
    },
    TaskDelegationCompleted {
        parent_task_id: String,
        child_task_id: String,
        summary: String,
    },
    TaskDelegationResumed {
        parent_task_id: String,
        child_task_id: String,
    },
}

impl ApiEvent {
    pub fn from_task_event(task_id: &str, event: TaskEvent) -> Self {
        let task_id = task_id.to_string();
        match event {
            TaskEvent::Started => ApiEvent::TaskStarted { task_id },
            TaskEvent::Active => ApiEvent::TaskActive { task_id },
            TaskEvent::Idle => ApiEvent::TaskIdle { task_id },
            TaskEvent::Resumable => ApiEvent::TaskResumable { task_id },
            TaskEvent::Interactive => ApiEvent::TaskInteractive { task_id },
            TaskEvent::Paused => ApiEvent::TaskPaused { task_id },
            TaskEvent::Unpaused => ApiEvent::TaskUnpaused { task_id },
            TaskEvent::Spawned { child_task_id } => ApiEvent::TaskSpawned {
                task_id,
                child_task_id,
            },
            TaskEvent::Aborted => ApiEvent::TaskAborted { task_id },
            TaskEvent::Completed { usage } => ApiEvent::TaskCompleted { task_id, usage },
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            ApiEvent::TaskCreated { .. } => "task.created",
            ApiEvent::TaskStarted { .. } => "task.started",
            ApiEvent::TaskActive { .. } => "task.active",
            ApiEvent::TaskIdle { .. } => "task.idle",
            ApiEvent::TaskResumable { .. } => "task.resumable",
            ApiEvent::TaskInteractive { .. } => "task.interactive",
            ApiEvent::TaskPaused { .. } => "task.paused",
            ApiEvent::TaskUnpaused { .. } => "task.unpaused",
            ApiEvent::TaskSpawned { .. } => "task.spawned",
            ApiEvent::TaskAborted { .. } => "task.aborted",
            ApiEvent::TaskCompleted { .. } => "task.completed",
            ApiEvent::TaskDelegated { .. } => "task.delegated",
            ApiEvent::TaskDelegationCompleted { .. } => "task.delegation_completed",
            ApiEvent::TaskDelegationResumed { .. } => "task.delegation_resumed",
        }
    }

    /// True for the pause-based subtask events that the delegation path must
    /// never produce.
    pub fn is_legacy_subtask_event(&self) -> bool {
        matches!(
            self,
            ApiEvent::TaskPaused { .. } | ApiEvent::TaskUnpaused { .. } | ApiEvent::TaskSpawned { .. }
        )
    }
}

impl From<ProviderEvent> for ApiEvent {
    fn from(event: ProviderEvent) -> Self {
        match event {
            ProviderEvent::TaskCreated { task_id } => ApiEvent::TaskCreated { task_id },
            ProviderEvent::TaskDelegated {
                parent_task_id,
                child_task_id,
            } => ApiEvent::TaskDelegated {
                parent_task_id,
                child_task_id,
            },
            ProviderEvent::TaskDelegationCompleted {
                parent_task_id,
                child_task_id,
                summary,
            } => ApiEvent::TaskDelegationCompleted {
                parent_task_id,
                child_task_id,
                summary,
            },
            ProviderEvent::TaskDelegationResumed {
                parent_task_id,
                child_task_id,
            } => ApiEvent::TaskDelegationResumed {
                parent_task_id,
                child_task_id,
            },
        }
    }
}
