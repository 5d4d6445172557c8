use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::StreamExt;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};

use baton_observability::{emit_event, ObservabilityEvent, ProcessKind};
use baton_types::{
    new_task_id, now_ms, ApiMessage, AskKind, AskSlot, ContentBlock, HistoryItem, HistoryUpdate,
    SayKind, TaskEvent, TaskStatus, TodoItem, TokenUsage, UiMessage, UiMessageType,
};

use crate::completion::{attempt_completion, CompletionOutcome};
use crate::config::CoreConfig;
use crate::error::TaskError;
use crate::event_bus::EventBus;
use crate::host::{DelegateParams, TaskHost};
use crate::model::{ModelChunk, ModelClient, ModelRequest, ModelTurn, ToolCall};
use crate::storage::HistoryStore;

pub const DEFAULT_MODE: &str = "code";

pub const NO_TOOLS_USED_NUDGE: &str = "[ERROR] You did not use a tool in your previous response. \
Use one of the available tools to continue, or call attempt_completion when the task is done.";

pub const DELEGATION_RESUMED_TEXT: &str = "[TASK RESUMED AFTER DELEGATION] The subtask has \
finished and its result is the last message above. Continue the task from there.";

const TASK_RESUMPTION_TEXT: &str =
    "[TASK RESUMPTION] This task was interrupted. Continue from where it left off.";

const TODO_LIST_UPDATED_TEXT: &str = "Todo list updated.";

/// Execution phase of one live task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Idle,
    Running,
    Streaming,
    Aborting,
    Aborted,
    Completed,
}

impl TaskPhase {
    pub fn is_aborting(self) -> bool {
        matches!(self, TaskPhase::Aborting | TaskPhase::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    UserCancelled,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingAsk {
    pub kind: AskKind,
    pub text: Option<String>,
    pub ts: i64,
}

#[derive(Debug, Default)]
struct PendingAsks {
    idle: Option<PendingAsk>,
    resumable: Option<PendingAsk>,
    interactive: Option<PendingAsk>,
}

impl PendingAsks {
    fn slot(&self, slot: AskSlot) -> &Option<PendingAsk> {
        match slot {
            AskSlot::Idle => &self.idle,
            AskSlot::Resumable => &self.resumable,
            AskSlot::Interactive => &self.interactive,
        }
    }

    fn slot_mut(&mut self, slot: AskSlot) -> &mut Option<PendingAsk> {
        match slot {
            AskSlot::Idle => &mut self.idle,
            AskSlot::Resumable => &mut self.resumable,
            AskSlot::Interactive => &mut self.interactive,
        }
    }

    fn clear(&mut self) {
        *self = PendingAsks::default();
    }
}

/// Fresh task parameters. Identity comes from the manager.
#[derive(Debug, Clone)]
pub struct FreshTask {
    pub message: String,
    pub initial_todos: Vec<TodoItem>,
    pub task_number: u32,
    pub parent_task_id: Option<String>,
    pub root_task_id: Option<String>,
    pub mode: String,
}

/// A task is built either fresh or from a persisted record, never both.
#[derive(Debug, Clone)]
pub enum TaskInit {
    Fresh(FreshTask),
    FromHistory(HistoryItem),
}

pub struct TaskDeps {
    pub host: Weak<dyn TaskHost>,
    pub model: Arc<dyn ModelClient>,
    pub store: Arc<dyn HistoryStore>,
    pub config: CoreConfig,
    pub workspace: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubtaskStart {
    /// The parent was closed and the child opened in its place.
    Delegated { child_task_id: String },
    /// The parent stays open, paused, under the child.
    Paused { child_task_id: String },
}

enum LoopControl {
    Continue(Vec<ContentBlock>),
    Stop,
}

struct TaskState {
    phase: TaskPhase,
    abandoned: bool,
    abort_reason: Option<AbortReason>,
    is_waiting_for_first_chunk: bool,
    did_finish_aborting_stream: bool,
    is_initialized: bool,
    is_paused: bool,
    asks: PendingAsks,
    skip_prev_response_id_once: bool,
    last_response_id: Option<String>,
    task_text: String,
    mode: String,
    todos: Vec<TodoItem>,
    consecutive_mistake_count: u32,
    tool_errors: HashMap<String, u32>,
    child_task_id: Option<String>,
    ui_messages: Vec<UiMessage>,
    api_messages: Vec<ApiMessage>,
    usage: TokenUsage,
    enable_checkpoints: bool,
}

pub struct Task {
    task_id: String,
    instance_id: String,
    task_number: u32,
    root_task_id: Option<String>,
    parent_task_id: Option<String>,
    workspace: Option<String>,
    host: Weak<dyn TaskHost>,
    model: Arc<dyn ModelClient>,
    store: Arc<dyn HistoryStore>,
    config: CoreConfig,
    events: EventBus<TaskEvent>,
    abort_signal: CancellationToken,
    disposed: CancellationToken,
    unpaused: Notify,
    init: Mutex<Option<TaskInit>>,
    state: Mutex<TaskState>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("task_id", &self.task_id)
            .field("instance_id", &self.instance_id)
            .field("task_number", &self.task_number)
            .field("parent_task_id", &self.parent_task_id)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Task {
    pub fn new(init: TaskInit, deps: TaskDeps) -> Arc<Self> {
        let (task_id, task_number, parent_task_id, root_task_id, task_text, mode, todos, usage) =
            match &init {
                TaskInit::Fresh(fresh) => (
                    new_task_id(),
                    fresh.task_number,
                    fresh.parent_task_id.clone(),
                    fresh.root_task_id.clone(),
                    fresh.message.clone(),
                    fresh.mode.clone(),
                    fresh.initial_todos.clone(),
                    TokenUsage::default(),
                ),
                TaskInit::FromHistory(item) => (
                    item.id.clone(),
                    item.number,
                    item.parent_task_id.clone(),
                    item.root_task_id.clone(),
                    item.task.clone(),
                    item.mode.clone().unwrap_or_else(|| DEFAULT_MODE.to_string()),
                    Vec::new(),
                    TokenUsage {
                        tokens_in: item.tokens_in,
                        tokens_out: item.tokens_out,
                        cache_writes: item.cache_writes.unwrap_or(0),
                        cache_reads: item.cache_reads.unwrap_or(0),
                        total_cost: item.total_cost,
                    },
                ),
            };
        let workspace = match &init {
            TaskInit::FromHistory(item) => item.workspace.clone().or(deps.workspace),
            TaskInit::Fresh(_) => deps.workspace,
        };

        let state = TaskState {
            phase: TaskPhase::Idle,
            abandoned: false,
            abort_reason: None,
            is_waiting_for_first_chunk: false,
            did_finish_aborting_stream: false,
            is_initialized: false,
            is_paused: false,
            asks: PendingAsks::default(),
            skip_prev_response_id_once: false,
            last_response_id: None,
            task_text,
            mode,
            todos,
            consecutive_mistake_count: 0,
            tool_errors: HashMap::new(),
            child_task_id: None,
            ui_messages: Vec::new(),
            api_messages: Vec::new(),
            usage,
            enable_checkpoints: deps.config.enable_checkpoints,
        };

        Arc::new(Self {
            task_id,
            instance_id: new_task_id()[..8].to_string(),
            task_number,
            root_task_id,
            parent_task_id,
            workspace,
            host: deps.host,
            model: deps.model,
            store: deps.store,
            config: deps.config,
            events: EventBus::new(),
            abort_signal: CancellationToken::new(),
            disposed: CancellationToken::new(),
            unpaused: Notify::new(),
            init: Mutex::new(Some(init)),
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn host(&self) -> Result<Arc<dyn TaskHost>, TaskError> {
        self.host.upgrade().ok_or(TaskError::HostUnavailable)
    }

    /// Live configuration from the manager, or the creation-time snapshot
    /// once the manager is gone.
    pub fn config(&self) -> CoreConfig {
        self.host
            .upgrade()
            .map(|host| host.config())
            .unwrap_or_else(|| self.config.clone())
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn task_number(&self) -> u32 {
        self.task_number
    }

    pub fn parent_task_id(&self) -> Option<&str> {
        self.parent_task_id.as_deref()
    }

    pub fn root_task_id(&self) -> Option<&str> {
        self.root_task_id.as_deref()
    }

    pub fn mode(&self) -> String {
        self.state().mode.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Cancelled once the manager has closed this instance.
    pub fn disposal_token(&self) -> CancellationToken {
        self.disposed.clone()
    }

    pub fn phase(&self) -> TaskPhase {
        self.state().phase
    }

    pub fn is_aborted(&self) -> bool {
        self.state().phase.is_aborting()
    }

    pub fn is_abandoned(&self) -> bool {
        self.state().abandoned
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.state().abort_reason
    }

    pub fn is_streaming(&self) -> bool {
        self.state().phase == TaskPhase::Streaming
    }

    pub fn is_waiting_for_first_chunk(&self) -> bool {
        self.state().is_waiting_for_first_chunk
    }

    pub fn did_finish_aborting_stream(&self) -> bool {
        self.state().did_finish_aborting_stream
    }

    pub fn is_initialized(&self) -> bool {
        self.state().is_initialized
    }

    pub fn is_paused(&self) -> bool {
        self.state().is_paused
    }

    pub fn child_task_id(&self) -> Option<String> {
        self.state().child_task_id.clone()
    }

    pub fn skip_prev_response_id_once(&self) -> bool {
        self.state().skip_prev_response_id_once
    }

    pub fn set_skip_prev_response_id_once(&self, skip: bool) {
        self.state().skip_prev_response_id_once = skip;
    }

    pub fn pending_ask(&self, slot: AskSlot) -> Option<PendingAsk> {
        self.state().asks.slot(slot).clone()
    }

    pub fn todos(&self) -> Vec<TodoItem> {
        self.state().todos.clone()
    }

    pub fn set_todos(&self, todos: Vec<TodoItem>) {
        self.state().todos = todos;
    }

    pub fn consecutive_mistake_count(&self) -> u32 {
        self.state().consecutive_mistake_count
    }

    pub fn record_mistake(&self) -> u32 {
        let mut st = self.state();
        st.consecutive_mistake_count += 1;
        st.consecutive_mistake_count
    }

    pub fn reset_mistakes(&self) {
        self.state().consecutive_mistake_count = 0;
    }

    pub fn record_tool_error(&self, tool: &str) {
        *self.state().tool_errors.entry(tool.to_string()).or_insert(0) += 1;
    }

    pub fn tool_error_count(&self, tool: &str) -> u32 {
        self.state().tool_errors.get(tool).copied().unwrap_or(0)
    }

    pub fn ui_messages(&self) -> Vec<UiMessage> {
        self.state().ui_messages.clone()
    }

    pub fn api_messages(&self) -> Vec<ApiMessage> {
        self.state().api_messages.clone()
    }

    pub fn token_usage(&self) -> TokenUsage {
        self.state().usage
    }

    pub fn checkpoints_enabled(&self) -> bool {
        self.state().enable_checkpoints
    }

    fn aborted_error(&self) -> TaskError {
        TaskError::Aborted {
            task_id: self.task_id.clone(),
            instance_id: self.instance_id.clone(),
        }
    }

    fn ensure_not_aborted(&self) -> Result<(), TaskError> {
        if self.is_aborted() {
            return Err(self.aborted_error());
        }
        Ok(())
    }

    /// Kicks off the task: a fresh task runs its first turn, a task built
    /// from history raises a resume ask.
    pub fn start(self: &Arc<Self>) {
        let init = self
            .init
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let task = Arc::clone(self);
        match init {
            Some(TaskInit::Fresh(fresh)) => {
                self.spawn_observed(async move { task.start_task(fresh.message).await })
            }
            Some(TaskInit::FromHistory(item)) => {
                self.spawn_observed(async move { task.resume_task_from_history(item).await })
            }
            None => warn!(task_id = %self.task_id, "task already started"),
        }
    }

    /// Runs `work` on its own tokio task with the outcome observer attached.
    fn spawn_observed<F>(self: &Arc<Self>, work: F)
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let task = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = work.await;
            task.observe_loop_outcome(outcome);
        });
    }

    fn spawn_loop(self: &Arc<Self>, user_content: Vec<ContentBlock>) {
        let task = Arc::clone(self);
        self.spawn_observed(async move { task.initiate_task_loop(user_content).await });
    }

    fn observe_loop_outcome(&self, outcome: Result<(), TaskError>) {
        let Err(err) = outcome else {
            return;
        };
        let (aborted, abandoned) = {
            let st = self.state();
            (st.phase.is_aborting(), st.abandoned)
        };
        if aborted || abandoned {
            debug!(
                task_id = %self.task_id,
                instance_id = %self.instance_id,
                error = %err,
                "task loop ended after abort (expected during disposal)"
            );
            return;
        }

        let detail = err.to_string();
        error!(task_id = %self.task_id, instance_id = %self.instance_id, error = %detail, "task loop failed");
        emit_event(
            Level::ERROR,
            ProcessKind::Engine,
            ObservabilityEvent::new("task.loop.failed", "task")
                .task(&self.task_id)
                .error_code("TASK_LOOP_FAILED")
                .detail(&detail),
        );
        if let Some(host) = self.host.upgrade() {
            host.report_error(&format!("Task {} failed: {detail}", self.task_id));
        }
    }

    async fn start_task(self: &Arc<Self>, message: String) -> Result<(), TaskError> {
        {
            let mut st = self.state();
            st.ui_messages.clear();
            st.api_messages.clear();
            st.is_initialized = true;
        }
        self.events.publish(TaskEvent::Started);
        self.say(SayKind::Text, message.clone()).await?;
        self.save_history().await?;
        self.initiate_task_loop(vec![ContentBlock::text(message)])
            .await
    }

    async fn resume_task_from_history(&self, item: HistoryItem) -> Result<(), TaskError> {
        let ui = self.store.read_ui_log(&self.task_id).await?;
        let api = self.store.read_api_log(&self.task_id).await?;
        let finished = item.status == Some(TaskStatus::Completed)
            || ui.iter().rev().find(|m| m.kind == UiMessageType::Ask).is_some_and(|m| {
                m.ask == Some(AskKind::CompletionResult)
            });
        {
            let mut st = self.state();
            st.ui_messages = ui;
            st.api_messages = api;
            st.is_initialized = true;
        }
        let kind = if finished {
            AskKind::ResumeCompletedTask
        } else {
            AskKind::ResumeTask
        };
        self.ask(kind, None).await
    }

    /// Brings a reopened parent back to life after its child finished. The
    /// loop continues without asking the user to confirm.
    pub async fn resume_after_delegation(self: &Arc<Self>) -> Result<(), TaskError> {
        let ui = self.store.read_ui_log(&self.task_id).await?;
        let api = self.store.read_api_log(&self.task_id).await?;
        {
            let mut st = self.state();
            st.ui_messages = ui;
            st.api_messages = api;
            st.asks.clear();
            st.phase = TaskPhase::Idle;
            st.abandoned = false;
            st.abort_reason = None;
            st.did_finish_aborting_stream = false;
            st.is_waiting_for_first_chunk = false;
            st.skip_prev_response_id_once = true;
            st.is_initialized = true;
        }
        info!(task_id = %self.task_id, instance_id = %self.instance_id, "resuming after delegation");
        self.events.publish(TaskEvent::Active);
        self.spawn_loop(vec![ContentBlock::text(DELEGATION_RESUMED_TEXT)]);
        Ok(())
    }

    /// Flags the instance as aborted and interrupts any in-flight stream.
    /// Does not wait for the loop; the caller may be running inside it.
    pub async fn abort_task(&self, abandoned: bool) -> Result<(), TaskError> {
        let first_abort = {
            let mut st = self.state();
            if abandoned {
                st.abandoned = true;
            }
            let first = !st.phase.is_aborting();
            if first {
                st.phase = TaskPhase::Aborting;
                st.abort_reason = Some(if abandoned {
                    AbortReason::Abandoned
                } else {
                    AbortReason::UserCancelled
                });
            }
            first
        };
        if !first_abort {
            return Ok(());
        }

        info!(task_id = %self.task_id, instance_id = %self.instance_id, abandoned, "aborting task");
        self.events.publish(TaskEvent::Aborted);
        self.abort_signal.cancel();
        self.unpaused.notify_one();

        let saved = self.save_history().await;
        self.state().phase = TaskPhase::Aborted;
        saved.map(|_| ())
    }

    /// Releases the instance. Forwarding subscriptions end here.
    pub fn dispose(&self) {
        self.abort_signal.cancel();
        self.disposed.cancel();
        self.state().asks.clear();
        self.unpaused.notify_one();
        debug!(task_id = %self.task_id, instance_id = %self.instance_id, "task disposed");
    }

    /// Final state of a top-level task that finished on its own.
    pub(crate) fn mark_completed(&self) {
        let usage = {
            let mut st = self.state();
            st.phase = TaskPhase::Completed;
            st.usage
        };
        self.events.publish(TaskEvent::Completed { usage });
    }

    async fn initiate_task_loop(
        self: &Arc<Self>,
        user_content: Vec<ContentBlock>,
    ) -> Result<(), TaskError> {
        let mut next = user_content;
        loop {
            self.ensure_not_aborted()?;
            self.state().phase = TaskPhase::Running;
            if !next.is_empty() {
                self.add_to_api_history(ApiMessage::user(std::mem::take(&mut next)))
                    .await?;
            }

            let turn = match self.stream_model_turn().await {
                Ok(turn) => turn,
                Err(TaskError::Model(message)) if !self.is_aborted() => {
                    warn!(task_id = %self.task_id, error = %message, "model request failed");
                    self.say(SayKind::Error, message.clone()).await?;
                    self.ask(AskKind::ApiReqFailed, Some(message)).await?;
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            self.ensure_not_aborted()?;
            self.record_turn(&turn).await?;

            let control = match turn.tool_call {
                Some(tool) => self.dispatch_tool(tool).await?,
                None => self.handle_missing_tool_use().await?,
            };
            match control {
                LoopControl::Continue(content) => next = content,
                LoopControl::Stop => return Ok(()),
            }
        }
    }

    async fn stream_model_turn(&self) -> Result<ModelTurn, TaskError> {
        let request = {
            let mut st = self.state();
            st.phase = TaskPhase::Streaming;
            st.is_waiting_for_first_chunk = true;
            let skip = std::mem::take(&mut st.skip_prev_response_id_once);
            ModelRequest {
                task_id: self.task_id.clone(),
                mode: st.mode.clone(),
                messages: st.api_messages.clone(),
                previous_response_id: if skip {
                    None
                } else {
                    st.last_response_id.clone()
                },
            }
        };

        let result = self.consume_model_stream(request).await;

        let mut st = self.state();
        st.is_waiting_for_first_chunk = false;
        if st.phase.is_aborting() {
            st.did_finish_aborting_stream = true;
        } else {
            st.phase = TaskPhase::Running;
        }
        result
    }

    async fn consume_model_stream(&self, request: ModelRequest) -> Result<ModelTurn, TaskError> {
        let cancel = self.abort_signal.clone();
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.aborted_error()),
            stream = self.model.create_message(request, cancel.child_token()) => {
                stream.map_err(|err| TaskError::Model(err.to_string()))?
            }
        };

        let mut turn = ModelTurn::default();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.aborted_error()),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk.map_err(|err| TaskError::Model(err.to_string()))?;
            self.state().is_waiting_for_first_chunk = false;
            match chunk {
                ModelChunk::TextDelta(text) => turn.text.push_str(&text),
                ModelChunk::ToolCall(call) => turn.tool_call = Some(call),
                ModelChunk::Done { usage, response_id } => {
                    if let Some(usage) = usage {
                        turn.usage = usage;
                    }
                    turn.response_id = response_id;
                }
            }
        }
        Ok(turn)
    }

    async fn record_turn(&self, turn: &ModelTurn) -> Result<(), TaskError> {
        {
            let mut st = self.state();
            st.usage.tokens_in += turn.usage.tokens_in;
            st.usage.tokens_out += turn.usage.tokens_out;
            st.usage.cache_writes += turn.usage.cache_writes;
            st.usage.cache_reads += turn.usage.cache_reads;
            st.usage.total_cost += turn.usage.total_cost;
            if turn.response_id.is_some() {
                st.last_response_id = turn.response_id.clone();
            }
        }
        let mut assistant_text = turn.text.clone();
        if let Some(call) = &turn.tool_call {
            if !assistant_text.is_empty() {
                assistant_text.push('\n');
            }
            assistant_text.push_str(&format!("[{}]", call.name()));
        }
        self.add_to_api_history(ApiMessage::assistant(assistant_text))
            .await?;
        if !turn.text.trim().is_empty() {
            self.say(SayKind::Text, turn.text.clone()).await?;
        }
        self.save_history().await?;
        Ok(())
    }

    async fn dispatch_tool(self: &Arc<Self>, tool: ToolCall) -> Result<LoopControl, TaskError> {
        debug!(task_id = %self.task_id, tool = tool.name(), "dispatching tool");
        match tool {
            ToolCall::NewTask {
                message,
                todos,
                mode,
            } => {
                self.reset_mistakes();
                match self.start_subtask(message, todos, mode).await? {
                    SubtaskStart::Delegated { .. } => Ok(LoopControl::Stop),
                    SubtaskStart::Paused { .. } => {
                        self.wait_for_subtask().await?;
                        Ok(LoopControl::Continue(Vec::new()))
                    }
                }
            }
            ToolCall::AttemptCompletion { result } => {
                match attempt_completion(self, &result).await? {
                    CompletionOutcome::Blocked(message) => {
                        Ok(LoopControl::Continue(vec![ContentBlock::text(message)]))
                    }
                    CompletionOutcome::Delegated | CompletionOutcome::Completed => {
                        Ok(LoopControl::Stop)
                    }
                }
            }
            ToolCall::UpdateTodoList { todos } => {
                self.reset_mistakes();
                self.set_todos(todos);
                Ok(LoopControl::Continue(vec![ContentBlock::text(
                    TODO_LIST_UPDATED_TEXT,
                )]))
            }
            ToolCall::AskFollowup { question } => {
                self.reset_mistakes();
                self.ask(AskKind::Followup, Some(question)).await?;
                Ok(LoopControl::Stop)
            }
        }
    }

    async fn handle_missing_tool_use(&self) -> Result<LoopControl, TaskError> {
        let count = self.record_mistake();
        let limit = self.config().consecutive_mistake_limit;
        if limit > 0 && count >= limit {
            warn!(task_id = %self.task_id, count, "consecutive mistake limit reached");
            self.ask(
                AskKind::MistakeLimitReached,
                Some(format!("The model failed to use a tool {count} times in a row.")),
            )
            .await?;
            return Ok(LoopControl::Stop);
        }
        Ok(LoopControl::Continue(vec![ContentBlock::text(
            NO_TOOLS_USED_NUDGE,
        )]))
    }

    pub async fn say(&self, kind: SayKind, text: impl Into<String>) -> Result<(), TaskError> {
        self.ensure_not_aborted()?;
        self.state().ui_messages.push(UiMessage::say(kind, text));
        self.persist_ui_log().await
    }

    /// Records an ask in its slot. Slots are independent; a new ask replaces
    /// only the one in the same slot.
    pub async fn ask(&self, kind: AskKind, text: Option<String>) -> Result<(), TaskError> {
        self.ensure_not_aborted()?;
        let message = UiMessage::ask(kind, text.clone());
        {
            let mut st = self.state();
            *st.asks.slot_mut(kind.slot()) = Some(PendingAsk {
                kind,
                text,
                ts: message.ts,
            });
            st.ui_messages.push(message);
            if st.phase != TaskPhase::Completed {
                st.phase = TaskPhase::Idle;
            }
        }
        self.persist_ui_log().await?;
        self.events.publish(match kind.slot() {
            AskSlot::Idle => TaskEvent::Idle,
            AskSlot::Resumable => TaskEvent::Resumable,
            AskSlot::Interactive => TaskEvent::Interactive,
        });
        Ok(())
    }

    /// Clears the pending ask of `kind` and continues the task when the
    /// answer calls for it. Returns false when no such ask was pending.
    pub fn answer_ask(self: &Arc<Self>, kind: AskKind, response: Option<String>) -> bool {
        let cleared = {
            let mut st = self.state();
            let slot = st.asks.slot_mut(kind.slot());
            if slot.as_ref().is_some_and(|ask| ask.kind == kind) {
                *slot = None;
                true
            } else {
                false
            }
        };
        if !cleared || self.is_aborted() {
            return cleared;
        }

        let response = response.filter(|text| !text.trim().is_empty());
        let content = match kind {
            AskKind::ResumeTask | AskKind::ResumeCompletedTask => {
                let mut content = vec![ContentBlock::text(TASK_RESUMPTION_TEXT)];
                content.extend(response.map(ContentBlock::text));
                Some(content)
            }
            AskKind::ApiReqFailed => Some(Vec::new()),
            AskKind::MistakeLimitReached => {
                self.reset_mistakes();
                response.map(|text| vec![ContentBlock::text(text)])
            }
            AskKind::CompletionResult
            | AskKind::Followup
            | AskKind::Tool
            | AskKind::Command => response.map(|text| vec![ContentBlock::text(text)]),
        };
        if let Some(content) = content {
            self.spawn_loop(content);
        }
        true
    }

    /// Posts a checkpoint notice unless the task is already being torn down.
    /// Never fails; problems are logged.
    pub async fn notify_checkpoint_saved(&self, commit_hash: &str) {
        let (enabled, aborted, abandoned) = {
            let st = self.state();
            (st.enable_checkpoints, st.phase.is_aborting(), st.abandoned)
        };
        if !enabled {
            return;
        }
        if aborted || abandoned {
            debug!(
                task_id = %self.task_id,
                "skipping checkpoint_saved say (task aborted/abandoned)"
            );
            return;
        }
        match self.say(SayKind::CheckpointSaved, commit_hash).await {
            Ok(()) => {}
            Err(err) if err.is_abort_shaped() => {
                debug!(
                    task_id = %self.task_id,
                    error = %err,
                    "checkpoint_saved say aborted (expected during disposal)"
                );
            }
            Err(err) => {
                error!(
                    task_id = %self.task_id,
                    error = %err,
                    "caught unexpected error in say('checkpoint_saved'), disabling checkpoints"
                );
                self.state().enable_checkpoints = false;
            }
        }
    }

    /// `new_task` tool. Delegates through the manager, or pauses this task
    /// under a child when metadata-driven subtasks are switched off.
    pub async fn start_subtask(
        self: &Arc<Self>,
        message: String,
        initial_todos: Vec<TodoItem>,
        mode: String,
    ) -> Result<SubtaskStart, TaskError> {
        let host = self.host()?;
        if host.config().metadata_driven_subtasks() {
            let child = host
                .delegate_parent_and_open_child(DelegateParams {
                    parent_task_id: self.task_id.clone(),
                    message,
                    initial_todos,
                    mode,
                })
                .await
                .map_err(|err| TaskError::Subtask(err.to_string()))?;
            return Ok(SubtaskStart::Delegated {
                child_task_id: child.task_id().to_string(),
            });
        }

        host.handle_mode_switch(&mode).await;
        let child = host.create_subtask(self, message, initial_todos).await?;
        let child_task_id = child.task_id().to_string();
        {
            let mut st = self.state();
            st.is_paused = true;
            st.child_task_id = Some(child_task_id.clone());
        }
        info!(task_id = %self.task_id, child_task_id = %child_task_id, "paused for subtask");
        self.events.publish(TaskEvent::Paused);
        self.events.publish(TaskEvent::Spawned {
            child_task_id: child_task_id.clone(),
        });
        Ok(SubtaskStart::Paused { child_task_id })
    }

    async fn wait_for_subtask(&self) -> Result<(), TaskError> {
        while self.is_paused() {
            self.ensure_not_aborted()?;
            tokio::select! {
                _ = self.unpaused.notified() => {}
                _ = self.abort_signal.cancelled() => return Err(self.aborted_error()),
            }
        }
        self.ensure_not_aborted()
    }

    /// Pause-based flow: the child finished with `last_message`.
    pub async fn complete_subtask(&self, last_message: &str) -> Result<(), TaskError> {
        {
            let mut st = self.state();
            st.is_paused = false;
            st.child_task_id = None;
        }
        info!(task_id = %self.task_id, "subtask completed, unpausing");
        self.events.publish(TaskEvent::Unpaused);

        let result = async {
            self.say(SayKind::SubtaskResult, last_message).await?;
            self.add_to_api_history(ApiMessage::user(vec![ContentBlock::text(format!(
                "[new_task completed] Result: {last_message}"
            ))]))
            .await
        }
        .await;
        self.unpaused.notify_one();
        result
    }

    /// Snapshot of this task's core metadata. Delegation fields are left
    /// unset so a routine save preserves them.
    pub fn history_item(&self) -> HistoryItem {
        let st = self.state();
        let size = serde_json::to_vec(&st.api_messages)
            .ok()
            .zip(serde_json::to_vec(&st.ui_messages).ok())
            .map(|(api, ui)| (api.len() + ui.len()) as u64);
        HistoryItem {
            id: self.task_id.clone(),
            number: self.task_number,
            ts: now_ms(),
            task: st.task_text.clone(),
            tokens_in: st.usage.tokens_in,
            tokens_out: st.usage.tokens_out,
            cache_writes: (st.usage.cache_writes > 0).then_some(st.usage.cache_writes),
            cache_reads: (st.usage.cache_reads > 0).then_some(st.usage.cache_reads),
            total_cost: st.usage.total_cost,
            size,
            workspace: self.workspace.clone(),
            mode: Some(st.mode.clone()),
            parent_task_id: self.parent_task_id.clone(),
            root_task_id: self.root_task_id.clone(),
            ..HistoryItem::default()
        }
    }

    pub async fn save_history(&self) -> Result<HistoryItem, TaskError> {
        Ok(self
            .store
            .write(HistoryUpdate::partial(self.history_item()))
            .await?)
    }

    async fn add_to_api_history(&self, message: ApiMessage) -> Result<(), TaskError> {
        self.state().api_messages.push(message);
        self.persist_api_log().await
    }

    async fn persist_ui_log(&self) -> Result<(), TaskError> {
        let snapshot = self.state().ui_messages.clone();
        self.store
            .overwrite_ui_log(&self.task_id, snapshot)
            .await?;
        Ok(())
    }

    async fn persist_api_log(&self) -> Result<(), TaskError> {
        let snapshot = self.state().api_messages.clone();
        self.store
            .overwrite_api_log(&self.task_id, snapshot)
            .await?;
        Ok(())
    }
}
