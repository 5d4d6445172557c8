use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};

use baton_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use baton_types::{
    ApiMessage, HistoryItem, HistoryUpdate, ProviderEvent, TaskStatus, TodoItem, UiMessage,
};

use crate::collaborators::{ModeSwitcher, UiNotifier};
use crate::config::CoreConfig;
use crate::error::{DelegationError, HistoryError, TaskError};
use crate::event_bus::EventBus;
use crate::host::{DelegateParams, ReopenParams, TaskHost};
use crate::model::ModelClient;
use crate::storage::HistoryStore;
use crate::task::{FreshTask, Task, TaskDeps, TaskInit, DEFAULT_MODE};

/// Called synchronously for every new task before it is started.
pub type TaskCreatedHook = Arc<dyn Fn(&Arc<Task>) + Send + Sync>;

pub struct ProviderDeps {
    pub store: Arc<dyn HistoryStore>,
    pub model: Arc<dyn ModelClient>,
    pub mode_switcher: Arc<dyn ModeSwitcher>,
    pub notifier: Arc<dyn UiNotifier>,
    pub config: CoreConfig,
    pub workspace: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateTaskOptions {
    /// Set for subtasks. A task created without a parent is top-level and
    /// replaces whatever is open.
    pub parent: Option<Arc<Task>>,
    pub initial_todos: Vec<TodoItem>,
    pub mode: Option<String>,
}

/// Owns the stack of open tasks. The top of the stack is the foreground
/// task; the stack is only ever mutated here.
pub struct TaskStackManager {
    self_ref: Weak<TaskStackManager>,
    stack: Mutex<Vec<Arc<Task>>>,
    store: Arc<dyn HistoryStore>,
    model: Arc<dyn ModelClient>,
    mode_switcher: Arc<dyn ModeSwitcher>,
    notifier: Arc<dyn UiNotifier>,
    config: CoreConfig,
    workspace: Option<String>,
    current_mode: Mutex<String>,
    events: EventBus<ProviderEvent>,
    created_hooks: Mutex<Vec<TaskCreatedHook>>,
    next_task_number: AtomicU32,
}

impl TaskStackManager {
    pub fn new(deps: ProviderDeps) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            stack: Mutex::new(Vec::new()),
            store: deps.store,
            model: deps.model,
            mode_switcher: deps.mode_switcher,
            notifier: deps.notifier,
            config: deps.config,
            workspace: deps.workspace,
            current_mode: Mutex::new(DEFAULT_MODE.to_string()),
            events: EventBus::new(),
            created_hooks: Mutex::new(Vec::new()),
            next_task_number: AtomicU32::new(1),
        })
    }

    fn lock_stack(&self) -> MutexGuard<'_, Vec<Arc<Task>>> {
        self.stack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    pub fn on_task_created(&self, hook: TaskCreatedHook) {
        self.created_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    pub fn store(&self) -> Arc<dyn HistoryStore> {
        Arc::clone(&self.store)
    }

    pub fn current_mode(&self) -> String {
        self.current_mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn task_stack_ids(&self) -> Vec<String> {
        self.lock_stack()
            .iter()
            .map(|task| task.task_id().to_string())
            .collect()
    }

    pub fn stack_len(&self) -> usize {
        self.lock_stack().len()
    }

    fn task_deps(&self) -> TaskDeps {
        let host: Weak<dyn TaskHost> = self.self_ref.clone();
        TaskDeps {
            host,
            model: Arc::clone(&self.model),
            store: Arc::clone(&self.store),
            config: self.config(),
            workspace: self.workspace.clone(),
        }
    }

    /// Hooks run first so listeners are attached before the task can emit.
    fn register_task(&self, task: &Arc<Task>) {
        let hooks = self
            .created_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in hooks {
            hook(task);
        }
        self.events.publish(ProviderEvent::TaskCreated {
            task_id: task.task_id().to_string(),
        });
        self.lock_stack().push(Arc::clone(task));
        info!(
            task_id = %task.task_id(),
            instance_id = %task.instance_id(),
            stack = self.stack_len(),
            "task added to stack"
        );
    }

    async fn close_current_for_top_level(&self) {
        if let Err(err) = self.remove_from_stack().await {
            warn!(error = %err, "error closing the open task before a top-level create");
        }
    }

    pub async fn create_task(
        &self,
        message: impl Into<String>,
        options: CreateTaskOptions,
    ) -> Arc<Task> {
        let CreateTaskOptions {
            parent,
            initial_todos,
            mode,
        } = options;
        if parent.is_none() {
            self.close_current_for_top_level().await;
        }

        let (parent_task_id, root_task_id) = match &parent {
            Some(parent) => (
                Some(parent.task_id().to_string()),
                Some(
                    parent
                        .root_task_id()
                        .unwrap_or(parent.task_id())
                        .to_string(),
                ),
            ),
            None => (None, None),
        };
        let task = Task::new(
            TaskInit::Fresh(FreshTask {
                message: message.into(),
                initial_todos,
                task_number: self.next_task_number.fetch_add(1, Ordering::SeqCst),
                parent_task_id,
                root_task_id,
                mode: mode.unwrap_or_else(|| self.current_mode()),
            }),
            self.task_deps(),
        );
        self.register_task(&task);
        task.start();
        task
    }

    /// Reopens a persisted task as the new top-level task.
    pub async fn create_task_with_history_item(
        &self,
        item: HistoryItem,
        start_task: bool,
    ) -> Arc<Task> {
        self.close_current_for_top_level().await;
        let task = Task::new(TaskInit::FromHistory(item), self.task_deps());
        self.register_task(&task);
        if start_task {
            task.start();
        }
        task
    }

    /// Closes the top of the stack: abort as abandoned, then dispose.
    pub async fn remove_from_stack(&self) -> Result<(), TaskError> {
        let popped = { self.lock_stack().pop() };
        let Some(task) = popped else {
            return Ok(());
        };
        info!(task_id = %task.task_id(), instance_id = %task.instance_id(), "closing task");
        let aborted = task.abort_task(true).await;
        task.dispose();
        aborted
    }

    /// Closes every open task, top first.
    pub async fn clear_stack(&self) {
        while self.stack_len() > 0 {
            if let Err(err) = self.remove_from_stack().await {
                warn!(error = %err, "error while clearing task stack");
            }
        }
    }

    pub async fn update_task_history(
        &self,
        update: HistoryUpdate,
    ) -> Result<HistoryItem, HistoryError> {
        self.store.write(update).await
    }

    pub async fn handle_mode_switch(&self, mode: &str) {
        match self.mode_switcher.switch_mode(mode).await {
            Ok(()) => {
                *self
                    .current_mode
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = mode.to_string();
            }
            Err(err) => warn!(mode, error = %err, "mode switch failed"),
        }
    }

    /// Closes `parent`, opens a child in its place and records the
    /// delegation on the parent's persisted record.
    pub async fn delegate_parent_and_open_child(
        &self,
        params: DelegateParams,
    ) -> Result<Arc<Task>, DelegationError> {
        let DelegateParams {
            parent_task_id,
            message,
            initial_todos,
            mode,
        } = params;

        let Some(parent) = self
            .current_task()
            .filter(|task| task.task_id() == parent_task_id)
        else {
            return Err(DelegationError::TargetNotFound(parent_task_id));
        };

        let existing = match self.store.read(&parent_task_id).await {
            Ok(item) => Some(item),
            Err(HistoryError::NotFound(_)) => None,
            Err(err) => return Err(err.into()),
        };
        if let Some(child_task_id) = existing
            .as_ref()
            .filter(|record| record.is_delegated())
            .and_then(|record| record.awaiting_child_id.clone())
        {
            return Err(DelegationError::AlreadyDelegated {
                parent_task_id,
                child_task_id,
            });
        }

        if let Err(err) = self.remove_from_stack().await {
            let err = DelegationError::ParentDisposal(err.to_string());
            let detail = err.to_string();
            warn!(parent_task_id = %parent_task_id, "{detail}");
            emit_event(
                Level::WARN,
                ProcessKind::Engine,
                ObservabilityEvent::new("task.delegate.parent_disposal_failed", "provider")
                    .parent(&parent_task_id)
                    .error_code("PARENT_DISPOSAL")
                    .detail(&detail),
            );
        }

        let child = self
            .create_task(
                message,
                CreateTaskOptions {
                    parent: Some(Arc::clone(&parent)),
                    initial_todos,
                    mode: Some(mode.clone()),
                },
            )
            .await;
        let child_task_id = child.task_id().to_string();

        let mut item = parent.history_item();
        item.status = Some(TaskStatus::Delegated);
        item.delegated_to_id = Some(child_task_id.clone());
        item.awaiting_child_id = Some(child_task_id.clone());
        item.child_ids = existing.and_then(|record| record.child_ids);
        item.push_child(&child_task_id);
        if let Err(err) = self.update_task_history(HistoryUpdate::partial(item)).await {
            self.abandon_child_after_failed_delegation(&parent_task_id, &child_task_id, &err)
                .await;
            return Err(err.into());
        }

        self.handle_mode_switch(&mode).await;

        info!(
            parent_task_id = %parent_task_id,
            child_task_id = %child_task_id,
            "delegated to child"
        );
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("task.delegated", "provider")
                .parent(&parent_task_id)
                .child(&child_task_id)
                .status(TaskStatus::Delegated.as_str()),
        );
        self.events.publish(ProviderEvent::TaskDelegated {
            parent_task_id,
            child_task_id,
        });
        Ok(child)
    }

    /// Marks the delegation complete, hands the child's summary to the
    /// parent's logs, closes the child and resumes the parent from its
    /// persisted record. Only the metadata write can fail the call.
    pub async fn reopen_parent_from_delegation(&self, params: ReopenParams) -> Result<(), TaskError> {
        let ReopenParams {
            parent_task_id,
            child_task_id,
            completion_result_summary: summary,
        } = params;

        let mut record = self.store.read(&parent_task_id).await?;
        record.status = Some(TaskStatus::Active);
        record.completed_by_child_id = Some(child_task_id.clone());
        record.completion_result_summary = Some(summary.clone());
        record.awaiting_child_id = None;
        record.push_child(&child_task_id);
        let saved = self
            .update_task_history(HistoryUpdate::replace(record))
            .await?;

        let redacted = redact_text(&summary);
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("task.delegation.completed", "provider")
                .parent(&parent_task_id)
                .child(&child_task_id)
                .status(TaskStatus::Active.as_str())
                .detail(&redacted),
        );
        self.events.publish(ProviderEvent::TaskDelegationCompleted {
            parent_task_id: parent_task_id.clone(),
            child_task_id: child_task_id.clone(),
            summary: summary.clone(),
        });

        if let Err(err) = self
            .inject_subtask_result(&parent_task_id, &child_task_id, &summary)
            .await
        {
            self.report_resume_failure(&parent_task_id, "injecting the subtask result", &err);
        }

        if let Err(err) = self.remove_from_stack().await {
            self.report_resume_failure(&parent_task_id, "closing the child task", &err);
        }

        let parent = self.create_task_with_history_item(saved, false).await;
        parent.set_skip_prev_response_id_once(true);

        self.events.publish(ProviderEvent::TaskDelegationResumed {
            parent_task_id: parent_task_id.clone(),
            child_task_id: child_task_id.clone(),
        });

        if let Err(err) = parent.resume_after_delegation().await {
            self.report_resume_failure(&parent_task_id, "resuming the parent task", &err);
        }
        info!(
            parent_task_id = %parent_task_id,
            child_task_id = %child_task_id,
            "parent reopened after delegation"
        );
        Ok(())
    }

    /// The parent is already closed, so a child without a recorded
    /// delegation has nothing to return to. Close it and tell the user.
    async fn abandon_child_after_failed_delegation(
        &self,
        parent_task_id: &str,
        child_task_id: &str,
        err: &HistoryError,
    ) {
        let detail = format!("recording delegation to {child_task_id} failed: {err}");
        error!(parent_task_id = %parent_task_id, child_task_id = %child_task_id, "[delegate] {detail}");
        emit_event(
            Level::ERROR,
            ProcessKind::Engine,
            ObservabilityEvent::new("task.delegate.persist_failed", "provider")
                .parent(parent_task_id)
                .child(child_task_id)
                .error_code("DELEGATION_WRITE_FAILED")
                .detail(&detail),
        );
        let child_on_top = self
            .current_task()
            .is_some_and(|task| task.task_id() == child_task_id);
        if child_on_top {
            if let Err(close_err) = self.remove_from_stack().await {
                warn!(child_task_id = %child_task_id, error = %close_err, "error closing undelegated child");
            }
        }
        self.report_error(&format!("Could not delegate task {parent_task_id}: {detail}"));
    }

    async fn inject_subtask_result(
        &self,
        parent_task_id: &str,
        child_task_id: &str,
        summary: &str,
    ) -> Result<(), HistoryError> {
        let mut ui = self.store.read_ui_log(parent_task_id).await?;
        ui.push(UiMessage::subtask_result(summary));
        self.store.overwrite_ui_log(parent_task_id, ui).await?;

        let mut api = self.store.read_api_log(parent_task_id).await?;
        api.push(ApiMessage::subtask_completed(child_task_id, summary));
        self.store.overwrite_api_log(parent_task_id, api).await
    }

    fn report_resume_failure(
        &self,
        parent_task_id: &str,
        step: &str,
        err: &dyn std::fmt::Display,
    ) {
        let detail = format!("{step} failed: {err}");
        error!(parent_task_id = %parent_task_id, "[reopen] {detail}");
        emit_event(
            Level::ERROR,
            ProcessKind::Engine,
            ObservabilityEvent::new("task.delegation.resume_failed", "provider")
                .parent(parent_task_id)
                .error_code("RESUME_STEP_FAILED")
                .detail(&detail),
        );
        self.notifier
            .show_error(&format!("Could not fully resume task {parent_task_id}: {detail}"));
    }

    /// Pause-based flow: closes the finished child and wakes its parent.
    pub async fn finish_subtask(&self, last_message: &str) -> Result<(), TaskError> {
        self.remove_from_stack().await?;
        if let Some(parent) = self.current_task() {
            parent.complete_subtask(last_message).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHost for TaskStackManager {
    fn config(&self) -> CoreConfig {
        self.config.clone()
    }

    fn find_task(&self, task_id: &str) -> Option<Arc<Task>> {
        self.lock_stack()
            .iter()
            .find(|task| task.task_id() == task_id)
            .cloned()
    }

    fn current_task(&self) -> Option<Arc<Task>> {
        self.lock_stack().last().cloned()
    }

    fn report_error(&self, message: &str) {
        self.notifier.show_error(message);
    }

    async fn delegate_parent_and_open_child(
        &self,
        params: DelegateParams,
    ) -> Result<Arc<Task>, DelegationError> {
        TaskStackManager::delegate_parent_and_open_child(self, params).await
    }

    async fn reopen_parent_from_delegation(&self, params: ReopenParams) -> Result<(), TaskError> {
        TaskStackManager::reopen_parent_from_delegation(self, params).await
    }

    async fn create_subtask(
        &self,
        parent: &Arc<Task>,
        message: String,
        initial_todos: Vec<TodoItem>,
    ) -> Result<Arc<Task>, TaskError> {
        Ok(self
            .create_task(
                message,
                CreateTaskOptions {
                    parent: Some(Arc::clone(parent)),
                    initial_todos,
                    mode: None,
                },
            )
            .await)
    }

    async fn finish_subtask(&self, result: &str) -> Result<(), TaskError> {
        TaskStackManager::finish_subtask(self, result).await
    }

    async fn handle_mode_switch(&self, mode: &str) {
        TaskStackManager::handle_mode_switch(self, mode).await
    }

    async fn update_task_history(
        &self,
        update: HistoryUpdate,
    ) -> Result<HistoryItem, HistoryError> {
        TaskStackManager::update_task_history(self, update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelRequest, ModelStream};
    use crate::storage::FileHistoryStore;
    use tokio_util::sync::CancellationToken;

    struct SilentModel;

    #[async_trait]
    impl ModelClient for SilentModel {
        async fn create_message(
            &self,
            _request: ModelRequest,
            _cancel: CancellationToken,
        ) -> anyhow::Result<ModelStream> {
            Ok(Box::pin(futures::stream::pending()))
        }
    }

    struct AcceptAllModes;

    #[async_trait]
    impl ModeSwitcher for AcceptAllModes {
        async fn switch_mode(&self, _mode: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<String>>,
    }

    impl UiNotifier for RecordingNotifier {
        fn show_error(&self, message: &str) {
            self.messages.lock().expect("lock").push(message.to_string());
        }
    }

    async fn manager(dir: &std::path::Path) -> (Arc<TaskStackManager>, Arc<RecordingNotifier>) {
        let store = FileHistoryStore::new(dir).await.expect("store");
        let notifier = Arc::new(RecordingNotifier::default());
        let manager = TaskStackManager::new(ProviderDeps {
            store: Arc::new(store),
            model: Arc::new(SilentModel),
            mode_switcher: Arc::new(AcceptAllModes),
            notifier: notifier.clone(),
            config: CoreConfig::default(),
            workspace: Some("/tmp/ws".to_string()),
        });
        (manager, notifier)
    }

    #[tokio::test]
    async fn top_level_create_closes_only_the_top_of_the_stack() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, _) = manager(dir.path()).await;

        let first = manager
            .create_task("first", CreateTaskOptions::default())
            .await;
        let child = manager
            .create_subtask(&first, "child".to_string(), Vec::new())
            .await
            .expect("child");
        assert_eq!(manager.stack_len(), 2);

        let second = manager
            .create_task("second", CreateTaskOptions::default())
            .await;

        assert!(child.is_abandoned());
        assert!(child.is_aborted());
        assert!(!first.is_aborted());
        assert_eq!(
            manager.task_stack_ids(),
            vec![first.task_id().to_string(), second.task_id().to_string()]
        );
        assert_eq!(second.parent_task_id(), None);
    }

    #[tokio::test]
    async fn subtasks_inherit_the_root_of_their_parent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, _) = manager(dir.path()).await;

        let root = manager
            .create_task("root", CreateTaskOptions::default())
            .await;
        let child = manager
            .create_subtask(&root, "child".to_string(), Vec::new())
            .await
            .expect("child");
        let grandchild = manager
            .create_subtask(&child, "grandchild".to_string(), Vec::new())
            .await
            .expect("grandchild");

        assert_eq!(child.root_task_id(), Some(root.task_id()));
        assert_eq!(grandchild.root_task_id(), Some(root.task_id()));
        assert_eq!(grandchild.parent_task_id(), Some(child.task_id()));
        assert_eq!(manager.stack_len(), 3);
        assert!(!root.is_aborted() && !child.is_aborted());
    }

    #[tokio::test]
    async fn delegating_an_unknown_parent_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, _) = manager(dir.path()).await;

        let err = manager
            .delegate_parent_and_open_child(DelegateParams {
                parent_task_id: "missing".to_string(),
                message: "do it".to_string(),
                initial_todos: Vec::new(),
                mode: "code".to_string(),
            })
            .await
            .expect_err("unknown parent");
        assert!(matches!(err, DelegationError::TargetNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn delegating_from_a_task_below_the_top_fails_without_closing_anything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, _) = manager(dir.path()).await;
        let root = manager
            .create_task("root", CreateTaskOptions::default())
            .await;
        let sub = manager
            .create_subtask(&root, "sub".to_string(), Vec::new())
            .await
            .expect("sub");

        let err = manager
            .delegate_parent_and_open_child(DelegateParams {
                parent_task_id: root.task_id().to_string(),
                message: "do it".to_string(),
                initial_todos: Vec::new(),
                mode: "code".to_string(),
            })
            .await
            .expect_err("root is not the current task");

        assert!(matches!(err, DelegationError::TargetNotFound(ref id) if id == root.task_id()));
        assert!(!root.is_aborted());
        assert!(!sub.is_aborted());
        assert_eq!(
            manager.task_stack_ids(),
            vec![root.task_id().to_string(), sub.task_id().to_string()]
        );
    }

    #[tokio::test]
    async fn delegating_a_parent_that_is_still_waiting_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, _) = manager(dir.path()).await;
        let parent = manager
            .create_task("parent", CreateTaskOptions::default())
            .await;

        let mut item = parent.history_item();
        item.status = Some(TaskStatus::Delegated);
        item.awaiting_child_id = Some("child-a".to_string());
        manager
            .update_task_history(HistoryUpdate::partial(item))
            .await
            .expect("write");

        let err = manager
            .delegate_parent_and_open_child(DelegateParams {
                parent_task_id: parent.task_id().to_string(),
                message: "again".to_string(),
                initial_todos: Vec::new(),
                mode: "code".to_string(),
            })
            .await
            .expect_err("already delegated");
        assert!(matches!(
            err,
            DelegationError::AlreadyDelegated { ref child_task_id, .. } if child_task_id == "child-a"
        ));
        assert_eq!(manager.task_stack_ids(), vec![parent.task_id().to_string()]);
        assert!(!parent.is_aborted());
    }

    #[tokio::test]
    async fn clear_stack_closes_every_task() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, notifier) = manager(dir.path()).await;
        let root = manager
            .create_task("root", CreateTaskOptions::default())
            .await;
        let child = manager
            .create_subtask(&root, "child".to_string(), Vec::new())
            .await
            .expect("child");

        manager.clear_stack().await;

        assert_eq!(manager.stack_len(), 0);
        assert!(root.is_abandoned() && child.is_abandoned());
        tokio::task::yield_now().await;
        assert!(notifier.messages.lock().expect("lock").is_empty());
    }
}
