use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use baton_types::ApiEvent;

use crate::event_bus::EventBus;
use crate::provider::{CreateTaskOptions, TaskStackManager};
use crate::task::Task;

/// Outward event surface. Re-emits task lifecycle events and the manager's
/// delegation events as [`ApiEvent`]s on a single bus.
///
/// Events from one source keep their order. Events from different tasks, or
/// from a task and the manager, are forwarded by separate loops and may
/// interleave.
pub struct Api {
    manager: Arc<TaskStackManager>,
    events: EventBus<ApiEvent>,
    shutdown: CancellationToken,
}

impl Api {
    pub fn new(manager: Arc<TaskStackManager>) -> Arc<Self> {
        let api = Arc::new(Self {
            manager,
            events: EventBus::new(),
            shutdown: CancellationToken::new(),
        });

        let bus = api.events.clone();
        api.manager
            .on_task_created(Arc::new(move |task: &Arc<Task>| {
                forward_task_events(task, bus.clone());
            }));
        forward_provider_events(
            api.manager.subscribe(),
            api.events.clone(),
            api.shutdown.clone(),
        );
        api
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApiEvent> {
        self.events.subscribe()
    }

    pub fn manager(&self) -> &Arc<TaskStackManager> {
        &self.manager
    }

    /// Opens `message` as a new top-level task.
    pub async fn start_new_task(&self, message: &str) -> Arc<Task> {
        self.manager
            .create_task(message, CreateTaskOptions::default())
            .await
    }
}

impl Drop for Api {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Subscribes before returning so nothing the task emits afterwards is
/// missed. Forwarding stops when the task is disposed.
fn forward_task_events(task: &Arc<Task>, bus: EventBus<ApiEvent>) {
    let mut rx = task.subscribe();
    let disposed = task.disposal_token();
    let task_id = task.task_id().to_string();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                received = rx.recv() => match received {
                    Ok(event) => bus.publish(ApiEvent::from_task_event(&task_id, event)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(task_id = %task_id, skipped, "task event forwarder lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = disposed.cancelled() => break,
            }
        }
        debug!(task_id = %task_id, "task event forwarding stopped");
    });
}

fn forward_provider_events(
    mut rx: broadcast::Receiver<baton_types::ProviderEvent>,
    bus: EventBus<ApiEvent>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                received = rx.recv() => match received {
                    Ok(event) => bus.publish(ApiEvent::from(event)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "provider event forwarder lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{LogNotifier, ModeSwitcher};
    use crate::config::CoreConfig;
    use crate::model::{ModelClient, ModelRequest, ModelStream};
    use crate::provider::ProviderDeps;
    use crate::storage::FileHistoryStore;
    use async_trait::async_trait;
    use tokio::time::{timeout, Duration};

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

    async fn next_of(
        rx: &mut broadcast::Receiver<ApiEvent>,
        wanted: &str,
    ) -> ApiEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event");
                if event.event_type() == wanted {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn forwards_creation_and_lifecycle_events_with_task_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileHistoryStore::new(dir.path()).await.expect("store");
        let manager = TaskStackManager::new(ProviderDeps {
            store: Arc::new(store),
            model: Arc::new(SilentModel),
            mode_switcher: Arc::new(AcceptAllModes),
            notifier: Arc::new(LogNotifier),
            config: CoreConfig::default(),
            workspace: None,
        });
        let api = Api::new(manager);
        let mut rx = api.subscribe();

        let task = api.start_new_task("hello").await;

        let created = next_of(&mut rx, "task.created").await;
        assert_eq!(
            created,
            ApiEvent::TaskCreated {
                task_id: task.task_id().to_string()
            }
        );
        let started = next_of(&mut rx, "task.started").await;
        assert_eq!(
            started,
            ApiEvent::TaskStarted {
                task_id: task.task_id().to_string()
            }
        );

        api.manager().remove_from_stack().await.expect("close");
        let aborted = next_of(&mut rx, "task.aborted").await;
        assert_eq!(
            aborted,
            ApiEvent::TaskAborted {
                task_id: task.task_id().to_string()
            }
        );
    }
}
