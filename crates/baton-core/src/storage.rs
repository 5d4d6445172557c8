use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::sync::RwLock;

use baton_types::{merge_history_item, ApiMessage, HistoryItem, HistoryUpdate, UiMessage};

use crate::error::HistoryError;

const HISTORY_FILE: &str = "task_history.json";
const TASKS_DIR: &str = "tasks";
const UI_LOG_FILE: &str = "ui_messages.json";
const API_LOG_FILE: &str = "api_conversation_history.json";

/// Durable task metadata and message logs.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn read(&self, task_id: &str) -> Result<HistoryItem, HistoryError>;

    /// Applies the reconciling merge against the stored record and returns
    /// what was persisted.
    async fn write(&self, update: HistoryUpdate) -> Result<HistoryItem, HistoryError>;

    async fn list(&self) -> Result<Vec<HistoryItem>, HistoryError>;

    async fn read_ui_log(&self, task_id: &str) -> Result<Vec<UiMessage>, HistoryError>;

    async fn read_api_log(&self, task_id: &str) -> Result<Vec<ApiMessage>, HistoryError>;

    async fn overwrite_ui_log(
        &self,
        task_id: &str,
        messages: Vec<UiMessage>,
    ) -> Result<(), HistoryError>;

    async fn overwrite_api_log(
        &self,
        task_id: &str,
        messages: Vec<ApiMessage>,
    ) -> Result<(), HistoryError>;
}

/// JSON file store: one `task_history.json` index plus
/// `tasks/<id>/{ui_messages,api_conversation_history}.json`.
pub struct FileHistoryStore {
    base: PathBuf,
    items: RwLock<HashMap<String, HistoryItem>>,
}

impl FileHistoryStore {
    pub async fn new(base: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(base.join(TASKS_DIR)).await?;
        let history_file = base.join(HISTORY_FILE);
        let items = if history_file.exists() {
            let raw = fs::read_to_string(&history_file).await?;
            serde_json::from_str::<Vec<HistoryItem>>(&raw)?
                .into_iter()
                .map(|item| (item.id.clone(), item))
                .collect()
        } else {
            HashMap::new()
        };
        Ok(Self {
            base,
            items: RwLock::new(items),
        })
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.base.join(TASKS_DIR).join(task_id)
    }

    async fn read_log<T: DeserializeOwned>(
        &self,
        task_id: &str,
        file: &str,
    ) -> Result<Vec<T>, HistoryError> {
        let path = self.task_dir(task_id).join(file);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn write_log<T: Serialize>(
        &self,
        task_id: &str,
        file: &str,
        messages: &[T],
    ) -> Result<(), HistoryError> {
        let payload = serde_json::to_string(messages)?;
        write_atomic(&self.task_dir(task_id).join(file), payload).await
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn read(&self, task_id: &str) -> Result<HistoryItem, HistoryError> {
        self.items
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| HistoryError::NotFound(task_id.to_string()))
    }

    async fn write(&self, update: HistoryUpdate) -> Result<HistoryItem, HistoryError> {
        // Held across the flush so concurrent saves land on disk in order.
        let mut items = self.items.write().await;
        let merged = merge_history_item(items.get(update.task_id()), update);

        let mut snapshot = items.values().cloned().collect::<Vec<_>>();
        match snapshot.iter_mut().find(|item| item.id == merged.id) {
            Some(slot) => *slot = merged.clone(),
            None => snapshot.push(merged.clone()),
        }
        snapshot.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.id.cmp(&b.id)));
        let payload = serde_json::to_string_pretty(&snapshot)?;
        write_atomic(&self.base.join(HISTORY_FILE), payload).await?;

        items.insert(merged.id.clone(), merged.clone());
        Ok(merged)
    }

    async fn list(&self) -> Result<Vec<HistoryItem>, HistoryError> {
        let mut all = self.items.read().await.values().cloned().collect::<Vec<_>>();
        all.sort_by(|a, b| b.ts.cmp(&a.ts).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn read_ui_log(&self, task_id: &str) -> Result<Vec<UiMessage>, HistoryError> {
        self.read_log(task_id, UI_LOG_FILE).await
    }

    async fn read_api_log(&self, task_id: &str) -> Result<Vec<ApiMessage>, HistoryError> {
        self.read_log(task_id, API_LOG_FILE).await
    }

    async fn overwrite_ui_log(
        &self,
        task_id: &str,
        messages: Vec<UiMessage>,
    ) -> Result<(), HistoryError> {
        self.write_log(task_id, UI_LOG_FILE, &messages).await
    }

    async fn overwrite_api_log(
        &self,
        task_id: &str,
        messages: Vec<ApiMessage>,
    ) -> Result<(), HistoryError> {
        self.write_log(task_id, API_LOG_FILE, &messages).await
    }
}

async fn write_atomic(path: &Path, payload: String) -> Result<(), HistoryError> {
    let write = async {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, payload).await?;
        fs::rename(&tmp, path).await
    };
    write
        .await
        .map_err(|err| HistoryError::Write(format!("{}: {err}", path.display())))
}
