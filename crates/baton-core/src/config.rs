use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

pub const DEFAULT_CONSECUTIVE_MISTAKE_LIMIT: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExperimentsConfig {
    /// Subtasks close their parent and reopen it from persisted metadata
    /// instead of pausing it in place.
    #[serde(default = "default_true")]
    pub metadata_driven_subtasks: bool,
}

impl Default for ExperimentsConfig {
    fn default() -> Self {
        Self {
            metadata_driven_subtasks: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoreConfig {
    #[serde(default)]
    pub experiments: ExperimentsConfig,
    #[serde(default)]
    pub prevent_completion_with_open_todos: bool,
    #[serde(default = "default_mistake_limit")]
    pub consecutive_mistake_limit: u32,
    #[serde(default = "default_true")]
    pub enable_checkpoints: bool,
    #[serde(default)]
    pub storage_dir: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            experiments: ExperimentsConfig::default(),
            prevent_completion_with_open_todos: false,
            consecutive_mistake_limit: DEFAULT_CONSECUTIVE_MISTAKE_LIMIT,
            enable_checkpoints: true,
            storage_dir: None,
        }
    }
}

impl CoreConfig {
    pub fn metadata_driven_subtasks(&self) -> bool {
        self.experiments.metadata_driven_subtasks
    }

    /// Directory holding `task_history.json` and the per-task logs.
    pub fn resolve_storage_dir(&self) -> PathBuf {
        if let Some(dir) = self.storage_dir.as_deref().filter(|d| !d.trim().is_empty()) {
            return PathBuf::from(dir);
        }
        dirs::data_dir()
            .map(|d| d.join("baton"))
            .unwrap_or_else(|| PathBuf::from(".baton"))
    }
}

fn default_true() -> bool {
    true
}

fn default_mistake_limit() -> u32 {
    DEFAULT_CONSECUTIVE_MISTAKE_LIMIT
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

/// Layered JSON configuration: global < project < env < runtime < cli.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path().await?;
        Self::with_layers(path, global_path, env_layer(), cli_overrides).await
    }

    /// Builds a store from explicit file locations and an explicit env layer.
    pub async fn with_layers(
        path: impl AsRef<Path>,
        global_path: impl AsRef<Path>,
        env: Value,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path = path.as_ref().to_path_buf();

        let global = read_json_file(global_path.as_ref()).await?;
        let project = read_json_file(&project_path).await?;

        let layers = ConfigLayers {
            global,
            project,
            env,
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        Ok(Self {
            project_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> CoreConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = serde_json::to_value(CoreConfig::default()).unwrap_or_else(|_| empty_object());
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "runtime": layers.runtime,
            "cli": layers.cli
        })
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_runtime(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        Ok(self.get_effective_value().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating config dir {}", parent.display()))?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw)
        .await
        .with_context(|| format!("writing config {}", path.display()))?;
    Ok(())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("BATON_GLOBAL_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    if let Some(config_dir) = dirs::config_dir() {
        return Ok(config_dir.join("baton").join("config.json"));
    }
    Ok(PathBuf::from(".baton/global_config.json"))
}

pub fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();

    if let Some(v) = lookup("BATON_METADATA_DRIVEN_SUBTASKS").and_then(|v| parse_bool_like(&v)) {
        deep_merge(
            &mut root,
            &json!({ "experiments": { "metadata_driven_subtasks": v } }),
        );
    }
    if let Some(v) =
        lookup("BATON_PREVENT_COMPLETION_WITH_OPEN_TODOS").and_then(|v| parse_bool_like(&v))
    {
        deep_merge(
            &mut root,
            &json!({ "prevent_completion_with_open_todos": v }),
        );
    }
    if let Some(limit) =
        lookup("BATON_CONSECUTIVE_MISTAKE_LIMIT").and_then(|v| v.trim().parse::<u32>().ok())
    {
        deep_merge(&mut root, &json!({ "consecutive_mistake_limit": limit }));
    }
    if let Some(dir) = lookup("BATON_STORAGE_DIR") {
        if !dir.trim().is_empty() {
            deep_merge(&mut root, &json!({ "storage_dir": dir }));
        }
    }

    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_metadata_driven_subtasks() {
        let config: CoreConfig = serde_json::from_value(json!({})).expect("config");
        assert!(config.metadata_driven_subtasks());
        assert!(!config.prevent_completion_with_open_todos);
        assert_eq!(config.consecutive_mistake_limit, 3);
        assert!(config.enable_checkpoints);
    }

    #[test]
    fn env_layer_parses_bool_like_values() {
        let layer = env_layer_from(|key| match key {
            "BATON_METADATA_DRIVEN_SUBTASKS" => Some("off".to_string()),
            "BATON_PREVENT_COMPLETION_WITH_OPEN_TODOS" => Some("YES".to_string()),
            "BATON_CONSECUTIVE_MISTAKE_LIMIT" => Some("not-a-number".to_string()),
            "BATON_STORAGE_DIR" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(
            layer,
            json!({
                "experiments": { "metadata_driven_subtasks": false },
                "prevent_completion_with_open_todos": true
            })
        );
    }

    #[test]
    fn deep_merge_skips_nulls_and_merges_nested_objects() {
        let mut base = json!({ "experiments": { "metadata_driven_subtasks": true }, "storage_dir": "/a" });
        deep_merge(
            &mut base,
            &json!({ "experiments": { "other": 1 }, "storage_dir": null }),
        );
        assert_eq!(base["experiments"]["metadata_driven_subtasks"], true);
        assert_eq!(base["experiments"]["other"], 1);
        assert_eq!(base["storage_dir"], "/a");
    }

    #[tokio::test]
    async fn layers_apply_in_precedence_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let global_path = dir.path().join("global.json");
        let project_path = dir.path().join("project").join("config.json");
        std::fs::write(
            &global_path,
            r#"{"consecutive_mistake_limit": 5, "prevent_completion_with_open_todos": true}"#,
        )
        .expect("write global");

        let store = ConfigStore::with_layers(
            &project_path,
            &global_path,
            json!({ "consecutive_mistake_limit": 7 }),
            Some(json!({ "experiments": { "metadata_driven_subtasks": false } })),
        )
        .await
        .expect("store");

        let config = store.get().await;
        assert_eq!(config.consecutive_mistake_limit, 7);
        assert!(config.prevent_completion_with_open_todos);
        assert!(!config.metadata_driven_subtasks());

        store
            .patch_project(json!({ "storage_dir": "/var/baton" }))
            .await
            .expect("patch project");
        assert!(project_path.exists());
        assert_eq!(store.get().await.storage_dir.as_deref(), Some("/var/baton"));

        store
            .patch_runtime(json!({ "consecutive_mistake_limit": 1 }))
            .await
            .expect("patch runtime");
        assert_eq!(store.get().await.consecutive_mistake_limit, 1);
    }
}
