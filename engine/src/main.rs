use std::path::{Path, PathBuf};

use anyhow::Context;
use baton_core::{ConfigStore, FileHistoryStore, HistoryStore};
use baton_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use clap::{Parser, Subcommand};
use tracing::info;

mod history_view;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "baton-engine")]
#[command(about = "Inspect Baton task history, delegation trees and configuration")]
struct Cli {
    /// Project config file. Defaults to `.baton/config.json` in the working directory.
    #[arg(long, env = "BATON_CONFIG", global = true)]
    config: Option<String>,
    /// Overrides the history storage directory for this invocation.
    #[arg(long, global = true)]
    storage_dir: Option<String>,
    #[arg(long, global = true)]
    metadata_driven_subtasks: Option<bool>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryCommand {
    List {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    Show {
        task_id: String,
        #[arg(long, default_value_t = false)]
        json: bool,
        /// Also print the UI log.
        #[arg(long, default_value_t = false)]
        messages: bool,
    },
    Tree {
        task_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Show {
        #[arg(long, default_value_t = false)]
        layers: bool,
    },
    /// Writes `key` (dot-separated path) into the project config.
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let overrides = build_cli_overrides(cli.storage_dir, cli.metadata_driven_subtasks);
    let config_path = resolve_config_path(cli.config);
    let config = ConfigStore::new(&config_path, overrides)
        .await
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    let core = config.get().await;
    let storage_dir = core.resolve_storage_dir();

    let (_log_guard, log_info) = init_process_logging(
        ProcessKind::Cli,
        &canonical_logs_dir_from_root(&storage_dir),
        LOG_RETENTION_DAYS,
    )?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Cli,
        ObservabilityEvent::new("logging.initialized", "engine.main")
            .status("ok")
            .detail("cli jsonl logging initialized"),
    );
    info!("cli logging initialized: {:?}", log_info);
    log_startup_paths(&storage_dir, &config_path);

    match cli.command {
        Command::History { command } => {
            let store = FileHistoryStore::new(&storage_dir)
                .await
                .with_context(|| format!("opening history at {}", storage_dir.display()))?;
            run_history(&store, command).await?;
        }
        Command::Config { command } => match command {
            ConfigCommand::Show { layers } => {
                let value = if layers {
                    config.get_layers_value().await
                } else {
                    config.get_effective_value().await
                };
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            ConfigCommand::Set { key, value } => {
                let patch = build_config_patch(&key, &value)?;
                let effective = config.patch_project(patch).await?;
                println!("{}", serde_json::to_string_pretty(&effective)?);
            }
        },
    }

    Ok(())
}

async fn run_history(store: &FileHistoryStore, command: HistoryCommand) -> anyhow::Result<()> {
    match command {
        HistoryCommand::List { limit, json } => {
            let mut items = store.list().await?;
            if let Some(limit) = limit {
                items.truncate(limit);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if items.is_empty() {
                println!("no tasks recorded");
            } else {
                for item in &items {
                    println!("{}", history_view::list_line(item));
                }
            }
        }
        HistoryCommand::Show {
            task_id,
            json,
            messages,
        } => {
            let item = store
                .read(&task_id)
                .await
                .with_context(|| format!("task {task_id}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&item)?);
            } else {
                for line in history_view::detail_lines(&item) {
                    println!("{line}");
                }
            }
            if messages {
                let ui = store.read_ui_log(&task_id).await?;
                println!("-- {} ui messages", ui.len());
                for message in &ui {
                    println!("{}", history_view::message_line(message));
                }
            }
        }
        HistoryCommand::Tree { task_id } => {
            let items = store.list().await?;
            let tree = history_view::render_tree(&items, &task_id)
                .with_context(|| format!("task {task_id} not found in history"))?;
            println!("{tree}");
        }
    }
    Ok(())
}

fn build_cli_overrides(
    storage_dir: Option<String>,
    metadata_driven_subtasks: Option<bool>,
) -> Option<serde_json::Value> {
    if storage_dir.is_none() && metadata_driven_subtasks.is_none() {
        return None;
    }
    let mut root = serde_json::Map::new();
    if let Some(dir) = storage_dir.filter(|d| !d.trim().is_empty()) {
        root.insert("storage_dir".to_string(), serde_json::Value::String(dir));
    }
    if let Some(enabled) = metadata_driven_subtasks {
        root.insert(
            "experiments".to_string(),
            serde_json::json!({ "metadata_driven_subtasks": enabled }),
        );
    }
    Some(serde_json::Value::Object(root))
}

/// `a.b.c=value` as a nested JSON object. The value is parsed as JSON when it
/// can be, otherwise kept as a string.
fn build_config_patch(key: &str, raw: &str) -> anyhow::Result<serde_json::Value> {
    let segments: Vec<&str> = key.split('.').map(str::trim).collect();
    if segments.iter().any(|s| s.is_empty()) {
        anyhow::bail!("invalid config key `{key}`");
    }
    let mut value = serde_json::from_str::<serde_json::Value>(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    for segment in segments.iter().rev() {
        let mut map = serde_json::Map::new();
        map.insert((*segment).to_string(), value);
        value = serde_json::Value::Object(map);
    }
    Ok(value)
}

fn resolve_config_path(flag: Option<String>) -> PathBuf {
    match flag.filter(|p| !p.trim().is_empty()) {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(".baton").join("config.json"),
    }
}

fn log_startup_paths(storage_dir: &Path, config_path: &Path) {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!(
        "startup paths: cwd={} storage_dir={} config_path={}",
        cwd.display(),
        storage_dir.display(),
        config_path.display()
    );
}
