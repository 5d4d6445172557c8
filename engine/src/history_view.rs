use std::collections::{HashMap, HashSet};

use serde::Serialize;

use baton_types::{HistoryItem, UiMessage, UiMessageType};

const TASK_PREVIEW_CHARS: usize = 60;
const SUMMARY_PREVIEW_CHARS: usize = 48;

fn preview(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        return flat;
    }
    let cut: String = flat.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}

fn status_label(item: &HistoryItem) -> &'static str {
    item.status.map(|s| s.as_str()).unwrap_or("-")
}

fn delegation_note(item: &HistoryItem) -> Option<String> {
    if let (true, Some(child)) = (item.is_awaiting_child(), item.child_link_id()) {
        return Some(format!("awaiting {child}"));
    }
    if item.has_delegation_completed() {
        let child = item.completed_by_child_id.as_deref().unwrap_or("?");
        return Some(format!(
            "{child} returned: {}",
            preview(item.completion_summary(), SUMMARY_PREVIEW_CHARS)
        ));
    }
    None
}

pub fn list_line(item: &HistoryItem) -> String {
    let mut line = format!(
        "#{:<4} {} [{}] {}",
        item.number,
        item.id,
        status_label(item),
        preview(&item.task, TASK_PREVIEW_CHARS)
    );
    if let Some(note) = delegation_note(item) {
        line.push_str(&format!("  ({note})"));
    }
    line
}

pub fn detail_lines(item: &HistoryItem) -> Vec<String> {
    let mut lines = vec![
        format!("id:         {}", item.id),
        format!("number:     {}", item.number),
        format!("status:     {}", status_label(item)),
        format!("task:       {}", item.task),
        format!("mode:       {}", item.mode.as_deref().unwrap_or("-")),
        format!(
            "tokens:     {} in / {} out, cost {:.4}",
            item.tokens_in, item.tokens_out, item.total_cost
        ),
    ];
    if let Some(parent) = &item.parent_task_id {
        lines.push(format!("parent:     {parent}"));
    }
    if let Some(root) = &item.root_task_id {
        lines.push(format!("root:       {root}"));
    }
    if !item.child_ids().is_empty() {
        lines.push(format!("children:   {}", item.child_ids().join(", ")));
    }
    if let Some(note) = delegation_note(item) {
        lines.push(format!("delegation: {note}"));
    }
    lines
}

fn kind_label<T: Serialize>(kind: &Option<T>) -> String {
    kind.as_ref()
        .and_then(|k| serde_json::to_value(k).ok())
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

pub fn message_line(message: &UiMessage) -> String {
    let (tag, kind) = match message.kind {
        UiMessageType::Ask => ("ask", kind_label(&message.ask)),
        UiMessageType::Say => ("say", kind_label(&message.say)),
    };
    format!(
        "[{tag}:{kind}] {}",
        preview(message.text.as_deref().unwrap_or(""), TASK_PREVIEW_CHARS)
    )
}

/// Renders the delegation tree containing `task_id`, starting from its root.
/// Children come from `childIds` first, then from records naming the task as
/// their parent.
pub fn render_tree(items: &[HistoryItem], task_id: &str) -> Option<String> {
    let by_id: HashMap<&str, &HistoryItem> =
        items.iter().map(|item| (item.id.as_str(), item)).collect();
    let mut root = *by_id.get(task_id)?;
    let mut climbed = HashSet::from([root.id.as_str()]);
    while let Some(parent) = root
        .parent_task_id
        .as_deref()
        .and_then(|id| by_id.get(id).copied())
    {
        if !climbed.insert(parent.id.as_str()) {
            break;
        }
        root = parent;
    }

    let mut by_parent: HashMap<&str, Vec<&HistoryItem>> = HashMap::new();
    for item in items {
        if let Some(parent) = item.parent_task_id.as_deref() {
            by_parent.entry(parent).or_default().push(item);
        }
    }
    for children in by_parent.values_mut() {
        children.sort_by_key(|item| item.number);
    }

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut pending = vec![(root, 0usize)];
    while let Some((item, depth)) = pending.pop() {
        if !seen.insert(item.id.as_str()) {
            continue;
        }
        let marker = if item.id == task_id { "*" } else { " " };
        out.push(format!("{}{marker}{}", "  ".repeat(depth), list_line(item)));

        let mut children: Vec<&HistoryItem> = item
            .child_ids()
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).copied())
            .collect();
        for extra in by_parent.get(item.id.as_str()).into_iter().flatten() {
            if !children.iter().any(|c| c.id == extra.id) {
                children.push(extra);
            }
        }
        for child in children.into_iter().rev() {
            pending.push((child, depth + 1));
        }
    }
    Some(out.join("\n"))
}
