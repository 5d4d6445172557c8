use serde::{Deserialize, Serialize};

/// Delegation status of a persisted task. A record without a status is
/// treated as never delegated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Delegated,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Delegated => "delegated",
            TaskStatus::Completed => "completed",
        }
    }
}

/// Durable metadata record for one task, keyed by `id`.
///
/// The JSON shape is the on-disk contract shared with anything that reads
/// task history, so field names stay camelCase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub id: String,
    #[serde(default)]
    pub number: u32,
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_writes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_reads: Option<u64>,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_task_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegated_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting_child_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by_child_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_result_summary: Option<String>,
}

/// Fields a save always takes from the incoming record.
pub const ALWAYS_OVERWRITTEN_FIELDS: &[&str] = &[
    "id",
    "number",
    "ts",
    "task",
    "tokensIn",
    "tokensOut",
    "cacheWrites",
    "cacheReads",
    "totalCost",
    "size",
    "workspace",
    "mode",
    "parentTaskId",
    "rootTaskId",
];

/// Fields a save keeps from the existing record unless the update names them.
pub const PRESERVED_UNLESS_EXPLICIT_FIELDS: &[&str] = &[
    "status",
    "delegatedToId",
    "awaitingChildId",
    "childIds",
    "completedByChildId",
    "completionResultSummary",
];

impl HistoryItem {
    pub fn new(id: impl Into<String>, number: u32, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            number,
            ts: crate::now_ms(),
            task: task.into(),
            ..Self::default()
        }
    }

    /// Appends `child_id` to `childIds` unless it is already listed.
    pub fn push_child(&mut self, child_id: &str) {
        let children = self.child_ids.get_or_insert_with(Vec::new);
        if !children.iter().any(|id| id == child_id) {
            children.push(child_id.to_string());
        }
    }

    pub fn child_ids(&self) -> &[String] {
        self.child_ids.as_deref().unwrap_or(&[])
    }

    pub fn is_delegated(&self) -> bool {
        self.status == Some(TaskStatus::Delegated)
    }

    pub fn is_awaiting_child(&self) -> bool {
        self.awaiting_child_id.is_some()
    }

    /// Child a history listing should link to: the pending child first, then
    /// the last delegation target.
    pub fn child_link_id(&self) -> Option<&str> {
        self.awaiting_child_id
            .as_deref()
            .or(self.delegated_to_id.as_deref())
    }

    pub fn has_delegation_completed(&self) -> bool {
        self.completed_by_child_id.is_some()
            && self
                .completion_result_summary
                .as_deref()
                .is_some_and(|s| !s.trim().is_empty())
    }

    pub fn completion_summary(&self) -> &str {
        self.completion_result_summary
            .as_deref()
            .unwrap_or("")
            .trim()
    }
}

/// Per-field instruction for a field that survives routine saves.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate<T> {
    Keep,
    Set(T),
    Clear,
}

impl<T> Default for FieldUpdate<T> {
    fn default() -> Self {
        FieldUpdate::Keep
    }
}

impl<T> FieldUpdate<T> {
    /// `None` means "not mentioned".
    pub fn keep_if_absent(value: Option<T>) -> Self {
        match value {
            Some(v) => FieldUpdate::Set(v),
            None => FieldUpdate::Keep,
        }
    }

    /// `None` means "explicitly unset".
    pub fn clear_if_absent(value: Option<T>) -> Self {
        match value {
            Some(v) => FieldUpdate::Set(v),
            None => FieldUpdate::Clear,
        }
    }

    pub fn apply(self, existing: Option<T>) -> Option<T> {
        match self {
            FieldUpdate::Keep => existing,
            FieldUpdate::Set(v) => Some(v),
            FieldUpdate::Clear => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DelegationUpdate {
    pub status: FieldUpdate<TaskStatus>,
    pub delegated_to_id: FieldUpdate<String>,
    pub awaiting_child_id: FieldUpdate<String>,
    pub child_ids: FieldUpdate<Vec<String>>,
    pub completed_by_child_id: FieldUpdate<String>,
    pub completion_result_summary: FieldUpdate<String>,
}

/// Incoming write for the history store. Core fields come from `item`; the
/// delegation fields are decided by `delegation` alone.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryUpdate {
    pub item: HistoryItem,
    pub delegation: DelegationUpdate,
}

impl HistoryUpdate {
    /// Routine save: delegation fields the item leaves unset are preserved.
    pub fn partial(item: HistoryItem) -> Self {
        let delegation = DelegationUpdate {
            status: FieldUpdate::keep_if_absent(item.status),
            delegated_to_id: FieldUpdate::keep_if_absent(item.delegated_to_id.clone()),
            awaiting_child_id: FieldUpdate::keep_if_absent(item.awaiting_child_id.clone()),
            child_ids: FieldUpdate::keep_if_absent(item.child_ids.clone()),
            completed_by_child_id: FieldUpdate::keep_if_absent(item.completed_by_child_id.clone()),
            completion_result_summary: FieldUpdate::keep_if_absent(
                item.completion_result_summary.clone(),
            ),
        };
        Self { item, delegation }
    }

    /// Authoritative save: the item is the whole truth, unset delegation
    /// fields are cleared.
    pub fn replace(item: HistoryItem) -> Self {
        let delegation = DelegationUpdate {
            status: FieldUpdate::clear_if_absent(item.status),
            delegated_to_id: FieldUpdate::clear_if_absent(item.delegated_to_id.clone()),
            awaiting_child_id: FieldUpdate::clear_if_absent(item.awaiting_child_id.clone()),
            child_ids: FieldUpdate::clear_if_absent(item.child_ids.clone()),
            completed_by_child_id: FieldUpdate::clear_if_absent(
                item.completed_by_child_id.clone(),
            ),
            completion_result_summary: FieldUpdate::clear_if_absent(
                item.completion_result_summary.clone(),
            ),
        };
        Self { item, delegation }
    }

    pub fn task_id(&self) -> &str {
        &self.item.id
    }
}

/// Reconciling merge of an incoming update onto the persisted record.
pub fn merge_history_item(existing: Option<&HistoryItem>, update: HistoryUpdate) -> HistoryItem {
    let HistoryUpdate {
        item: incoming,
        delegation,
    } = update;
    let prior = existing.cloned().unwrap_or_default();
    HistoryItem {
        id: incoming.id,
        number: incoming.number,
        ts: incoming.ts,
        task: incoming.task,
        tokens_in: incoming.tokens_in,
        tokens_out: incoming.tokens_out,
        cache_writes: incoming.cache_writes,
        cache_reads: incoming.cache_reads,
        total_cost: incoming.total_cost,
        size: incoming.size,
        workspace: incoming.workspace,
        mode: incoming.mode,
        parent_task_id: incoming.parent_task_id,
        root_task_id: incoming.root_task_id,
        status: delegation.status.apply(prior.status),
        delegated_to_id: delegation.delegated_to_id.apply(prior.delegated_to_id),
        awaiting_child_id: delegation.awaiting_child_id.apply(prior.awaiting_child_id),
        child_ids: delegation.child_ids.apply(prior.child_ids),
        completed_by_child_id: delegation
            .completed_by_child_id
            .apply(prior.completed_by_child_id),
        completion_result_summary: delegation
            .completion_result_summary
            .apply(prior.completion_result_summary),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn delegated_parent() -> HistoryItem {
        HistoryItem {
            id: "parent-1".to_string(),
            number: 1,
            ts: 100,
            task: "Parent".to_string(),
            workspace: Some("/tmp".to_string()),
            mode: Some("code".to_string()),
            status: Some(TaskStatus::Delegated),
            delegated_to_id: Some("X".to_string()),
            awaiting_child_id: Some("X".to_string()),
            child_ids: Some(vec!["X".to_string()]),
            ..HistoryItem::default()
        }
    }

    #[test]
    fn counter_only_save_keeps_delegation_fields() {
        let existing = delegated_parent();
        let incoming = HistoryItem {
            id: "parent-1".to_string(),
            number: 1,
            ts: 110,
            task: "Parent".to_string(),
            tokens_in: 10,
            tokens_out: 20,
            total_cost: 0.01,
            workspace: Some("/tmp".to_string()),
            mode: Some("code".to_string()),
            ..HistoryItem::default()
        };

        let merged = merge_history_item(Some(&existing), HistoryUpdate::partial(incoming));

        assert_eq!(merged.status, Some(TaskStatus::Delegated));
        assert_eq!(merged.awaiting_child_id.as_deref(), Some("X"));
        assert_eq!(merged.delegated_to_id.as_deref(), Some("X"));
        assert_eq!(merged.child_ids(), ["X".to_string()]);
        assert_eq!(merged.tokens_in, 10);
        assert_eq!(merged.tokens_out, 20);
        assert_eq!(merged.total_cost, 0.01);
        assert_eq!(merged.ts, 110);
    }

    #[test]
    fn merge_is_idempotent() {
        let existing = delegated_parent();
        let incoming = HistoryItem {
            tokens_in: 5,
            ..HistoryItem::new("parent-1", 1, "Parent")
        };
        let once = merge_history_item(Some(&existing), HistoryUpdate::partial(incoming.clone()));
        let twice = merge_history_item(Some(&once), HistoryUpdate::partial(incoming));
        assert_eq!(once, twice);
    }

    #[test]
    fn replace_clears_unset_delegation_fields() {
        let existing = delegated_parent();
        let mut resumed = existing.clone();
        resumed.status = Some(TaskStatus::Active);
        resumed.awaiting_child_id = None;
        resumed.completed_by_child_id = Some("X".to_string());
        resumed.completion_result_summary = Some("done".to_string());

        let merged = merge_history_item(Some(&existing), HistoryUpdate::replace(resumed));
        assert_eq!(merged.status, Some(TaskStatus::Active));
        assert_eq!(merged.awaiting_child_id, None);
        assert_eq!(merged.delegated_to_id.as_deref(), Some("X"));
        assert_eq!(merged.completed_by_child_id.as_deref(), Some("X"));
        assert_eq!(merged.child_ids(), ["X".to_string()]);
    }

    #[test]
    fn merge_without_existing_record_takes_incoming() {
        let item = HistoryItem::new("fresh", 7, "Fresh task");
        let merged = merge_history_item(None, HistoryUpdate::partial(item.clone()));
        assert_eq!(merged, item);
    }

    #[test]
    fn push_child_is_idempotent() {
        let mut item = HistoryItem::new("p", 1, "P");
        item.push_child("c1");
        item.push_child("c2");
        item.push_child("c1");
        assert_eq!(item.child_ids(), ["c1".to_string(), "c2".to_string()]);
    }

    #[test]
    fn missing_delegation_fields_read_as_not_delegated() {
        let raw = json!({
            "id": "legacy",
            "number": 3,
            "ts": 1770913145613i64,
            "task": "Old task",
            "tokensIn": 1,
            "tokensOut": 2,
            "totalCost": 0.5
        });
        let item: HistoryItem = serde_json::from_value(raw).expect("deserialize");
        assert!(!item.is_delegated());
        assert!(!item.is_awaiting_child());
        assert!(item.child_ids().is_empty());
        assert!(item.child_link_id().is_none());
        assert!(!item.has_delegation_completed());
    }

    #[test]
    fn every_serialized_field_has_exactly_one_merge_policy() {
        let mut item = delegated_parent();
        item.cache_writes = Some(1);
        item.cache_reads = Some(1);
        item.size = Some(1);
        item.parent_task_id = Some("root".to_string());
        item.root_task_id = Some("root".to_string());
        item.completed_by_child_id = Some("X".to_string());
        item.completion_result_summary = Some("ok".to_string());

        let value = serde_json::to_value(&item).expect("serialize");
        let Value::Object(fields) = value else {
            panic!("history item must serialize to an object");
        };
        for key in fields.keys() {
            let overwritten = ALWAYS_OVERWRITTEN_FIELDS.contains(&key.as_str());
            let preserved = PRESERVED_UNLESS_EXPLICIT_FIELDS.contains(&key.as_str());
            assert!(overwritten ^ preserved, "field {key} needs exactly one policy");
        }
        assert_eq!(
            fields.len(),
            ALWAYS_OVERWRITTEN_FIELDS.len() + PRESERVED_UNLESS_EXPLICIT_FIELDS.len()
        );
    }

    #[test]
    fn delegation_view_prefers_awaiting_child() {
        let mut item = delegated_parent();
        item.awaiting_child_id = Some("c2".to_string());
        assert_eq!(item.child_link_id(), Some("c2"));
        item.awaiting_child_id = None;
        assert_eq!(item.child_link_id(), Some("X"));

        item.completed_by_child_id = Some("X".to_string());
        item.completion_result_summary = Some("   ".to_string());
        assert!(!item.has_delegation_completed());
        item.completion_result_summary = Some("  All good \n".to_string());
        assert!(item.has_delegation_completed());
        assert_eq!(item.completion_summary(), "All good");
    }
}
