//! The data model: task specs, the four outcome buckets, and the
//! per-run process state document that gets persisted to `state.json`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generates a fresh, globally-unique task id.
pub fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}

/// The opaque, serializable description of a unit of work.
///
/// `id`, `parent_id`, and `originating_task_id` are the only fields the
/// core ever inspects. Everything else a command needs — cursors, date
/// ranges, query strings — lives in `extra` and round-trips through JSON
/// without the core caring about its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(rename = "parentId", skip_serializing_if = "Option::is_none", default)]
    pub parent_id: Option<String>,
    #[serde(
        rename = "originatingTaskId",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub originating_task_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskSpec {
    pub fn new(id: String) -> Self {
        Self {
            id,
            parent_id: None,
            originating_task_id: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// One entry in the ordered error history carried by `errored`/`archived`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    pub date: DateTime<Utc>,
}

/// A task that completed, possibly with a recovered partial result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedEntry {
    #[serde(rename = "task")]
    pub spec: TaskSpec,
    #[serde(
        rename = "nonCriticalError",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub non_critical_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub debug: Option<String>,
}

/// Shared shape for `errored` and `archived`: a spec plus its failure history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    #[serde(rename = "task")]
    pub spec: TaskSpec,
    pub debug: String,
    pub errors: Vec<ErrorRecord>,
}

/// The four task-outcome buckets. Every spec id that has ever been added to
/// a queue lives in exactly one of these once the queue is quiescent
/// (between retries, a failing-but-not-yet-exhausted task is transiently
/// present in both `unresolved` and `errored` — see `queue::TaskQueue`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Buckets {
    #[serde(default)]
    pub unresolved: BTreeMap<String, TaskSpec>,
    #[serde(default)]
    pub resolved: BTreeMap<String, ResolvedEntry>,
    #[serde(default)]
    pub errored: BTreeMap<String, ErrorEntry>,
    #[serde(default)]
    pub archived: BTreeMap<String, ErrorEntry>,
}

impl Buckets {
    /// Total number of distinct ids currently tracked across all buckets.
    pub fn total_ids(&self) -> usize {
        let mut ids: std::collections::BTreeSet<&str> = std::collections::BTreeSet::new();
        ids.extend(self.unresolved.keys().map(String::as_str));
        ids.extend(self.resolved.keys().map(String::as_str));
        ids.extend(self.errored.keys().map(String::as_str));
        ids.extend(self.archived.keys().map(String::as_str));
        ids.len()
    }
}

/// One run's persisted document: `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessState {
    #[serde(rename = "startDate")]
    pub start_date: DateTime<Utc>,
    #[serde(rename = "completionDate", skip_serializing_if = "Option::is_none")]
    pub completion_date: Option<DateTime<Utc>>,
    #[serde(rename = "completionError", skip_serializing_if = "Option::is_none")]
    pub completion_error: Option<String>,
    #[serde(flatten)]
    pub buckets: Buckets,
}

impl ProcessState {
    pub fn new(start_date: DateTime<Utc>) -> Self {
        Self {
            start_date,
            completion_date: None,
            completion_error: None,
            buckets: Buckets::default(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completion_date.is_some()
    }
}

/// One line of an append-only output file: `{taskId, result}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRecord {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub result: serde_json::Value,
}

/// One line of the `--record-http-calls` log: a single transport call a
/// task made, for replay/debugging. Only ever written when the flag is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCallRecord {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub method: String,
    pub url: String,
    pub status: u16,
}
