//! A generic, declaratively-configured cursor-paginated HTTP search
//! command. Fills the external-collaborator seam so `execute` is runnable
//! end to end without reintroducing a specific remote API's query
//! language: the command file names a URL template and JSON-pointer paths
//! into the response body, nothing more domain-specific than that.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::command::Command;
use crate::period;
use crate::state::{new_task_id, TaskSpec};
use crate::task::{RateLimit, Task, TaskContext, TaskError, TaskOutput, TransportError};

#[derive(Debug, Clone, Deserialize)]
pub struct DateRangeField {
    pub start_field: String,
    pub end_field: String,
}

/// The shape of a `--command-file` TOML document.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandFile {
    /// e.g. `"https://example.invalid/search?q={query}&cursor={cursor}"`.
    /// Every `{key}` is replaced with the spec's `extra[key]` (as a string),
    /// or the empty string if absent.
    pub url_template: String,
    #[serde(default)]
    pub cursor_pointer: Option<String>,
    #[serde(default)]
    pub rate_limit_remaining_pointer: Option<String>,
    #[serde(default)]
    pub rate_limit_limit_pointer: Option<String>,
    pub records_pointer: String,
    #[serde(default)]
    pub date_range: Option<DateRangeField>,
    /// Initial payloads; one seed task is created per entry. Empty means a
    /// single task with no extra fields.
    #[serde(default)]
    pub seeds: Vec<BTreeMap<String, toml::Value>>,
}

pub fn load_command_file(path: &Path) -> anyhow::Result<CommandFile> {
    let text = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}

fn toml_to_json(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s.clone()),
        toml::Value::Integer(i) => Value::from(*i),
        toml::Value::Float(f) => Value::from(*f),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Array(items) => Value::Array(items.iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => {
            let mut map = serde_json::Map::new();
            for (k, v) in table {
                map.insert(k.clone(), toml_to_json(v));
            }
            Value::Object(map)
        }
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
    }
}

pub struct HttpSearchCommand {
    config: Arc<CommandFile>,
}

impl HttpSearchCommand {
    pub fn new(config: CommandFile) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl Command for HttpSearchCommand {
    async fn create_new_queue_items(&self, _ctx: &TaskContext) -> anyhow::Result<Vec<Box<dyn Task>>> {
        if self.config.seeds.is_empty() {
            let spec = TaskSpec::new(new_task_id());
            return Ok(vec![Box::new(HttpSearchTask {
                config: Arc::clone(&self.config),
                spec,
            })]);
        }
        Ok(self
            .config
            .seeds
            .iter()
            .map(|seed| {
                let mut spec = TaskSpec::new(new_task_id());
                for (k, v) in seed {
                    spec.extra.insert(k.clone(), toml_to_json(v));
                }
                Box::new(HttpSearchTask {
                    config: Arc::clone(&self.config),
                    spec,
                }) as Box<dyn Task>
            })
            .collect())
    }

    fn create_task(&self, spec: TaskSpec) -> Box<dyn Task> {
        Box::new(HttpSearchTask {
            config: Arc::clone(&self.config),
            spec,
        })
    }
}

pub struct HttpSearchTask {
    config: Arc<CommandFile>,
    spec: TaskSpec,
}

impl HttpSearchTask {
    fn build_url(&self) -> String {
        let mut url = self.config.url_template.clone();
        for (key, value) in &self.spec.extra {
            let placeholder = format!("{{{key}}}");
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            url = url.replace(&placeholder, &replacement);
        }
        url = url.replace("{cursor}", "");
        url
    }

    fn extract_rate_limit(&self, body: &Value) -> Option<RateLimit> {
        let remaining = self
            .config
            .rate_limit_remaining_pointer
            .as_deref()
            .and_then(|p| body.pointer(p))
            .and_then(Value::as_u64)?;
        let limit = self
            .config
            .rate_limit_limit_pointer
            .as_deref()
            .and_then(|p| body.pointer(p))
            .and_then(Value::as_u64)?;
        Some(RateLimit { remaining, limit })
    }

    fn extract_records(&self, body: &Value) -> Vec<Value> {
        match body.pointer(&self.config.records_pointer) {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
            None => Vec::new(),
        }
    }

    fn extract_cursor(&self, body: &Value) -> Option<String> {
        let pointer = self.config.cursor_pointer.as_deref()?;
        match body.pointer(pointer) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl Task for HttpSearchTask {
    fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    fn set_parent_id(&mut self, parent_id: String) {
        self.spec.parent_id = Some(parent_id);
    }

    fn set_originating_task_id(&mut self, originating_task_id: String) {
        self.spec.originating_task_id = Some(originating_task_id);
    }

    async fn execute(&self, ctx: &TaskContext, cancel: CancellationToken) -> Result<TaskOutput, TaskError> {
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let url = self.build_url();
        let mut request = ctx.http.get(&url);
        if let Some(token) = &ctx.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            TaskError::Transport(TransportError {
                message: e.to_string(),
                retry_after: None,
                has_headers: false,
                partial_data: None,
            })
        })?;

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        let has_headers = !response.headers().is_empty();
        let status = response.status();
        ctx.record_http_call(self.id(), "GET", &url, status.as_u16());

        let body: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            return Err(TaskError::Transport(TransportError {
                message: format!("http status {status}"),
                retry_after,
                has_headers,
                partial_data: if body.is_null() { None } else { Some(body) },
            }));
        }

        Ok(TaskOutput {
            records: self.extract_records(&body),
            rate_limit: self.extract_rate_limit(&body),
            cursor: self.extract_cursor(&body),
        })
    }

    fn next_task(&self, _ctx: &TaskContext, output: &TaskOutput) -> Option<Box<dyn Task>> {
        let cursor = output.cursor.clone()?;
        let mut spec = TaskSpec::new(new_task_id());
        spec.extra = self.spec.extra.clone();
        spec.extra.insert("cursor".to_string(), Value::String(cursor));
        Some(Box::new(HttpSearchTask {
            config: Arc::clone(&self.config),
            spec,
        }))
    }

    fn narrowed_down_tasks(&self, _ctx: &TaskContext) -> Option<Vec<Box<dyn Task>>> {
        let date_range = self.config.date_range.as_ref()?;
        let start = self.spec.extra.get(&date_range.start_field)?.as_str()?;
        let end = self.spec.extra.get(&date_range.end_field)?.as_str()?;
        let start = period::parse_date(start).ok()?;
        let end = period::parse_date(end).ok()?;
        let (first, second) = period::split_period_into_halves(start, end).ok()?;

        let make_child = |range: (chrono::NaiveDate, chrono::NaiveDate)| -> Box<dyn Task> {
            let mut spec = TaskSpec::new(new_task_id());
            spec.extra = self.spec.extra.clone();
            spec.extra.insert(
                date_range.start_field.clone(),
                Value::String(period::format_date(range.0)),
            );
            spec.extra.insert(
                date_range.end_field.clone(),
                Value::String(period::format_date(range.1)),
            );
            Box::new(HttpSearchTask {
                config: Arc::clone(&self.config),
                spec,
            })
        };

        Some(vec![make_child(first), make_child(second)])
    }

    fn get_debug_instructions(&self, _ctx: &TaskContext) -> String {
        format!("GET {}", self.build_url())
    }
}
