//! The task contract: the capability set a command implements, plus the
//! shared per-run context handed to every hook.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::state::{HttpCallRecord, OutputRecord, TaskSpec};

/// Rate-limit quota reported alongside a successful call.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub remaining: u64,
    pub limit: u64,
}

/// The payload produced by a successful `execute` (or recovered from a
/// partial-response error via `extract_output_from_error`).
#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    pub records: Vec<serde_json::Value>,
    pub rate_limit: Option<RateLimit>,
    /// Opaque pagination hint (e.g. a cursor) a command's `next_task` hook
    /// can use to build a follow-up without re-parsing the transport
    /// response. The core never inspects this field.
    pub cursor: Option<String>,
}

/// A transport/application-level failure from `execute`. This is the core's
/// canonical error shape: commands that talk to a different wire protocol
/// translate their own error types into this one so the queue's default
/// hook implementations (`should_record_as_error`, `should_abort_after_error`,
/// ...) have something concrete to pattern-match on. Commands with unusual
/// classification needs can still override any hook.
#[derive(Debug, Clone)]
pub enum TaskError {
    /// Propagated cancellation; the queue never records this as a failure.
    Cancelled,
    /// The per-task watchdog fired; treated as a transient error.
    Timeout,
    /// Any other transport or application error.
    Transport(TransportError),
}

#[derive(Debug, Clone)]
pub struct TransportError {
    pub message: String,
    /// Set when the error carries a retry-after-style header indicating a
    /// secondary/burst rate limit. Triggers a full queue abort.
    pub retry_after: Option<Duration>,
    /// Whether the error object carried response headers at all.
    pub has_headers: bool,
    /// A usable partial payload, if the transport returned one alongside
    /// the error (e.g. a GraphQL response with both `errors` and `data`).
    pub partial_data: Option<serde_json::Value>,
}

impl TaskError {
    pub fn transport(message: impl Into<String>) -> Self {
        TaskError::Transport(TransportError {
            message: message.into(),
            retry_after: None,
            has_headers: false,
            partial_data: None,
        })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

/// The per-run bag of shared collaborators handed to every task.
pub struct TaskContext {
    pub http: reqwest::Client,
    pub auth_token: Option<String>,
    pub rate_limit_stop_percent: u8,
    pub record_http_calls: bool,
    output: Mutex<Vec<OutputRecord>>,
    http_calls: Mutex<Vec<HttpCallRecord>>,
}

impl TaskContext {
    pub fn new(http: reqwest::Client, auth_token: Option<String>, rate_limit_stop_percent: u8) -> Self {
        Self {
            http,
            auth_token,
            rate_limit_stop_percent,
            record_http_calls: false,
            output: Mutex::new(Vec::new()),
            http_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_record_http_calls(mut self, record: bool) -> Self {
        self.record_http_calls = record;
        self
    }

    pub fn record_output(&self, task_id: &str, result: serde_json::Value) {
        self.output.lock().unwrap().push(OutputRecord {
            task_id: task_id.to_string(),
            result,
        });
    }

    /// Drains and returns everything buffered since the last drain.
    pub fn take_output(&self) -> Vec<OutputRecord> {
        std::mem::take(&mut self.output.lock().unwrap())
    }

    /// Buffers one transport call for later persistence, but only when
    /// `record_http_calls` is set. A no-op check here keeps every `Task`
    /// free of flag-checking boilerplate.
    pub fn record_http_call(&self, task_id: &str, method: &str, url: &str, status: u16) {
        if !self.record_http_calls {
            return;
        }
        self.http_calls.lock().unwrap().push(HttpCallRecord {
            task_id: task_id.to_string(),
            method: method.to_string(),
            url: url.to_string(),
            status,
        });
    }

    /// Drains and returns everything buffered since the last drain.
    pub fn take_http_calls(&self) -> Vec<HttpCallRecord> {
        std::mem::take(&mut self.http_calls.lock().unwrap())
    }
}

/// The capability set a command's task implements. Hooks other than
/// `execute` are synchronous and must not block — they run inline on the
/// dispatcher's reaction path.
#[async_trait]
pub trait Task: Send + Sync {
    fn spec(&self) -> &TaskSpec;

    fn id(&self) -> &str {
        &self.spec().id
    }

    fn set_parent_id(&mut self, parent_id: String);
    fn set_originating_task_id(&mut self, originating_task_id: String);

    /// Performs one transport call. Must honor `cancel`: fail immediately if
    /// already cancelled at entry, and propagate cancellation rather than
    /// swallow it if cancelled mid-call.
    async fn execute(
        &self,
        ctx: &TaskContext,
        cancel: CancellationToken,
    ) -> Result<TaskOutput, TaskError>;

    /// True when the call succeeded but the embedded rate-limit quota says
    /// the budget is exhausted (or missing entirely). Default: abort when
    /// quota is missing or below `rate_limit_stop_percent` of the limit.
    fn should_abort(&self, ctx: &TaskContext, output: &TaskOutput) -> bool {
        match output.rate_limit {
            None => true,
            Some(rl) => {
                let threshold = (rl.limit as f64) * (ctx.rate_limit_stop_percent as f64) / 100.0;
                (rl.remaining as f64) < threshold
            }
        }
    }

    /// True when the error indicates a secondary/burst rate limit that
    /// should stop the whole queue rather than be retried.
    fn should_abort_after_error(&self, _ctx: &TaskContext, err: &TaskError) -> bool {
        matches!(err, TaskError::Transport(t) if t.retry_after.is_some())
    }

    /// False iff the error carries both response headers and a usable
    /// partial payload (a "non-critical" error to be treated as success).
    fn should_record_as_error(&self, _ctx: &TaskContext, err: &TaskError) -> bool {
        match err {
            TaskError::Transport(t) => !(t.has_headers && t.partial_data.is_some()),
            TaskError::Timeout => true,
            TaskError::Cancelled => false,
        }
    }

    /// Only called when `should_record_as_error` returned false.
    fn extract_output_from_error(
        &self,
        _ctx: &TaskContext,
        err: &TaskError,
    ) -> Result<TaskOutput, TaskError> {
        match err {
            TaskError::Transport(t) if t.has_headers && t.partial_data.is_some() => {
                let data = t.partial_data.clone().unwrap();
                let records = match data {
                    serde_json::Value::Array(items) => items,
                    other => vec![other],
                };
                Ok(TaskOutput {
                    records,
                    rate_limit: None,
                    cursor: None,
                })
            }
            _ => Err(TaskError::transport("invalid error object")),
        }
    }

    /// Formats the error for persistence. Must fail loudly if invoked on a
    /// secondary-rate-limit error -- that path should have aborted earlier.
    fn get_error_message(&self, _ctx: &TaskContext, err: &TaskError) -> String {
        match err {
            TaskError::Transport(t) if t.retry_after.is_some() => {
                panic!("get_error_message invoked on a secondary-rate-limit error")
            }
            TaskError::Transport(t) => t.message.clone(),
            TaskError::Timeout => "request timed out".to_string(),
            TaskError::Cancelled => unreachable!("cancellation is never recorded as an error"),
        }
    }

    /// Pagination hook: a follow-up task whose spec shares this one's
    /// payload but carries a fresh id. The queue sets `originating_task_id`.
    fn next_task(&self, ctx: &TaskContext, output: &TaskOutput) -> Option<Box<dyn Task>>;

    /// Smaller-scope sibling tasks for a task that has exhausted its
    /// retries. `None` when the task cannot be split further.
    fn narrowed_down_tasks(&self, ctx: &TaskContext) -> Option<Vec<Box<dyn Task>>>;

    /// Appends zero or more records into the run's in-memory output buffer.
    fn save_output(&self, ctx: &TaskContext, output: &TaskOutput) {
        for record in &output.records {
            ctx.record_output(self.id(), record.clone());
        }
    }

    /// Human-readable payload sufficient to reproduce the call manually.
    fn get_debug_instructions(&self, ctx: &TaskContext) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullTask {
        spec: TaskSpec,
    }

    #[async_trait]
    impl Task for NullTask {
        fn spec(&self) -> &TaskSpec {
            &self.spec
        }
        fn set_parent_id(&mut self, parent_id: String) {
            self.spec.parent_id = Some(parent_id);
        }
        fn set_originating_task_id(&mut self, id: String) {
            self.spec.originating_task_id = Some(id);
        }
        async fn execute(
            &self,
            _ctx: &TaskContext,
            _cancel: CancellationToken,
        ) -> Result<TaskOutput, TaskError> {
            Ok(TaskOutput::default())
        }
        fn next_task(&self, _ctx: &TaskContext, _output: &TaskOutput) -> Option<Box<dyn Task>> {
            None
        }
        fn narrowed_down_tasks(&self, _ctx: &TaskContext) -> Option<Vec<Box<dyn Task>>> {
            None
        }
        fn get_debug_instructions(&self, _ctx: &TaskContext) -> String {
            "null task".to_string()
        }
    }

    fn ctx() -> TaskContext {
        TaskContext::new(reqwest::Client::new(), None, 10)
    }

    #[test]
    fn should_abort_true_when_rate_limit_missing() {
        let task = NullTask {
            spec: TaskSpec::new("t1".to_string()),
        };
        let output = TaskOutput::default();
        assert!(task.should_abort(&ctx(), &output));
    }

    #[test]
    fn should_abort_false_when_well_above_threshold() {
        let task = NullTask {
            spec: TaskSpec::new("t1".to_string()),
        };
        let output = TaskOutput {
            records: vec![],
            rate_limit: Some(RateLimit {
                remaining: 5000,
                limit: 5000,
            }),
            cursor: None,
        };
        assert!(!task.should_abort(&ctx(), &output));
    }

    #[test]
    fn should_abort_true_when_below_stop_percent() {
        let task = NullTask {
            spec: TaskSpec::new("t1".to_string()),
        };
        // 10% stop threshold of limit=1000 is 100; remaining=50 should abort.
        let output = TaskOutput {
            records: vec![],
            rate_limit: Some(RateLimit {
                remaining: 50,
                limit: 1000,
            }),
            cursor: None,
        };
        assert!(task.should_abort(&ctx(), &output));
    }

    #[test]
    fn should_record_as_error_false_for_partial_response() {
        let task = NullTask {
            spec: TaskSpec::new("t1".to_string()),
        };
        let err = TaskError::Transport(TransportError {
            message: "graphql error".to_string(),
            retry_after: None,
            has_headers: true,
            partial_data: Some(serde_json::json!([{"a": 1}])),
        });
        assert!(!task.should_record_as_error(&ctx(), &err));
    }

    #[test]
    fn should_record_as_error_true_without_partial_payload() {
        let task = NullTask {
            spec: TaskSpec::new("t1".to_string()),
        };
        let err = TaskError::transport("boom");
        assert!(task.should_record_as_error(&ctx(), &err));
    }

    #[test]
    fn extract_output_from_error_recovers_partial_array() {
        let task = NullTask {
            spec: TaskSpec::new("t1".to_string()),
        };
        let err = TaskError::Transport(TransportError {
            message: "graphql error".to_string(),
            retry_after: None,
            has_headers: true,
            partial_data: Some(serde_json::json!([{"a": 1}, {"a": 2}])),
        });
        let output = task.extract_output_from_error(&ctx(), &err).unwrap();
        assert_eq!(output.records.len(), 2);
    }

    #[test]
    #[should_panic(expected = "secondary-rate-limit")]
    fn get_error_message_panics_on_secondary_rate_limit() {
        let task = NullTask {
            spec: TaskSpec::new("t1".to_string()),
        };
        let err = TaskError::Transport(TransportError {
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_secs(60)),
            has_headers: true,
            partial_data: None,
        });
        let _ = task.get_error_message(&ctx(), &err);
    }

    #[test]
    fn should_abort_after_error_true_with_retry_after() {
        let task = NullTask {
            spec: TaskSpec::new("t1".to_string()),
        };
        let err = TaskError::Transport(TransportError {
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_secs(5)),
            has_headers: false,
            partial_data: None,
        });
        assert!(task.should_abort_after_error(&ctx(), &err));
    }

    #[test]
    fn output_buffer_records_and_drains() {
        let context = ctx();
        context.record_output("t1", serde_json::json!({"n": 1}));
        context.record_output("t1", serde_json::json!({"n": 2}));
        let drained = context.take_output();
        assert_eq!(drained.len(), 2);
        assert!(context.take_output().is_empty());
    }

    #[test]
    fn http_calls_are_buffered_only_when_recording_is_enabled() {
        let context = ctx();
        context.record_http_call("t1", "GET", "https://example.invalid", 200);
        assert!(context.take_http_calls().is_empty());

        let context = ctx().with_record_http_calls(true);
        context.record_http_call("t1", "GET", "https://example.invalid", 200);
        let calls = context.take_http_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status, 200);
        assert!(context.take_http_calls().is_empty());
    }
}
