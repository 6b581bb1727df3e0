//! The six literal end-to-end scenarios the queue's state machine must
//! satisfy, each driven directly against `TaskQueue` with a scripted
//! `Task` rather than a real transport.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use quarry::clock::SystemClock;
use quarry::queue::{QueueConfig, TaskQueue};
use quarry::state::{new_task_id, Buckets, TaskSpec};
use quarry::task::{RateLimit, Task, TaskContext, TaskError, TaskOutput, TransportError};

fn config() -> QueueConfig {
    QueueConfig {
        concurrency: 4,
        per_task_timeout: Duration::from_secs(5),
        interval_cap: 100,
        interval: Duration::from_millis(20),
        retry_count: 3,
    }
}

fn ctx() -> Arc<TaskContext> {
    Arc::new(TaskContext::new(reqwest::Client::new(), None, 10))
}

fn plentiful_rate_limit() -> Option<RateLimit> {
    Some(RateLimit {
        remaining: 4999,
        limit: 5000,
    })
}

/// A task that always succeeds with one record and no follow-up.
struct SimpleTask {
    spec: TaskSpec,
}

#[async_trait]
impl Task for SimpleTask {
    fn spec(&self) -> &TaskSpec {
        &self.spec
    }
    fn set_parent_id(&mut self, parent_id: String) {
        self.spec.parent_id = Some(parent_id);
    }
    fn set_originating_task_id(&mut self, id: String) {
        self.spec.originating_task_id = Some(id);
    }
    async fn execute(&self, _ctx: &TaskContext, _cancel: CancellationToken) -> Result<TaskOutput, TaskError> {
        Ok(TaskOutput {
            records: vec![serde_json::json!({"id": self.spec.id})],
            rate_limit: plentiful_rate_limit(),
            cursor: None,
        })
    }
    fn next_task(&self, _ctx: &TaskContext, _output: &TaskOutput) -> Option<Box<dyn Task>> {
        None
    }
    fn narrowed_down_tasks(&self, _ctx: &TaskContext) -> Option<Vec<Box<dyn Task>>> {
        None
    }
    fn get_debug_instructions(&self, _ctx: &TaskContext) -> String {
        format!("simple {}", self.spec.id)
    }
}

#[tokio::test]
async fn scenario_1_all_good_no_pagination() {
    let queue = TaskQueue::new(config(), ctx(), Arc::new(SystemClock), Buckets::default()).unwrap();
    queue.add(Box::new(SimpleTask {
        spec: TaskSpec::new("T1".to_string()),
    }));
    queue.add(Box::new(SimpleTask {
        spec: TaskSpec::new("T2".to_string()),
    }));
    queue.finish().await;

    let buckets = queue.buckets();
    assert_eq!(buckets.resolved.len(), 2);
    assert!(buckets.unresolved.is_empty());
    assert!(buckets.errored.is_empty());
    assert!(!queue.is_aborted());
}

/// T1 reports a next page with cursor `c1`; the follow-up returns one more
/// record and terminates. T2 is a plain `SimpleTask`.
struct PaginatingTask {
    spec: TaskSpec,
    has_next_page: bool,
}

#[async_trait]
impl Task for PaginatingTask {
    fn spec(&self) -> &TaskSpec {
        &self.spec
    }
    fn set_parent_id(&mut self, parent_id: String) {
        self.spec.parent_id = Some(parent_id);
    }
    fn set_originating_task_id(&mut self, id: String) {
        self.spec.originating_task_id = Some(id);
    }
    async fn execute(&self, _ctx: &TaskContext, _cancel: CancellationToken) -> Result<TaskOutput, TaskError> {
        Ok(TaskOutput {
            records: vec![serde_json::json!({"id": self.spec.id})],
            rate_limit: plentiful_rate_limit(),
            cursor: if self.has_next_page {
                Some("c1".to_string())
            } else {
                None
            },
        })
    }
    fn next_task(&self, _ctx: &TaskContext, output: &TaskOutput) -> Option<Box<dyn Task>> {
        let cursor = output.cursor.clone()?;
        let mut spec = TaskSpec::new(new_task_id());
        spec.extra.insert("startCursor".to_string(), serde_json::json!(cursor));
        Some(Box::new(PaginatingTask {
            spec,
            has_next_page: false,
        }))
    }
    fn narrowed_down_tasks(&self, _ctx: &TaskContext) -> Option<Vec<Box<dyn Task>>> {
        None
    }
    fn get_debug_instructions(&self, _ctx: &TaskContext) -> String {
        format!("paginating {}", self.spec.id)
    }
}

#[tokio::test]
async fn scenario_2_pagination() {
    let queue = TaskQueue::new(config(), ctx(), Arc::new(SystemClock), Buckets::default()).unwrap();
    queue.add(Box::new(PaginatingTask {
        spec: TaskSpec::new("T1".to_string()),
        has_next_page: true,
    }));
    queue.add(Box::new(SimpleTask {
        spec: TaskSpec::new("T2".to_string()),
    }));
    queue.finish().await;

    let buckets = queue.buckets();
    assert_eq!(buckets.resolved.len(), 3);
    let follow_up = buckets
        .resolved
        .values()
        .find(|entry| entry.spec.originating_task_id.as_deref() == Some("T1"))
        .expect("pagination follow-up should be resolved");
    assert_eq!(follow_up.spec.extra.get("startCursor").unwrap(), "c1");
}

/// T1 succeeds and has a next page; T2 fails with a secondary rate limit.
#[tokio::test]
async fn scenario_3_hard_rate_limit_mid_run() {
    struct RateLimitedTask {
        spec: TaskSpec,
    }
    #[async_trait]
    impl Task for RateLimitedTask {
        fn spec(&self) -> &TaskSpec {
            &self.spec
        }
        fn set_parent_id(&mut self, p: String) {
            self.spec.parent_id = Some(p);
        }
        fn set_originating_task_id(&mut self, id: String) {
            self.spec.originating_task_id = Some(id);
        }
        async fn execute(&self, _ctx: &TaskContext, _cancel: CancellationToken) -> Result<TaskOutput, TaskError> {
            Err(TaskError::Transport(TransportError {
                message: "secondary rate limit".to_string(),
                retry_after: Some(Duration::from_secs(60)),
                has_headers: true,
                partial_data: None,
            }))
        }
        fn next_task(&self, _ctx: &TaskContext, _o: &TaskOutput) -> Option<Box<dyn Task>> {
            None
        }
        fn narrowed_down_tasks(&self, _ctx: &TaskContext) -> Option<Vec<Box<dyn Task>>> {
            None
        }
        fn get_debug_instructions(&self, _ctx: &TaskContext) -> String {
            "rate limited".to_string()
        }
    }

    let queue = TaskQueue::new(
        QueueConfig {
            concurrency: 1,
            ..config()
        },
        ctx(),
        Arc::new(SystemClock),
        Buckets::default(),
    )
    .unwrap();
    queue.add(Box::new(PaginatingTask {
        spec: TaskSpec::new("T1".to_string()),
        has_next_page: true,
    }));
    queue.add(Box::new(RateLimitedTask {
        spec: TaskSpec::new("T2".to_string()),
    }));
    queue.finish().await;

    let buckets = queue.buckets();
    // The hard-rate-limit path never records an `errored` entry; the queue
    // aborts instead, and no task that was ever added is dropped.
    assert!(queue.is_aborted());
    assert!(buckets.errored.is_empty());
    assert!(!buckets.resolved.contains_key("T2"));
    assert_eq!(buckets.total_ids(), 3);
}

/// T2 fails three times then succeeds on the fourth attempt.
struct FlakyTask {
    spec: TaskSpec,
    attempts: Arc<AtomicU32>,
    fail_times: u32,
}

#[async_trait]
impl Task for FlakyTask {
    fn spec(&self) -> &TaskSpec {
        &self.spec
    }
    fn set_parent_id(&mut self, p: String) {
        self.spec.parent_id = Some(p);
    }
    fn set_originating_task_id(&mut self, id: String) {
        self.spec.originating_task_id = Some(id);
    }
    async fn execute(&self, _ctx: &TaskContext, _cancel: CancellationToken) -> Result<TaskOutput, TaskError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_times {
            return Err(TaskError::transport("transient"));
        }
        Ok(TaskOutput {
            records: vec![serde_json::json!({"id": self.spec.id})],
            rate_limit: plentiful_rate_limit(),
            cursor: None,
        })
    }
    fn next_task(&self, _ctx: &TaskContext, _output: &TaskOutput) -> Option<Box<dyn Task>> {
        None
    }
    fn narrowed_down_tasks(&self, _ctx: &TaskContext) -> Option<Vec<Box<dyn Task>>> {
        None
    }
    fn get_debug_instructions(&self, _ctx: &TaskContext) -> String {
        format!("flaky {}", self.spec.id)
    }
}

#[tokio::test]
async fn scenario_4_retry_success() {
    let queue = TaskQueue::new(config(), ctx(), Arc::new(SystemClock), Buckets::default()).unwrap();
    queue.add(Box::new(SimpleTask {
        spec: TaskSpec::new("T1".to_string()),
    }));
    queue.add(Box::new(FlakyTask {
        spec: TaskSpec::new("T2".to_string()),
        attempts: Arc::new(AtomicU32::new(0)),
        fail_times: 3,
    }));
    queue.finish().await;

    let buckets = queue.buckets();
    assert_eq!(buckets.resolved.len(), 2);
    assert!(buckets.errored.is_empty());
    assert!(buckets.archived.is_empty());
}

/// A single task covering a 2-day range that fails 4 times (`retryCount=3`
/// exhausted), then narrows into two 1-day children that both succeed.
struct RangeTask {
    spec: TaskSpec,
}

#[async_trait]
impl Task for RangeTask {
    fn spec(&self) -> &TaskSpec {
        &self.spec
    }
    fn set_parent_id(&mut self, p: String) {
        self.spec.parent_id = Some(p);
    }
    fn set_originating_task_id(&mut self, id: String) {
        self.spec.originating_task_id = Some(id);
    }
    async fn execute(&self, _ctx: &TaskContext, _cancel: CancellationToken) -> Result<TaskOutput, TaskError> {
        Err(TaskError::transport("always fails at this granularity"))
    }
    fn next_task(&self, _ctx: &TaskContext, _output: &TaskOutput) -> Option<Box<dyn Task>> {
        None
    }
    fn narrowed_down_tasks(&self, _ctx: &TaskContext) -> Option<Vec<Box<dyn Task>>> {
        let start = quarry::period::parse_date(self.spec.extra.get("start")?.as_str()?).ok()?;
        let end = quarry::period::parse_date(self.spec.extra.get("end")?.as_str()?).ok()?;
        let (first, second) = quarry::period::split_period_into_halves(start, end).ok()?;
        let make = |range: (chrono::NaiveDate, chrono::NaiveDate)| -> Box<dyn Task> {
            let mut spec = TaskSpec::new(new_task_id());
            spec.extra.insert("start".to_string(), serde_json::json!(quarry::period::format_date(range.0)));
            spec.extra.insert("end".to_string(), serde_json::json!(quarry::period::format_date(range.1)));
            Box::new(SimpleTask { spec })
        };
        Some(vec![make(first), make(second)])
    }
    fn get_debug_instructions(&self, _ctx: &TaskContext) -> String {
        "range task".to_string()
    }
}

#[tokio::test]
async fn scenario_5_narrow_down() {
    let queue = TaskQueue::new(config(), ctx(), Arc::new(SystemClock), Buckets::default()).unwrap();
    let mut spec = TaskSpec::new("parent".to_string());
    spec.extra.insert("start".to_string(), serde_json::json!("2024-01-01"));
    spec.extra.insert("end".to_string(), serde_json::json!("2024-01-02"));
    queue.add(Box::new(RangeTask { spec }));
    queue.finish().await;

    let buckets = queue.buckets();
    assert_eq!(buckets.resolved.len(), 2);
    assert_eq!(buckets.archived.len(), 1);
    assert!(buckets.errored.is_empty());
    for entry in buckets.resolved.values() {
        assert_eq!(entry.spec.parent_id.as_deref(), Some("parent"));
    }
}

/// The transport call errors, but the error object carries both headers and
/// a usable `data` payload.
struct PartialResponseTask {
    spec: TaskSpec,
}

#[async_trait]
impl Task for PartialResponseTask {
    fn spec(&self) -> &TaskSpec {
        &self.spec
    }
    fn set_parent_id(&mut self, p: String) {
        self.spec.parent_id = Some(p);
    }
    fn set_originating_task_id(&mut self, id: String) {
        self.spec.originating_task_id = Some(id);
    }
    async fn execute(&self, _ctx: &TaskContext, _cancel: CancellationToken) -> Result<TaskOutput, TaskError> {
        Err(TaskError::Transport(TransportError {
            message: "graphql errors present alongside data".to_string(),
            retry_after: None,
            has_headers: true,
            partial_data: Some(serde_json::json!([{"id": self.spec.id}])),
        }))
    }
    fn next_task(&self, _ctx: &TaskContext, _output: &TaskOutput) -> Option<Box<dyn Task>> {
        None
    }
    fn narrowed_down_tasks(&self, _ctx: &TaskContext) -> Option<Vec<Box<dyn Task>>> {
        None
    }
    fn get_debug_instructions(&self, _ctx: &TaskContext) -> String {
        "partial response task".to_string()
    }
}

#[tokio::test]
async fn scenario_6_partial_response() {
    let shared_ctx = ctx();
    let queue = TaskQueue::new(config(), Arc::clone(&shared_ctx), Arc::new(SystemClock), Buckets::default()).unwrap();
    queue.add(Box::new(PartialResponseTask {
        spec: TaskSpec::new("T1".to_string()),
    }));
    queue.finish().await;

    let buckets = queue.buckets();
    assert_eq!(buckets.resolved.len(), 1);
    let entry = &buckets.resolved["T1"];
    assert!(entry.non_critical_error.is_some());
    assert!(entry.debug.is_some());
    assert!(buckets.errored.is_empty());
    assert_eq!(shared_ctx.take_output().len(), 1);
}
