//! The task queue: the scheduler and its durable four-bucket state machine.
//!
//! Concurrency is bounded by a semaphore; admission is paced by a token
//! bucket (`governor`); cooperative abort is a single shared
//! `CancellationToken`; spawned task bodies are tracked by a
//! `tokio_util::task::TaskTracker` so `finish()` can observe dispatcher
//! idleness without polling join handles by hand.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use governor::{Quota, RateLimiter};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::clock::Clock;
use crate::state::{Buckets, ErrorEntry, ErrorRecord, ResolvedEntry};
use crate::task::{Task, TaskContext, TaskError};

/// Grace window `finish()` waits before trusting a first idle+drained
/// observation, to catch a `nextTask` enqueued just as the dispatcher
/// briefly reported empty. A tuning parameter, not a contract.
const FINISH_GRACE: Duration = Duration::from_millis(50);
const FINISH_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub per_task_timeout: Duration,
    pub interval_cap: u32,
    pub interval: Duration,
    pub retry_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("interval_cap must be at least 1")]
    ZeroIntervalCap,
    #[error("interval must be greater than zero")]
    ZeroInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueState {
    pub size: usize,
    pub pending: usize,
    pub paused: bool,
}

type Limiter = governor::DefaultDirectRateLimiter;

struct Inner {
    config: QueueConfig,
    ctx: Arc<TaskContext>,
    clock: Arc<dyn Clock>,
    buckets: Mutex<Buckets>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    semaphore: Arc<tokio::sync::Semaphore>,
    limiter: Arc<Limiter>,
    executing: AtomicUsize,
}

/// The scheduler. Cheap to clone; every clone shares the same dispatcher
/// and bucket state.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    pub fn new(
        config: QueueConfig,
        ctx: Arc<TaskContext>,
        clock: Arc<dyn Clock>,
        initial: Buckets,
    ) -> Result<Self, QueueError> {
        if config.concurrency == 0 {
            return Err(QueueError::ZeroConcurrency);
        }
        if config.interval_cap == 0 {
            return Err(QueueError::ZeroIntervalCap);
        }
        if config.interval.is_zero() {
            return Err(QueueError::ZeroInterval);
        }
        let period = config.interval / config.interval_cap;
        let quota = Quota::with_period(period)
            .expect("non-zero interval/interval_cap yields a non-zero period")
            .allow_burst(NonZeroU32::new(config.interval_cap).expect("checked above"));

        let inner = Arc::new(Inner {
            config,
            ctx,
            clock,
            buckets: Mutex::new(initial),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            semaphore: Arc::new(tokio::sync::Semaphore::new(config.concurrency)),
            limiter: Arc::new(RateLimiter::direct(quota)),
            executing: AtomicUsize::new(0),
        });
        Ok(Self { inner })
    }

    /// Inserts the spec into `unresolved` synchronously, then submits the
    /// task asynchronously. If already aborted, the spec is recorded but
    /// never dispatched.
    pub fn add(&self, task: Box<dyn Task>) {
        Inner::submit(&self.inner, task);
    }

    pub fn abort(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn get_state(&self) -> QueueState {
        let size = self.inner.tracker.len();
        let executing = self.inner.executing.load(Ordering::SeqCst);
        QueueState {
            size,
            pending: size.saturating_sub(executing),
            paused: self.inner.cancel.is_cancelled(),
        }
    }

    pub fn buckets(&self) -> Buckets {
        self.inner.buckets.lock().unwrap().clone()
    }

    /// Returns once the dispatcher is idle and either `unresolved` is
    /// empty or the queue has aborted. Rechecks once after a short grace
    /// window to catch a follow-up enqueued right as the dispatcher
    /// briefly reported idle.
    pub async fn finish(&self) {
        loop {
            if self.quiescent() {
                tokio::time::sleep(FINISH_GRACE).await;
                if self.quiescent() {
                    return;
                }
                continue;
            }
            tokio::time::sleep(FINISH_POLL).await;
        }
    }

    fn quiescent(&self) -> bool {
        let idle = self.inner.tracker.len() == 0;
        let unresolved_empty = self.inner.buckets.lock().unwrap().unresolved.is_empty();
        let aborted = self.inner.cancel.is_cancelled();
        idle && (unresolved_empty || aborted)
    }
}

impl Inner {
    fn submit(self: &Arc<Self>, task: Box<dyn Task>) {
        let id = task.id().to_string();
        {
            let mut buckets = self.buckets.lock().unwrap();
            buckets.unresolved.insert(id, task.spec().clone());
        }
        if self.cancel.is_cancelled() {
            return;
        }
        let inner = Arc::clone(self);
        self.tracker.spawn(async move {
            run_one(inner, task).await;
        });
    }

    async fn react(self: &Arc<Self>, task: Box<dyn Task>, result: Result<crate::task::TaskOutput, TaskError>) {
        match result {
            Err(TaskError::Cancelled) => {
                // Spec stays in `unresolved`; a later run retries it.
            }
            Err(err) => self.react_error(task, err).await,
            Ok(output) => self.on_success(task, output, None, None).await,
        }
    }

    async fn react_error(self: &Arc<Self>, task: Box<dyn Task>, err: TaskError) {
        if task.should_abort_after_error(&self.ctx, &err) {
            self.cancel.cancel();
            return;
        }
        if task.should_record_as_error(&self.ctx, &err) {
            self.record_error(task, err).await;
            return;
        }
        match task.extract_output_from_error(&self.ctx, &err) {
            Ok(output) => {
                let non_critical_error = Some(task.get_error_message(&self.ctx, &err));
                let debug = Some(task.get_debug_instructions(&self.ctx));
                self.on_success(task, output, non_critical_error, debug).await;
            }
            Err(_) => {
                // Programmer error recovering a non-error-recording error:
                // fall back to recording it so the task is not silently lost.
                self.record_error(task, err).await;
            }
        }
    }

    async fn record_error(self: &Arc<Self>, task: Box<dyn Task>, err: TaskError) {
        let id = task.id().to_string();
        let message = task.get_error_message(&self.ctx, &err);
        let now = self.clock.now();

        let retries_so_far = {
            let mut buckets = self.buckets.lock().unwrap();
            buckets.unresolved.remove(&id);
            let spec = task.spec().clone();
            let debug = task.get_debug_instructions(&self.ctx);
            let entry = buckets.errored.entry(id.clone()).or_insert_with(|| ErrorEntry {
                spec,
                debug,
                errors: Vec::new(),
            });
            entry.errors.push(ErrorRecord { message, date: now });
            entry.errors.len()
        };

        if retries_so_far < self.config.retry_count as usize + 1 {
            self.submit(task);
            return;
        }

        match task.narrowed_down_tasks(&self.ctx) {
            Some(children) if !children.is_empty() => {
                for mut child in children {
                    child.set_parent_id(id.clone());
                    self.submit(child);
                }
                let mut buckets = self.buckets.lock().unwrap();
                if let Some(entry) = buckets.errored.remove(&id) {
                    buckets.archived.insert(id, entry);
                }
            }
            _ => {
                // Cannot narrow further; the entry stays in `errored`.
            }
        }
    }

    async fn on_success(
        self: &Arc<Self>,
        mut task: Box<dyn Task>,
        output: crate::task::TaskOutput,
        non_critical_error: Option<String>,
        debug: Option<String>,
    ) {
        let id = task.id().to_string();
        {
            let mut buckets = self.buckets.lock().unwrap();
            buckets.unresolved.remove(&id);
            buckets.errored.remove(&id);
            buckets.resolved.insert(
                id.clone(),
                ResolvedEntry {
                    spec: task.spec().clone(),
                    non_critical_error,
                    debug,
                },
            );
        }

        task.save_output(&self.ctx, &output);

        if let Some(mut next) = task.next_task(&self.ctx, &output) {
            next.set_originating_task_id(id);
            self.submit(next);
        }

        if task.should_abort(&self.ctx, &output) {
            self.cancel.cancel();
        }
    }
}

async fn run_one(inner: Arc<Inner>, task: Box<dyn Task>) {
    if inner.cancel.is_cancelled() {
        return;
    }

    let permit = tokio::select! {
        biased;
        _ = inner.cancel.cancelled() => return,
        permit = inner.semaphore.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };

    tokio::select! {
        biased;
        _ = inner.cancel.cancelled() => return,
        _ = inner.limiter.until_ready() => {}
    }

    if inner.cancel.is_cancelled() {
        return;
    }

    inner.executing.fetch_add(1, Ordering::SeqCst);
    let result = tokio::select! {
        biased;
        _ = inner.cancel.cancelled() => Err(TaskError::Cancelled),
        outcome = tokio::time::timeout(inner.config.per_task_timeout, task.execute(&inner.ctx, inner.cancel.clone())) => {
            match outcome {
                Ok(inner_result) => inner_result,
                Err(_elapsed) => Err(TaskError::Timeout),
            }
        }
    };
    inner.executing.fetch_sub(1, Ordering::SeqCst);
    drop(permit);

    inner.react(task, result).await;
}
