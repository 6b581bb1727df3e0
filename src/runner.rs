//! Top-level orchestration: resolve a run directory, promote eligible
//! failures, dispatch the queue, report, enforce a wall-clock cap, and
//! persist final state.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::clock::{format_run_timestamp, Clock};
use crate::command::Command;
use crate::queue::{QueueConfig, TaskQueue};
use crate::state::ProcessState;
use crate::store::{ProcessFileStore, StoreError};
use crate::task::TaskContext;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub renew_period: chrono::Duration,
    pub queue: QueueConfig,
    pub max_run_time: Duration,
    pub report_period: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),
    #[error(transparent)]
    Command(#[from] anyhow::Error),
}

/// What happened when `resolve_run_dir` was asked to pick a directory.
enum Resolution {
    /// A brand-new run directory with this timestamp was created; the
    /// caller must seed it from `Command::create_new_queue_items`.
    Fresh(String),
    /// An existing, incomplete run directory should be resumed.
    Resume(String),
    /// The latest run is complete and the renew period has not elapsed;
    /// there is nothing to do.
    NothingToDo,
}

fn resolve_run_dir(
    store: &ProcessFileStore,
    clock: &dyn Clock,
    renew_period: chrono::Duration,
) -> Result<Resolution, RunnerError> {
    let latest = match store.latest_run_dir() {
        Ok(latest) => latest,
        Err(StoreError::DataDirMissing(_)) => None,
        Err(other) => return Err(other.into()),
    };
    let Some(latest) = latest else {
        let timestamp = format_run_timestamp(clock.now());
        store.create_run_dir(&timestamp)?;
        return Ok(Resolution::Fresh(timestamp));
    };

    let state = store.read_state(&latest)?;
    match state.completion_date {
        None => Ok(Resolution::Resume(latest)),
        Some(completed_at) => {
            if clock.now() - completed_at >= renew_period {
                let timestamp = format_run_timestamp(clock.now());
                store.create_run_dir(&timestamp)?;
                Ok(Resolution::Fresh(timestamp))
            } else {
                Ok(Resolution::NothingToDo)
            }
        }
    }
}

/// Moves every `errored` entry whose failure count is below
/// `retry_count + 1` back into `unresolved`, provided it is not already
/// there. Lets a raised `--retry-count` re-admit previously-exhausted
/// tasks on the next run.
fn promote_eligible_errored(state: &mut ProcessState, retry_count: u32) {
    let threshold = retry_count as usize + 1;
    let eligible: Vec<String> = state
        .buckets
        .errored
        .iter()
        .filter(|(id, entry)| entry.errors.len() < threshold && !state.buckets.unresolved.contains_key(*id))
        .map(|(id, _)| id.clone())
        .collect();
    for id in eligible {
        if let Some(entry) = state.buckets.errored.get(&id) {
            state.buckets.unresolved.insert(id.clone(), entry.spec.clone());
        }
    }
}

/// Runs `execute` end to end: resolve/create the run directory, promote
/// eligible failures, dispatch the queue, report periodically, enforce the
/// wall-clock cap, and persist.
pub async fn run(
    store: &ProcessFileStore,
    command: Arc<dyn Command>,
    ctx: Arc<TaskContext>,
    clock: Arc<dyn Clock>,
    config: RunnerConfig,
) -> Result<(), RunnerError> {
    let resolution = resolve_run_dir(store, clock.as_ref(), config.renew_period)?;

    let dir_name = match resolution {
        Resolution::NothingToDo => {
            info!("latest run already complete and renew period has not elapsed");
            return Ok(());
        }
        Resolution::Fresh(name) => {
            let seed = command.create_new_queue_items(&ctx).await?;
            let mut state = ProcessState::new(clock.now());
            let mut specs: Vec<_> = seed.iter().map(|t| t.spec().clone()).collect();
            specs.shuffle(&mut rand::rng());
            for spec in specs {
                state.buckets.unresolved.insert(spec.id.clone(), spec);
            }
            store.write_state(&name, &state)?;
            name
        }
        Resolution::Resume(name) => name,
    };

    let mut state = store.read_state(&dir_name)?;
    promote_eligible_errored(&mut state, config.queue.retry_count);

    let mut order: Vec<String> = state.buckets.unresolved.keys().cloned().collect();
    order.shuffle(&mut rand::rng());

    let queue = TaskQueue::new(config.queue, Arc::clone(&ctx), Arc::clone(&clock), state.buckets.clone())?;
    for id in &order {
        let spec = state.buckets.unresolved[id].clone();
        queue.add(command.create_task(spec));
    }

    let reporter = spawn_reporter(queue.clone(), config.report_period);
    let watchdog_queue = queue.clone();
    let watchdog = tokio::spawn(async move {
        tokio::time::sleep(config.max_run_time).await;
        warn!("wall-clock cap reached, aborting queue");
        watchdog_queue.abort();
    });
    let interrupt_queue = queue.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, aborting queue");
            interrupt_queue.abort();
        }
    });

    queue.finish().await;
    watchdog.abort();
    interrupt.abort();
    reporter.abort();

    let final_buckets = queue.buckets();
    let mut state = ProcessState::new(state.start_date);
    state.buckets = final_buckets;
    if state.buckets.unresolved.is_empty() {
        state.completion_date = Some(clock.now());
        if !state.buckets.errored.is_empty() {
            state.completion_error = Some("Errored tasks".to_string());
        }
    }
    store.write_state(&dir_name, &state)?;

    let timestamp = format_run_timestamp(clock.now());
    let output = ctx.take_output();
    store.append_output(&dir_name, &timestamp, &output)?;
    let http_calls = ctx.take_http_calls();
    store.append_http_calls(&dir_name, &timestamp, &http_calls)?;

    Ok(())
}

fn spawn_reporter(queue: TaskQueue, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if period.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let state = queue.get_state();
            info!(size = state.size, pending = state.pending, paused = state.paused, "queue state");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ErrorEntry, ErrorRecord, TaskSpec};

    #[test]
    fn promote_eligible_errored_admits_below_threshold_only() {
        let mut state = ProcessState::new(chrono::Utc::now());
        state.buckets.errored.insert(
            "a".to_string(),
            ErrorEntry {
                spec: TaskSpec::new("a".to_string()),
                debug: "d".to_string(),
                errors: vec![ErrorRecord {
                    message: "m".to_string(),
                    date: chrono::Utc::now(),
                }],
            },
        );
        state.buckets.errored.insert(
            "b".to_string(),
            ErrorEntry {
                spec: TaskSpec::new("b".to_string()),
                debug: "d".to_string(),
                errors: vec![
                    ErrorRecord {
                        message: "m".to_string(),
                        date: chrono::Utc::now(),
                    };
                    4
                ],
            },
        );
        promote_eligible_errored(&mut state, 3);
        assert!(state.buckets.unresolved.contains_key("a"));
        assert!(!state.buckets.unresolved.contains_key("b"));
    }

    #[test]
    fn promote_eligible_errored_skips_already_unresolved() {
        let mut state = ProcessState::new(chrono::Utc::now());
        state
            .buckets
            .unresolved
            .insert("a".to_string(), TaskSpec::new("a".to_string()));
        state.buckets.errored.insert(
            "a".to_string(),
            ErrorEntry {
                spec: TaskSpec::new("a".to_string()),
                debug: "d".to_string(),
                errors: vec![ErrorRecord {
                    message: "m".to_string(),
                    date: chrono::Utc::now(),
                }],
            },
        );
        promote_eligible_errored(&mut state, 3);
        assert_eq!(state.buckets.unresolved.len(), 1);
    }
}
