pub mod cli;
pub mod clock;
pub mod command;
pub mod commands;
pub mod period;
pub mod queue;
pub mod requeue;
pub mod runner;
pub mod state;
pub mod store;
pub mod task;

use std::sync::Arc;

use cli::ExecuteArgs;
use clock::SystemClock;
use command::Command;
use commands::http_search::{load_command_file, HttpSearchCommand};
use queue::QueueConfig;
use runner::RunnerConfig;
use store::ProcessFileStore;
use task::TaskContext;

/// Runs the `execute` subcommand end to end.
pub async fn run_execute(args: ExecuteArgs) -> anyhow::Result<()> {
    let command_file = load_command_file(&args.command_file)?;
    let command: Arc<dyn Command> = Arc::new(HttpSearchCommand::new(command_file));

    let http = reqwest::Client::builder().build()?;
    let ctx = Arc::new(
        TaskContext::new(http, Some(args.github_token.clone()), args.rate_limit_stop_percent)
            .with_record_http_calls(args.record_http_calls),
    );

    let store = ProcessFileStore::new(args.data_directory.clone());
    let clock = Arc::new(SystemClock);

    let config = RunnerConfig {
        renew_period: chrono::Duration::days(args.renew_period_in_days),
        queue: QueueConfig {
            concurrency: args.concurrency,
            per_task_timeout: std::time::Duration::from_millis(args.per_task_timeout_in_ms),
            interval_cap: args.interval_cap,
            interval: std::time::Duration::from_millis(args.interval_in_ms),
            retry_count: args.retry_count,
        },
        max_run_time: std::time::Duration::from_secs(args.max_run_time_in_minutes * 60),
        report_period: std::time::Duration::from_millis(args.report_period_in_ms),
    };

    runner::run(&store, command, ctx, clock, config).await?;
    Ok(())
}

/// Runs `latest-queue-complete`: returns `true` (no run yet, or the latest
/// run's `completionDate` is set) or `false` (an in-progress run exists).
pub fn latest_queue_complete(data_directory: &std::path::Path) -> anyhow::Result<bool> {
    let store = ProcessFileStore::new(data_directory);
    let latest = match store.latest_run_dir() {
        Ok(latest) => latest,
        Err(store::StoreError::DataDirMissing(_)) => return Ok(true),
        Err(other) => return Err(other.into()),
    };
    let Some(latest) = latest else {
        return Ok(true);
    };
    let state = store.read_state(&latest)?;
    Ok(state.is_complete())
}

/// Runs `requeue-tasks`: mass-promotes failures in the named run directory.
pub fn run_requeue_tasks(
    data_directory: &std::path::Path,
    timestamp: &str,
    requeue_type: requeue::RequeueType,
) -> anyhow::Result<usize> {
    let store = ProcessFileStore::new(data_directory);
    Ok(requeue::requeue(&store, timestamp, requeue_type)?)
}
