//! The `clap`-derived CLI surface: three subcommands sharing one set of
//! centralized defaults so the `--help` text and this module never drift
//! apart.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::requeue::RequeueType;

/// Defaults shared by the `execute` subcommand's optional flags.
pub struct Defaults;

impl Defaults {
    pub const RENEW_PERIOD_IN_DAYS: i64 = 7;
    pub const CONCURRENCY: usize = 6;
    pub const PER_TASK_TIMEOUT_IN_MS: u64 = 30_000;
    pub const RATE_LIMIT_STOP_PERCENT: u8 = 10;
    pub const INTERVAL_CAP: u32 = 4;
    pub const INTERVAL_IN_MS: u64 = 20_000;
    pub const RETRY_COUNT: u32 = 3;
    pub const LOG_LEVEL: &'static str = "info";
    pub const MAX_RUN_TIME_IN_MINUTES: u64 = 60;
    pub const REPORT_PERIOD_IN_MS: u64 = 5_000;
}

#[derive(Debug, Parser)]
#[command(name = "quarry", about = "Resumable, rate-limit-aware crawler for paginated search APIs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run (or resume) a crawl.
    Execute(ExecuteArgs),
    /// Print `true`/`false` depending on whether the latest run is complete.
    LatestQueueComplete(LatestQueueCompleteArgs),
    /// Reopen a completed run directory and mass-promote failures.
    RequeueTasks(RequeueTasksArgs),
}

#[derive(Debug, Parser)]
pub struct ExecuteArgs {
    #[arg(long)]
    pub command_file: PathBuf,
    #[arg(long)]
    pub data_directory: PathBuf,
    #[arg(long, env = "GITHUB_TOKEN")]
    pub github_token: String,

    #[arg(long, default_value_t = Defaults::RENEW_PERIOD_IN_DAYS)]
    pub renew_period_in_days: i64,
    #[arg(long, default_value_t = Defaults::CONCURRENCY)]
    pub concurrency: usize,
    #[arg(long, default_value_t = Defaults::PER_TASK_TIMEOUT_IN_MS)]
    pub per_task_timeout_in_ms: u64,
    #[arg(long, default_value_t = Defaults::RATE_LIMIT_STOP_PERCENT)]
    pub rate_limit_stop_percent: u8,
    #[arg(long, default_value_t = Defaults::INTERVAL_CAP)]
    pub interval_cap: u32,
    #[arg(long, default_value_t = Defaults::INTERVAL_IN_MS)]
    pub interval_in_ms: u64,
    #[arg(long, default_value_t = Defaults::RETRY_COUNT)]
    pub retry_count: u32,
    #[arg(long, default_value_t = false)]
    pub record_http_calls: bool,
    #[arg(long, default_value = Defaults::LOG_LEVEL)]
    pub log_level: String,
    #[arg(long, default_value_t = Defaults::MAX_RUN_TIME_IN_MINUTES)]
    pub max_run_time_in_minutes: u64,
    #[arg(long, default_value_t = Defaults::REPORT_PERIOD_IN_MS)]
    pub report_period_in_ms: u64,
}

#[derive(Debug, Parser)]
pub struct LatestQueueCompleteArgs {
    #[arg(long)]
    pub data_directory: PathBuf,
}

#[derive(Debug, Parser)]
pub struct RequeueTasksArgs {
    #[arg(long)]
    pub data_directory: PathBuf,
    #[arg(long)]
    pub timestamp: String,
    #[arg(long, value_enum)]
    pub requeue_type: RequeueType,
}
