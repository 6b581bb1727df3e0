//! Monotonic-enough "now" for the runner, generalized behind a trait so
//! tests can inject fixed timestamps instead of racing the wall clock.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Formats a timestamp into the run-directory / output-file naming scheme:
/// `YYYY-MM-DD-HH-MM-SS`.
pub fn format_run_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d-%H-%M-%S").to_string()
}
