//! Pure date/period arithmetic used by narrowing commands to split a date
//! range into smaller ranges. The core never calls these directly; they
//! exist for commands (like `commands::http_search`) to build
//! `narrowed_down_tasks` from.

use chrono::{Duration, NaiveDate};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PeriodError {
    #[error("invalid date {0}: expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("period end {end} is before start {start}")]
    EndBeforeStart { start: String, end: String },
    #[error("cannot split a single-day period")]
    SingleDay,
    #[error("parts must be a power of two, got {0}")]
    PartsNotPowerOfTwo(u32),
}

const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn parse_date(s: &str) -> Result<NaiveDate, PeriodError> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|_| PeriodError::InvalidDate(s.to_string()))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Inclusive day count of `[start, end]`.
pub fn days_in_period(start: NaiveDate, end: NaiveDate) -> Result<i64, PeriodError> {
    if end < start {
        return Err(PeriodError::EndBeforeStart {
            start: format_date(start),
            end: format_date(end),
        });
    }
    Ok((end - start).num_days() + 1)
}

/// Splits `[start, end]` into two contiguous, non-overlapping halves that
/// together cover the original range exactly. Fails on a single-day period,
/// which cannot be split any further.
pub fn split_period_into_halves(
    start: NaiveDate,
    end: NaiveDate,
) -> Result<((NaiveDate, NaiveDate), (NaiveDate, NaiveDate)), PeriodError> {
    let days = days_in_period(start, end)?;
    if days <= 1 {
        return Err(PeriodError::SingleDay);
    }
    let first_half_days = days / 2;
    let mid = start + Duration::days(first_half_days - 1);
    let mid_next = mid + Duration::days(1);
    Ok(((start, mid), (mid_next, end)))
}

/// Splits `[start, end]` into `parts` contiguous, non-overlapping,
/// (approximately) equal-sized ranges covering the original range exactly.
/// `parts` must be a power of two so repeated halving always reaches it
/// exactly; a part count that isn't a power of two is rejected rather than
/// silently rounded.
pub fn split_period_into_parts(
    start: NaiveDate,
    end: NaiveDate,
    parts: u32,
) -> Result<Vec<(NaiveDate, NaiveDate)>, PeriodError> {
    if parts == 0 || (parts & (parts - 1)) != 0 {
        return Err(PeriodError::PartsNotPowerOfTwo(parts));
    }
    let days = days_in_period(start, end)?;
    if parts == 1 {
        return Ok(vec![(start, end)]);
    }
    if (days as u32) < parts {
        return Err(PeriodError::SingleDay);
    }

    let mut ranges = vec![(start, end)];
    while (ranges.len() as u32) < parts {
        let mut next = Vec::with_capacity(ranges.len() * 2);
        for (s, e) in ranges {
            let (a, b) = split_period_into_halves(s, e)?;
            next.push(a);
            next.push(b);
        }
        ranges = next;
    }
    Ok(ranges)
}
