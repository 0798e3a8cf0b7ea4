//! Time utilities for turning dashboard presets into millisecond ranges.

use crate::error::{Result, ServiceError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Epoch seconds as a UTC instant; `bound` names the field in errors.
pub fn instant_from_seconds(seconds: i64, bound: &str) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(seconds, 0)
        .ok_or_else(|| ServiceError::invalid(format!("{bound} {seconds} is out of range")))
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(ServiceError::invalid("time range start must be before end"));
        }
        Ok(Self { start, end })
    }

    pub fn from_seconds(start: i64, end: i64) -> Result<Self> {
        Self::new(
            instant_from_seconds(start, "start")?,
            instant_from_seconds(end, "end")?,
        )
    }

    pub fn start_millis(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_millis(&self) -> i64 {
        self.end.timestamp_millis()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeFilterSpec {
    RelativeMinutes(i64),
    RelativeHours(i64),
    RelativeDays(i64),
    RelativeWeeks(i64),
    Today,
    Yesterday,
    Absolute {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    AbsoluteOpenEnd {
        start: DateTime<Utc>,
    },
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    DateTime::<Utc>::from_naive_utc_and_offset(date.and_time(NaiveTime::MIN), Utc)
}

impl TimeFilterSpec {
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<TimeRange> {
        let range = match self {
            TimeFilterSpec::RelativeMinutes(minutes) => TimeRange {
                start: lookback(now, TimeDelta::try_minutes(*minutes))?,
                end: now,
            },
            TimeFilterSpec::RelativeHours(hours) => TimeRange {
                start: lookback(now, TimeDelta::try_hours(*hours))?,
                end: now,
            },
            TimeFilterSpec::RelativeDays(days) => TimeRange {
                start: lookback(now, TimeDelta::try_days(*days))?,
                end: now,
            },
            TimeFilterSpec::RelativeWeeks(weeks) => TimeRange {
                start: lookback(now, TimeDelta::try_weeks(*weeks))?,
                end: now,
            },
            TimeFilterSpec::Today => TimeRange {
                start: midnight(now.date_naive()),
                end: now,
            },
            TimeFilterSpec::Yesterday => {
                let today = now.date_naive();
                TimeRange {
                    start: midnight(today.pred_opt().unwrap_or(today)),
                    end: midnight(today),
                }
            }
            TimeFilterSpec::Absolute { start, end } => TimeRange {
                start: *start,
                end: *end,
            },
            TimeFilterSpec::AbsoluteOpenEnd { start } => TimeRange {
                start: *start,
                end: now,
            },
        };

        TimeRange::new(range.start, range.end)
    }
}

fn lookback(now: DateTime<Utc>, span: Option<TimeDelta>) -> Result<DateTime<Utc>> {
    span.and_then(|span| now.checked_sub_signed(span))
        .ok_or_else(|| ServiceError::invalid("relative time range is too large"))
}

pub fn parse_time_value(raw: &str) -> Result<TimeFilterSpec> {
    let value = raw
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_lowercase();

    if value.starts_with('[') && value.ends_with(']') {
        return parse_absolute_range(&value);
    }

    if let Some(spec) = parse_relative_keyword(&value) {
        return Ok(spec);
    }

    Err(ServiceError::InvalidRequest(format!(
        "unsupported time token '{raw}'"
    )))
}

fn parse_relative_keyword(value: &str) -> Option<TimeFilterSpec> {
    if value == "today" {
        return Some(TimeFilterSpec::Today);
    }
    if value == "yesterday" {
        return Some(TimeFilterSpec::Yesterday);
    }

    let normalized = value.replace(['_', '-', ' '], "");
    let normalized = normalized.strip_prefix("last").unwrap_or(&normalized);
    parse_numeric_suffix(normalized)
}

fn parse_numeric_suffix(value: &str) -> Option<TimeFilterSpec> {
    let split = value
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);

    let amount: i64 = digits.parse().ok()?;
    if amount <= 0 {
        return None;
    }

    match suffix {
        "m" | "min" | "mins" | "minute" | "minutes" => Some(TimeFilterSpec::RelativeMinutes(amount)),
        "h" | "hr" | "hour" | "hours" => Some(TimeFilterSpec::RelativeHours(amount)),
        "d" | "day" | "days" => Some(TimeFilterSpec::RelativeDays(amount)),
        "w" | "week" | "weeks" => Some(TimeFilterSpec::RelativeWeeks(amount)),
        _ => None,
    }
}

fn parse_absolute_range(value: &str) -> Result<TimeFilterSpec> {
    let inner = value.trim_matches(['[', ']']);
    let (start_raw, end_raw) = inner
        .split_once(',')
        .ok_or_else(|| ServiceError::invalid("invalid time range"))?;
    let start_raw = start_raw.trim();
    let end_raw = end_raw.trim();

    match (start_raw.is_empty(), end_raw.is_empty()) {
        (false, false) => {
            let start = parse_datetime(start_raw)?;
            let end = parse_datetime(end_raw)?;
            Ok(TimeFilterSpec::Absolute { start, end })
        }
        (false, true) => {
            let start = parse_datetime(start_raw)?;
            Ok(TimeFilterSpec::AbsoluteOpenEnd { start })
        }
        _ => Err(ServiceError::invalid("time range requires a start bound")),
    }
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    }
    Err(ServiceError::InvalidRequest(format!(
        "invalid time literal '{value}'"
    )))
}
