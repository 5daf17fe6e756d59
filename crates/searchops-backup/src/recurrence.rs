//! Recurrence schedule parsing and evaluation.
//!
//! A pure evaluator over the schedule grammar accepted by
//! `BackupRecurrence.schedule`:
//!
//! - standard 5-field cron (`minute hour day-of-month month day-of-week`),
//!   optionally prefixed with `CRON_TZ=<zone>` or `TZ=<zone>`;
//! - predefined schedules: `@yearly`/`@annually`, `@monthly`, `@weekly`,
//!   `@daily`/`@midnight`, `@hourly`;
//! - fixed intervals: `@every <duration>` with `h`/`m`/`s`/`ms`
//!   components, e.g. `@every 10h30m`.
//!
//! Only UTC zones are accepted in the prefix; anything else is a parse
//! error rather than a silently shifted schedule.
//!
//! No I/O happens here. Callers pass in the reference time and get back
//! the next strictly-future trigger.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use thiserror::Error;

/// Errors from parsing a schedule expression
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleParseError {
    /// The expression is empty or whitespace
    #[error("empty schedule expression")]
    Empty,

    /// An `@`-prefixed name that is not a known predefined schedule
    #[error("unknown predefined schedule '@{0}'")]
    UnknownPreset(String),

    /// A `CRON_TZ=`/`TZ=` prefix naming a zone we cannot evaluate
    #[error("unsupported timezone '{0}': only UTC schedules are supported")]
    UnsupportedTimezone(String),

    /// An `@every` interval that could not be parsed
    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    /// An `@every` interval of zero or less
    #[error("interval must be positive")]
    NonPositiveInterval,

    /// Wrong number of cron fields
    #[error("expected 5 cron fields, got {0}")]
    FieldCount(usize),

    /// A cron field that could not be parsed
    #[error("invalid cron field '{field}': {reason}")]
    Field {
        /// The offending field text
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// A cron field value outside its legal range
    #[error("value {value} out of range [{min}, {max}] in '{field}'")]
    OutOfRange {
        /// The offending field text
        field: String,
        /// The out-of-range value
        value: u32,
        /// Smallest legal value
        min: u32,
        /// Largest legal value
        max: u32,
    },
}

/// One field of a cron expression: the set of matching values, plus
/// whether the field was written unrestricted (`*` or `?`). The
/// distinction matters for the day-of-month/day-of-week union rule.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldSet {
    values: BTreeSet<u32>,
    star: bool,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        self.values.contains(&value)
    }

    fn parse(text: &str, min: u32, max: u32) -> Result<Self, ScheduleParseError> {
        let star = text == "*" || text == "?";
        let mut values = BTreeSet::new();
        for part in text.split(',') {
            parse_part(part.trim(), min, max, &mut values)?;
        }
        Ok(Self { values, star })
    }
}

fn parse_part(
    part: &str,
    min: u32,
    max: u32,
    values: &mut BTreeSet<u32>,
) -> Result<(), ScheduleParseError> {
    let field_err = |reason: &str| ScheduleParseError::Field {
        field: part.to_string(),
        reason: reason.to_string(),
    };

    let (range_text, step) = match part.split_once('/') {
        Some((range, step_text)) => {
            let step: u32 = step_text.parse().map_err(|_| field_err("invalid step"))?;
            if step == 0 {
                return Err(field_err("step must be positive"));
            }
            (range, Some(step))
        }
        None => (part, None),
    };

    let (start, end) = if range_text == "*" || range_text == "?" {
        (min, max)
    } else if let Some((lo, hi)) = range_text.split_once('-') {
        let lo: u32 = lo.parse().map_err(|_| field_err("invalid range start"))?;
        let hi: u32 = hi.parse().map_err(|_| field_err("invalid range end"))?;
        if lo > hi {
            return Err(field_err("range start exceeds end"));
        }
        (lo, hi)
    } else {
        let value: u32 = range_text.parse().map_err(|_| field_err("invalid value"))?;
        // A bare value with a step means "from value to max", cron style
        if step.is_some() {
            (value, max)
        } else {
            (value, value)
        }
    };

    let bounds_check = |value: u32| {
        if value < min || value > max {
            Err(ScheduleParseError::OutOfRange {
                field: part.to_string(),
                value,
                min,
                max,
            })
        } else {
            Ok(())
        }
    };
    bounds_check(start)?;
    bounds_check(end)?;

    let step = step.unwrap_or(1);
    let mut value = start;
    while value <= end {
        values.insert(value);
        value += step;
    }
    Ok(())
}

/// A parsed 5-field cron expression, evaluated in UTC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    month: FieldSet,
    day_of_week: FieldSet,
}

impl CronExpr {
    fn parse(expr: &str) -> Result<Self, ScheduleParseError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleParseError::FieldCount(fields.len()));
        }

        let mut day_of_week = FieldSet::parse(fields[4], 0, 7)?;
        // Both 0 and 7 mean Sunday
        if day_of_week.values.remove(&7) {
            day_of_week.values.insert(0);
        }

        Ok(Self {
            minute: FieldSet::parse(fields[0], 0, 59)?,
            hour: FieldSet::parse(fields[1], 0, 23)?,
            day_of_month: FieldSet::parse(fields[2], 1, 31)?,
            month: FieldSet::parse(fields[3], 1, 12)?,
            day_of_week,
        })
    }

    /// The day fields follow the classic cron rule: when both
    /// day-of-month and day-of-week are restricted, a day matching
    /// either one matches.
    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.day_of_month.contains(t.day());
        let dow = self.day_of_week.contains(t.weekday().num_days_from_sunday());
        match (self.day_of_month.star, self.day_of_week.star) {
            (true, true) => true,
            (false, true) => dom,
            (true, false) => dow,
            (false, false) => dom || dow,
        }
    }

    /// The next matching minute strictly after `after`, or `None` if the
    /// expression never matches within the search horizon (e.g. Feb 30).
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = (after + Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;
        // Four years covers every leap-day schedule
        let limit = after + Duration::days(4 * 366);

        while t <= limit {
            if !self.month.contains(t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = start_of_next_day(t)?;
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minute.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

fn first_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Some(
        NaiveDate::from_ymd_opt(year, month, 1)?
            .and_hms_opt(0, 0, 0)?
            .and_utc(),
    )
}

fn start_of_next_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc())
}

/// A parsed recurrence schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fires on matching wall-clock minutes
    Cron(CronExpr),
    /// Fires a fixed duration after the previous trigger
    Interval(Duration),
}

impl Schedule {
    /// Parse a schedule expression.
    ///
    /// Fails when the expression matches none of the supported grammars;
    /// the error is meant to be surfaced to the operator verbatim.
    pub fn parse(expr: &str) -> Result<Self, ScheduleParseError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(ScheduleParseError::Empty);
        }
        let expr = strip_timezone_prefix(expr)?;

        if let Some(interval) = expr.strip_prefix("@every") {
            let interval = parse_go_duration(interval.trim())?;
            if interval <= Duration::zero() {
                return Err(ScheduleParseError::NonPositiveInterval);
            }
            return Ok(Schedule::Interval(interval));
        }

        if let Some(name) = expr.strip_prefix('@') {
            let fields = match name {
                "yearly" | "annually" => "0 0 1 1 *",
                "monthly" => "0 0 1 * *",
                "weekly" => "0 0 * * 0",
                "daily" | "midnight" => "0 0 * * *",
                "hourly" => "0 * * * *",
                other => return Err(ScheduleParseError::UnknownPreset(other.to_string())),
            };
            return Ok(Schedule::Cron(CronExpr::parse(fields)?));
        }

        Ok(Schedule::Cron(CronExpr::parse(expr)?))
    }

    /// The next trigger strictly after `reference`, or `None` for a cron
    /// expression that never matches.
    pub fn next_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(expr) => expr.next_after(reference),
            Schedule::Interval(interval) => Some(reference + *interval),
        }
    }

    /// Whether a run is due at `now`, given when the last one started
    /// (or, if none ever ran, when the request was created). A trigger
    /// landing exactly on `now` counts as due.
    pub fn is_due(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.next_after(last).is_some_and(|t| t <= now)
    }
}

impl FromStr for Schedule {
    type Err = ScheduleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Schedule::parse(s)
    }
}

/// Strip a leading `CRON_TZ=<zone>` / `TZ=<zone>` token, rejecting any
/// zone we cannot evaluate.
fn strip_timezone_prefix(expr: &str) -> Result<&str, ScheduleParseError> {
    for prefix in ["CRON_TZ=", "TZ="] {
        if let Some(rest) = expr.strip_prefix(prefix) {
            let (zone, remainder) = rest
                .split_once(char::is_whitespace)
                .ok_or(ScheduleParseError::Empty)?;
            if zone != "UTC" && zone != "Etc/UTC" {
                return Err(ScheduleParseError::UnsupportedTimezone(zone.to_string()));
            }
            return Ok(remainder.trim_start());
        }
    }
    Ok(expr)
}

/// Parse a Go-style duration string: one or more `<number><unit>`
/// components, where the number may carry a fraction and the unit is one
/// of `h`, `m`, `s`, `ms`.
fn parse_go_duration(text: &str) -> Result<Duration, ScheduleParseError> {
    let invalid = || ScheduleParseError::InvalidDuration(text.to_string());

    if text.is_empty() {
        return Err(invalid());
    }

    let mut total_ms = 0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(invalid)?;
        if number_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_ms = match &rest[..unit_len] {
            "h" => 3_600_000f64,
            "m" => 60_000f64,
            "s" => 1_000f64,
            "ms" => 1f64,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];

        total_ms += value * unit_ms;
    }

    Ok(Duration::milliseconds(total_ms as i64))
}
