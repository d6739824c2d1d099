//! Cron expression parsing and next-fire computation (UTC).
//!
//! Accepted syntax:
//!
//! ```text
//! ┌──────────── second (0-59, optional leading field)
//! │ ┌────────── minute (0-59)
//! │ │ ┌──────── hour (0-23)
//! │ │ │ ┌────── day of month (1-31)
//! │ │ │ │ ┌──── month (1-12 or JAN-DEC)
//! │ │ │ │ │ ┌── day of week (0-7 or SUN-SAT, 0 and 7 are Sunday)
//! * * * * * *
//! ```
//!
//! Each field takes `*`, `?`, single values, `a-b` ranges, `/n` steps, and
//! comma lists. When both day-of-month and day-of-week are restricted a
//! time matches if *either* does.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

use crate::error::ReportError;

const MONTH_NAMES: &[(&str, u32)] = &[
    ("JAN", 1),
    ("FEB", 2),
    ("MAR", 3),
    ("APR", 4),
    ("MAY", 5),
    ("JUN", 6),
    ("JUL", 7),
    ("AUG", 8),
    ("SEP", 9),
    ("OCT", 10),
    ("NOV", 11),
    ("DEC", 12),
];

const WEEKDAY_NAMES: &[(&str, u32)] = &[
    ("SUN", 0),
    ("MON", 1),
    ("TUE", 2),
    ("WED", 3),
    ("THU", 4),
    ("FRI", 5),
    ("SAT", 6),
];

/// How many years ahead `next_after` searches before giving up
/// (e.g. `0 0 30 2 *` never fires).
const SEARCH_HORIZON_YEARS: i32 = 5;

/// Set of allowed values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1u64 << value) != 0
    }
}

/// A parsed cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self, ReportError> {
        let invalid = |reason: String| ReportError::InvalidCronExpression {
            expression: expression.to_string(),
            reason,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        let (seconds, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => return Err(invalid(format!("expected 5 or 6 fields, found {}", n))),
        };

        let field = |name: &str, text: &str, min: u32, max: u32, names: &[(&str, u32)]| {
            parse_field(text, min, max, names).map_err(|e| invalid(format!("{} field: {}", name, e)))
        };

        let mut days_of_week = field("day-of-week", rest[4], 0, 7, WEEKDAY_NAMES)?;
        if days_of_week.contains(7) {
            days_of_week = FieldSet((days_of_week.0 | 1) & !(1u64 << 7));
        }

        Ok(Self {
            source: expression.trim().to_string(),
            seconds: field("second", seconds, 0, 59, &[])?,
            minutes: field("minute", rest[0], 0, 59, &[])?,
            hours: field("hour", rest[1], 0, 23, &[])?,
            days_of_month: field("day-of-month", rest[2], 1, 31, &[])?,
            months: field("month", rest[3], 1, 12, MONTH_NAMES)?,
            days_of_week,
            dom_restricted: is_restricted(rest[2]),
            dow_restricted: is_restricted(rest[4]),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The first fire time strictly after `after`, to the second.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_nanosecond(0)? + Duration::seconds(1);
        let horizon = after.year() + SEARCH_HORIZON_YEARS;

        while t.year() <= horizon {
            if !self.months.contains(t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = start_of_day(t.date_naive().succ_opt()?)?;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.with_minute(0)?.with_second(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t = t.with_second(0)? + Duration::minutes(1);
                continue;
            }
            if !self.seconds.contains(t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    /// The next `count` fire times after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = after;
        while out.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    out.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        out
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(t.day());
        let dow = self.days_of_week.contains(t.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronExpression {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn is_restricted(text: &str) -> bool {
    !(text.starts_with('*') || text == "?")
}

fn start_of_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    start_of_day(NaiveDate::from_ymd_opt(year, month, 1)?)
}

fn parse_value(text: &str, names: &[(&str, u32)]) -> Result<u32, String> {
    if let Ok(n) = text.parse::<u32>() {
        return Ok(n);
    }
    let upper = text.to_ascii_uppercase();
    names
        .iter()
        .find(|(name, _)| *name == upper)
        .map(|(_, value)| *value)
        .ok_or_else(|| format!("invalid value '{}'", text))
}

fn parse_field(text: &str, min: u32, max: u32, names: &[(&str, u32)]) -> Result<FieldSet, String> {
    let mut bits = 0u64;
    for part in text.split(',') {
        if part.is_empty() {
            return Err("empty list element".to_string());
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}'", step))?;
                if step == 0 {
                    return Err("step must be greater than zero".to_string());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" || range == "?" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, names)?, parse_value(b, names)?)
        } else {
            let v = parse_value(range, names)?;
            (v, if step.is_some() { max } else { v })
        };

        if start < min || end > max {
            return Err(format!("'{}' out of range {}-{}", part, min, max));
        }
        if start > end {
            return Err(format!("range '{}' is reversed", part));
        }

        let step = step.unwrap_or(1) as usize;
        for v in (start..=end).step_by(step) {
            bits |= 1u64 << v;
        }
    }
    Ok(FieldSet(bits))
}
