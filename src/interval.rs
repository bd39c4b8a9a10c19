//! Calendar intervals with PostgreSQL semantics.
//!
//! Partition widths for date and timestamp keys are kept as
//! months/days/microseconds, the same decomposition PostgreSQL uses, so a
//! "1 month" partition stays one calendar month wide across February.

use crate::error::PartitionError;
use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_MINUTE: i64 = 60 * MICROS_PER_SECOND;
const MICROS_PER_HOUR: i64 = 60 * MICROS_PER_MINUTE;

/// A calendar-aware interval (`months`, `days`, `micros`), as in PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CalendarInterval {
    pub months: i32,
    pub days: i32,
    pub micros: i64,
}

impl CalendarInterval {
    pub const fn new(months: i32, days: i32, micros: i64) -> Self {
        Self { months, days, micros }
    }

    pub const fn days(days: i32) -> Self {
        Self::new(0, days, 0)
    }

    pub const fn months(months: i32) -> Self {
        Self::new(months, 0, 0)
    }

    /// Equivalent of PostgreSQL `age(upper, lower)` for `upper >= lower`.
    ///
    /// Fields are subtracted one by one and borrows are propagated upwards;
    /// a day borrow uses the length of `lower`'s month, which is what makes
    /// `age('2023-03-01', '2023-02-01')` come out as exactly one month.
    pub fn between(lower: NaiveDateTime, upper: NaiveDateTime) -> Result<Self, PartitionError> {
        if upper < lower {
            return Err(PartitionError::InvalidBound(format!(
                "upper bound {upper} is before lower bound {lower}"
            )));
        }

        let mut micros = i64::from(upper.nanosecond() / 1_000) - i64::from(lower.nanosecond() / 1_000);
        let mut sec = i64::from(upper.second()) - i64::from(lower.second());
        let mut min = i64::from(upper.minute()) - i64::from(lower.minute());
        let mut hour = i64::from(upper.hour()) - i64::from(lower.hour());
        let mut mday = i64::from(upper.day()) - i64::from(lower.day());
        let mut mon = i64::from(upper.month()) - i64::from(lower.month());
        let mut year = i64::from(upper.year()) - i64::from(lower.year());

        while micros < 0 {
            micros += MICROS_PER_SECOND;
            sec -= 1;
        }
        while sec < 0 {
            sec += 60;
            min -= 1;
        }
        while min < 0 {
            min += 60;
            hour -= 1;
        }
        while hour < 0 {
            hour += 24;
            mday -= 1;
        }
        while mday < 0 {
            mday += i64::from(days_in_month(lower.year(), lower.month()));
            mon -= 1;
        }
        while mon < 0 {
            mon += 12;
            year -= 1;
        }

        let months = i32::try_from(year * 12 + mon)
            .map_err(|_| PartitionError::InvalidInterval("interval overflows months".to_string()))?;
        let days = i32::try_from(mday)
            .map_err(|_| PartitionError::InvalidInterval("interval overflows days".to_string()))?;
        Ok(Self {
            months,
            days,
            micros: hour * MICROS_PER_HOUR + min * MICROS_PER_MINUTE + sec * MICROS_PER_SECOND + micros,
        })
    }

    /// `timestamp + interval`: months first (clamping to month end), then days, then time.
    pub fn add_to(&self, at: NaiveDateTime) -> Option<NaiveDateTime> {
        let shifted = if self.months >= 0 {
            at.checked_add_months(Months::new(self.months.unsigned_abs()))?
        } else {
            at.checked_sub_months(Months::new(self.months.unsigned_abs()))?
        };
        shifted
            .checked_add_signed(Duration::days(i64::from(self.days)))?
            .checked_add_signed(Duration::microseconds(self.micros))
    }

    /// `timestamp - interval`.
    pub fn sub_from(&self, at: NaiveDateTime) -> Option<NaiveDateTime> {
        self.negated().add_to(at)
    }

    /// `date - interval`, evaluated from midnight.
    pub fn before_date(&self, date: NaiveDate) -> Option<NaiveDateTime> {
        self.sub_from(date.and_hms_opt(0, 0, 0)?)
    }

    pub fn negated(&self) -> Self {
        Self::new(-self.months, -self.days, -self.micros)
    }

    /// True when adding the interval moves every instant forward.
    pub fn is_positive(&self) -> bool {
        self.months >= 0 && self.days >= 0 && self.micros >= 0 && *self != Self::default()
    }
}

impl FromStr for CalendarInterval {
    type Err = PartitionError;

    /// Accepts the PostgreSQL output style and the common input spellings:
    /// `1 month`, `3 mons`, `1 year 2 mons 3 days`, `1 week`, `12:00:00`,
    /// `1 day 06:30`, `-2 days`.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let invalid = || PartitionError::InvalidInterval(text.to_string());
        let trimmed = text.trim().trim_start_matches('@').trim();
        if trimmed.is_empty() {
            return Err(invalid());
        }

        let mut interval = CalendarInterval::default();
        let mut tokens = trimmed.split_whitespace().peekable();
        while let Some(token) = tokens.next() {
            if token.contains(':') {
                interval.micros += parse_clock(token).ok_or_else(invalid)?;
                continue;
            }
            // "3days" as well as "3 days"
            let split_at = token
                .find(|c: char| c.is_ascii_alphabetic())
                .unwrap_or(token.len());
            let (number, attached_unit) = token.split_at(split_at);
            let amount: i64 = number.parse().map_err(|_| invalid())?;
            let unit = if attached_unit.is_empty() {
                tokens.next().ok_or_else(invalid)?
            } else {
                attached_unit
            };
            apply_unit(&mut interval, amount, &unit.to_ascii_lowercase()).ok_or_else(invalid)?;
        }
        Ok(interval)
    }
}

fn apply_unit(interval: &mut CalendarInterval, amount: i64, unit: &str) -> Option<()> {
    let amount32 = i32::try_from(amount).ok()?;
    match unit.trim_end_matches(',') {
        "y" | "yr" | "yrs" | "year" | "years" => interval.months += amount32.checked_mul(12)?,
        "mon" | "mons" | "month" | "months" => interval.months += amount32,
        "w" | "week" | "weeks" => interval.days += amount32.checked_mul(7)?,
        "d" | "day" | "days" => interval.days += amount32,
        "h" | "hour" | "hours" => interval.micros += amount.checked_mul(MICROS_PER_HOUR)?,
        "m" | "min" | "mins" | "minute" | "minutes" => {
            interval.micros += amount.checked_mul(MICROS_PER_MINUTE)?
        }
        "s" | "sec" | "secs" | "second" | "seconds" => {
            interval.micros += amount.checked_mul(MICROS_PER_SECOND)?
        }
        _ => return None,
    }
    Some(())
}

fn parse_clock(token: &str) -> Option<i64> {
    let (negative, token) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let mut parts = token.split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: f64 = match parts.next() {
        Some(s) => s.parse().ok()?,
        None => 0.0,
    };
    if parts.next().is_some() || !(0..60).contains(&minutes) || !(0.0..60.0).contains(&seconds) {
        return None;
    }
    let micros = hours * MICROS_PER_HOUR + minutes * MICROS_PER_MINUTE + (seconds * 1e6).round() as i64;
    Some(if negative { -micros } else { micros })
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map_or(31, |last| last.day())
}

impl fmt::Display for CalendarInterval {
    /// PostgreSQL `postgres` interval style, e.g. `1 year 2 mons 3 days 04:05:06`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        let years = self.months / 12;
        let months = self.months % 12;
        if years != 0 {
            parts.push(format!("{years} year{}", if years.abs() == 1 { "" } else { "s" }));
        }
        if months != 0 {
            parts.push(format!("{months} mon{}", if months.abs() == 1 { "" } else { "s" }));
        }
        if self.days != 0 {
            parts.push(format!("{} day{}", self.days, if self.days.abs() == 1 { "" } else { "s" }));
        }
        if self.micros != 0 || parts.is_empty() {
            let sign = if self.micros < 0 { "-" } else { "" };
            let total = self.micros.abs();
            let hours = total / MICROS_PER_HOUR;
            let minutes = (total % MICROS_PER_HOUR) / MICROS_PER_MINUTE;
            let seconds = (total % MICROS_PER_MINUTE) / MICROS_PER_SECOND;
            let fraction = total % MICROS_PER_SECOND;
            if fraction == 0 {
                parts.push(format!("{sign}{hours:02}:{minutes:02}:{seconds:02}"));
            } else {
                parts.push(format!("{sign}{hours:02}:{minutes:02}:{seconds:02}.{fraction:06}"));
            }
        }
        f.write_str(&parts.join(" "))
    }
}

impl TryFrom<String> for CalendarInterval {
    type Error = PartitionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CalendarInterval> for String {
    fn from(value: CalendarInterval) -> Self {
        value.to_string()
    }
}
