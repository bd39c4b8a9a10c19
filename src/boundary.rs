//! Boundary arithmetic and deterministic naming.

use crate::error::PartitionError;
use crate::ident::truncate_with_suffix;
use crate::interval::CalendarInterval;
use crate::model::{
    BoundValue, ColumnFamily, PartitionBounds, RangeKey, ORIGINAL_DATA_SUFFIX, OVERFLOW_SUFFIX,
    TEMPLATE_SUFFIX,
};
use chrono_tz::Tz;
use std::fmt;

/// Width of a partition: a count for integer keys, a calendar interval otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionInterval {
    Count(i64),
    Calendar(CalendarInterval),
}

impl PartitionInterval {
    /// Parse `text` in the unit required by `family`.
    pub fn parse(family: ColumnFamily, text: &str) -> Result<Self, PartitionError> {
        match family {
            ColumnFamily::Integer => {
                let count: i64 = text
                    .trim()
                    .parse()
                    .map_err(|_| PartitionError::InvalidInterval(format!("{text:?} is not an integer width")))?;
                if count <= 0 {
                    return Err(PartitionError::InvalidInterval(format!("width must be positive, got {count}")));
                }
                Ok(Self::Count(count))
            }
            _ => {
                let interval: CalendarInterval = text.parse()?;
                if !interval.is_positive() {
                    return Err(PartitionError::InvalidInterval(format!("interval must be positive, got {interval}")));
                }
                Ok(Self::Calendar(interval))
            }
        }
    }

    /// `value + self`, failing when the units do not match or the result overflows.
    ///
    /// Calendar steps move the wall clock of `zone`, so a month that starts
    /// at local midnight is followed by one that does too across a DST change.
    pub fn advance(&self, value: &BoundValue, zone: Tz) -> Result<BoundValue, PartitionError> {
        match (self, value) {
            (Self::Count(width), BoundValue::Integer(v)) => v
                .checked_add(*width)
                .map(BoundValue::Integer)
                .ok_or_else(|| PartitionError::InvalidBound(format!("{v} + {width} overflows"))),
            (Self::Calendar(interval), temporal) if temporal.family().is_temporal() => {
                let at = temporal.as_datetime(zone).and_then(|at| interval.add_to(at));
                at.and_then(|at| BoundValue::from_datetime(temporal.family(), at, zone))
                    .ok_or_else(|| PartitionError::InvalidBound(format!("{temporal} + {interval} is out of range")))
            }
            _ => Err(PartitionError::InvalidInterval(format!(
                "{self} cannot be applied to a {:?} bound",
                value.family()
            ))),
        }
    }

    /// Width of an existing partition: `upper - lower` or `age(upper, lower)`.
    pub fn width_of(bounds: &PartitionBounds, zone: Tz) -> Result<Self, PartitionError> {
        match (bounds.lower, bounds.upper) {
            (BoundValue::Integer(lower), BoundValue::Integer(upper)) => Ok(Self::Count(upper - lower)),
            (lower, upper) => {
                let (Some(lower), Some(upper)) = (lower.as_datetime(zone), upper.as_datetime(zone)) else {
                    return Err(PartitionError::InvalidBound(format!("{lower}..{upper} is not a temporal range")));
                };
                CalendarInterval::between(lower, upper).map(Self::Calendar)
            }
        }
    }
}

impl fmt::Display for PartitionInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(n) => write!(f, "{n}"),
            Self::Calendar(interval) => write!(f, "{interval}"),
        }
    }
}

/// The partition following `current`, with the same width.
///
/// Temporal widths are measured with `age()` and reapplied with calendar
/// addition, so a partition that spans a calendar month is followed by the
/// next calendar month even when the two months differ in length.
pub fn next_bounds(current: &PartitionBounds, zone: Tz) -> Result<PartitionBounds, PartitionError> {
    let width = PartitionInterval::width_of(current, zone)?;
    let upper = width.advance(&current.upper, zone)?;
    PartitionBounds::new(current.upper, upper)
}

/// `[start, start + interval)`.
pub fn bounds_from(start: BoundValue, interval: &PartitionInterval, zone: Tz) -> Result<PartitionBounds, PartitionError> {
    let upper = interval.advance(&start, zone)?;
    PartitionBounds::new(start, upper)
}

/// `<table>[_g<N>]_<lower>_<upper>`, shortened to fit an identifier.
pub fn partition_name(table: &str, range_key: RangeKey, bounds: &PartitionBounds, zone: Tz) -> String {
    truncate_with_suffix(&range_key.name_prefix(table), &bounds.name_suffix(zone))
}

pub fn original_data_name(table: &str) -> String {
    truncate_with_suffix(table, ORIGINAL_DATA_SUFFIX)
}

pub fn template_name(table: &str) -> String {
    truncate_with_suffix(table, TEMPLATE_SUFFIX)
}

pub fn overflow_name(table: &str) -> String {
    truncate_with_suffix(table, OVERFLOW_SUFFIX)
}

/// Temporary CHECK that lets `ATTACH PARTITION` skip its validation scan.
pub fn attach_check_name(child: &str) -> String {
    truncate_with_suffix(child, "attach_check")
}

/// Permanent bound constraint of an inheritance child.
pub fn range_check_name(child: &str) -> String {
    truncate_with_suffix(child, "range_check")
}

pub fn pruning_min_name(child: &str, marker: &str) -> String {
    truncate_with_suffix(child, &format!("{marker}_min"))
}

pub fn pruning_max_name(child: &str, marker: &str) -> String {
    truncate_with_suffix(child, &format!("{marker}_max"))
}
