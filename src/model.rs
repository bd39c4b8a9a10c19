//! Typed view of partitioned tables.
//!
//! Nothing here is persisted: partitions and range groups are rebuilt from
//! the catalog on every call.

use crate::error::PartitionError;
use crate::ident::{quote_literal, QualifiedName};
use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Suffix of the partition holding the rows that existed at conversion time.
pub const ORIGINAL_DATA_SUFFIX: &str = "original_data";
/// Suffix of the structural template created when the parent cannot carry indexes.
pub const TEMPLATE_SUFFIX: &str = "template";
/// Suffix of the catch-all child of an inheritance-partitioned table.
pub const OVERFLOW_SUFFIX: &str = "overflow";

/// The base-type family of a partitioning column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnFamily {
    Integer,
    Date,
    Timestamp,
    TimestampTz,
}

impl ColumnFamily {
    /// Map a `format_type()` name to its family.
    pub fn from_type_name(type_name: &str) -> Option<Self> {
        let normalized = type_name.trim().to_ascii_lowercase();
        // precision modifiers: "timestamp(3) without time zone"
        let base = match (normalized.find('('), normalized.find(')')) {
            (Some(open), Some(close)) if close > open => {
                format!("{}{}", &normalized[..open], &normalized[close + 1..])
            }
            _ => normalized,
        };
        match base.trim() {
            "smallint" | "integer" | "bigint" | "int" | "int2" | "int4" | "int8" => Some(Self::Integer),
            "date" => Some(Self::Date),
            "timestamp" | "timestamp without time zone" => Some(Self::Timestamp),
            "timestamptz" | "timestamp with time zone" => Some(Self::TimestampTz),
            _ => None,
        }
    }

    pub fn is_temporal(self) -> bool {
        !matches!(self, Self::Integer)
    }
}

/// A typed partition bound or column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BoundValue {
    Integer(i64),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

static TZ_OFFSET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([+-]\d{2})(:?\d{2})?(:?\d{2})?$").expect("static regex")
});

impl BoundValue {
    /// Parse catalog text (`'2023-01-01'::date`, `1000000`, ...) for `family`.
    pub fn parse(family: ColumnFamily, text: &str) -> Result<Self, PartitionError> {
        let invalid = || PartitionError::InvalidBound(format!("{text:?} is not a valid {family:?} value"));
        let mut value = text.trim();
        if let Some(cast) = value.rfind("::") {
            if value[..cast].ends_with('\'') || !value[..cast].contains('\'') {
                value = &value[..cast];
            }
        }
        let value = value.trim().trim_matches('\'').trim();

        match family {
            ColumnFamily::Integer => value.parse::<i64>().map(Self::Integer).map_err(|_| invalid()),
            ColumnFamily::Date => NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .map(Self::Date)
                .map_err(|_| invalid()),
            ColumnFamily::Timestamp => parse_naive_timestamp(value).map(Self::Timestamp).ok_or_else(invalid),
            ColumnFamily::TimestampTz => parse_timestamptz(value).map(Self::TimestampTz).ok_or_else(invalid),
        }
    }

    pub fn family(&self) -> ColumnFamily {
        match self {
            Self::Integer(_) => ColumnFamily::Integer,
            Self::Date(_) => ColumnFamily::Date,
            Self::Timestamp(_) => ColumnFamily::Timestamp,
            Self::TimestampTz(_) => ColumnFamily::TimestampTz,
        }
    }

    /// Midnight of `date`, in the representation of `family`.
    pub fn start_of_day(family: ColumnFamily, date: NaiveDate, zone: Tz) -> Option<Self> {
        Self::from_datetime(family, date.and_hms_opt(0, 0, 0)?, zone)
    }

    /// Convert a wall-clock time into `family`; `TimestampTz` reads it in `zone`.
    pub fn from_datetime(family: ColumnFamily, at: NaiveDateTime, zone: Tz) -> Option<Self> {
        match family {
            ColumnFamily::Integer => None,
            ColumnFamily::Date => Some(Self::Date(at.date())),
            ColumnFamily::Timestamp => Some(Self::Timestamp(at)),
            ColumnFamily::TimestampTz => local_to_utc(zone, at).map(Self::TimestampTz),
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Wall-clock time of a temporal value, `TimestampTz` as seen in `zone`;
    /// dates are midnight.
    pub fn as_datetime(&self, zone: Tz) -> Option<NaiveDateTime> {
        match self {
            Self::Integer(_) => None,
            Self::Date(d) => d.and_hms_opt(0, 0, 0),
            Self::Timestamp(ts) => Some(*ts),
            Self::TimestampTz(ts) => Some(ts.with_timezone(&zone).naive_local()),
        }
    }

    /// Render as a SQL literal usable in `FOR VALUES` and `CHECK` clauses.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Self::Integer(v) => v.to_string(),
            _ => quote_literal(&self.to_string()),
        }
    }

    /// Name fragment: time of day (when midnight) and punctuation stripped.
    pub fn name_fragment(&self, zone: Tz) -> String {
        match self {
            Self::Integer(v) if *v < 0 => format!("m{}", v.unsigned_abs()),
            Self::Integer(v) => v.to_string(),
            Self::Date(d) => d.format("%Y%m%d").to_string(),
            Self::Timestamp(_) | Self::TimestampTz(_) => {
                let at = self.as_datetime(zone).unwrap_or_default();
                if at.num_seconds_from_midnight() == 0 && at.nanosecond() == 0 {
                    at.format("%Y%m%d").to_string()
                } else {
                    at.format("%Y%m%d%H%M%S").to_string()
                }
            }
        }
    }
}

impl fmt::Display for BoundValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
            Self::TimestampTz(ts) => write!(f, "{}+00", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

fn parse_naive_timestamp(value: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_timestamptz(value: &str) -> Option<DateTime<Utc>> {
    // PostgreSQL prints offsets as "+00", "+05:30" or "-03:30:15"; chrono wants "+hhmm".
    let Some(offset) = TZ_OFFSET.find(value) else {
        return parse_naive_timestamp(value).map(|naive| naive.and_utc());
    };
    let local = parse_naive_timestamp(value[..offset.start()].trim())?;
    let digits: String = offset.as_str().chars().filter(|c| c.is_ascii_digit()).collect();
    let sign = if offset.as_str().starts_with('-') { -1 } else { 1 };
    let hours: i64 = digits.get(0..2)?.parse().ok()?;
    let minutes: i64 = digits.get(2..4).map_or(Some(0), |m| m.parse().ok())?;
    let seconds: i64 = digits.get(4..6).map_or(Some(0), |s| s.parse().ok())?;
    let offset_secs = sign * (hours * 3600 + minutes * 60 + seconds);
    Some((local - chrono::Duration::seconds(offset_secs)).and_utc())
}

/// Read a wall-clock time in `zone` the way PostgreSQL reads a timestamptz
/// literal without an offset.
fn local_to_utc(zone: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match zone.from_local_datetime(&local) {
        LocalResult::Single(at) => Some(at.with_timezone(&Utc)),
        // repeated hour: standard time
        LocalResult::Ambiguous(_, later) => Some(later.with_timezone(&Utc)),
        // skipped hour: the offset in force before the jump
        LocalResult::None => {
            let before = zone.offset_from_utc_datetime(&(local - chrono::Duration::days(1))).fix();
            let shifted = local.checked_sub_signed(chrono::Duration::seconds(i64::from(before.local_minus_utc())))?;
            Some(shifted.and_utc())
        }
    }
}

/// Half-open range `[lower, upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionBounds {
    pub lower: BoundValue,
    pub upper: BoundValue,
}

impl PartitionBounds {
    pub fn new(lower: BoundValue, upper: BoundValue) -> Result<Self, PartitionError> {
        if lower.family() != upper.family() {
            return Err(PartitionError::InvalidBound(format!(
                "bounds {lower} and {upper} have different types"
            )));
        }
        if lower >= upper {
            return Err(PartitionError::InvalidBound(format!(
                "lower bound {lower} is not below upper bound {upper}"
            )));
        }
        Ok(Self { lower, upper })
    }

    pub fn family(&self) -> ColumnFamily {
        self.lower.family()
    }

    pub fn contains(&self, value: &BoundValue) -> bool {
        self.lower <= *value && *value < self.upper
    }

    pub fn overlaps(&self, other: &PartitionBounds) -> bool {
        self.lower < other.upper && other.lower < self.upper
    }

    /// `<lower>_<upper>` as used in partition names.
    pub fn name_suffix(&self, zone: Tz) -> String {
        format!("{}_{}", self.lower.name_fragment(zone), self.upper.name_fragment(zone))
    }
}

/// Which independent partition sequence a child belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RangeKey {
    #[default]
    Default,
    Group(u32),
}

impl RangeKey {
    /// Derive the group from a child named `<parent>_g<N>_...`.
    pub fn from_partition_name(parent: &str, child: &str) -> Self {
        child
            .strip_prefix(parent)
            .and_then(|rest| rest.strip_prefix("_g"))
            .and_then(|rest| {
                let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
                let tail = &rest[digits.len()..];
                (!digits.is_empty() && tail.starts_with('_')).then(|| digits.parse().ok()).flatten()
            })
            .map_or(Self::Default, Self::Group)
    }

    /// Prefix for new child names in this group.
    pub fn name_prefix(&self, parent: &str) -> String {
        match self {
            Self::Default => parent.to_string(),
            Self::Group(n) => format!("{parent}_g{n}"),
        }
    }
}

impl fmt::Display for RangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Group(n) => write!(f, "g{n}"),
        }
    }
}

/// How the children are tied to the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStrategy {
    /// Declarative `PARTITION BY RANGE`
    Native,
    /// Legacy `INHERITS` children guarded by range CHECK constraints
    Inheritance,
}

impl fmt::Display for PartitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => f.write_str("native"),
            Self::Inheritance => f.write_str("inheritance"),
        }
    }
}

impl std::str::FromStr for PartitionStrategy {
    type Err = PartitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" | "range" => Ok(Self::Native),
            "inheritance" | "inherit" => Ok(Self::Inheritance),
            other => Err(PartitionError::Configuration(format!("unknown partitioning strategy {other}"))),
        }
    }
}

/// A child relation of a partitioned table.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub name: String,
    /// `None` for the DEFAULT partition and the inheritance overflow child.
    pub bounds: Option<PartitionBounds>,
    pub range_key: RangeKey,
    pub is_default: bool,
    pub is_original_data: bool,
    pub storage_options: Vec<String>,
}

impl Partition {
    /// Classify a child as reported by the catalog.
    pub fn from_catalog(parent: &str, child: &str, bounds: Option<PartitionBounds>, storage_options: Vec<String>) -> Self {
        Self {
            name: child.to_string(),
            is_default: bounds.is_none(),
            bounds,
            range_key: RangeKey::from_partition_name(parent, child),
            is_original_data: is_original_data_name(child),
            storage_options,
        }
    }

    /// Eligible for automatic selection (growth template, counting, detach).
    pub fn is_generated(&self) -> bool {
        !self.is_default && !self.is_original_data && self.bounds.is_some()
    }

    pub fn lower(&self) -> Option<BoundValue> {
        self.bounds.map(|b| b.lower)
    }
}

pub fn is_original_data_name(name: &str) -> bool {
    name.ends_with(&format!("_{ORIGINAL_DATA_SUFFIX}"))
}

/// Ordered partitions of one range group.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeGroup {
    pub key: RangeKey,
    pub partitions: Vec<Partition>,
}

impl RangeGroup {
    /// Group bounded partitions by range key, each group ordered by lower bound.
    /// The catch-all partition belongs to no group.
    pub fn group(partitions: &[Partition]) -> Vec<RangeGroup> {
        let mut groups: Vec<RangeGroup> = Vec::new();
        for partition in partitions.iter().filter(|p| p.bounds.is_some()) {
            match groups.iter_mut().find(|g| g.key == partition.range_key) {
                Some(group) => group.partitions.push(partition.clone()),
                None => groups.push(RangeGroup {
                    key: partition.range_key,
                    partitions: vec![partition.clone()],
                }),
            }
        }
        for group in &mut groups {
            group.partitions.sort_by_key(Partition::lower);
        }
        groups.sort_by_key(|g| g.key);
        groups
    }

    /// Generated partitions (no original data), oldest first.
    pub fn generated(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter().filter(|p| p.is_generated())
    }

    pub fn latest(&self) -> Option<&Partition> {
        self.generated().last()
    }

    pub fn oldest(&self) -> Option<&Partition> {
        self.generated().next()
    }

    /// Adjacent pairs whose bounds do not meet exactly.
    pub fn gaps(&self) -> Vec<(String, String)> {
        self.partitions
            .windows(2)
            .filter_map(|pair| match (pair[0].bounds, pair[1].bounds) {
                (Some(a), Some(b)) if a.upper != b.lower => Some((pair[0].name.clone(), pair[1].name.clone())),
                _ => None,
            })
            .collect()
    }
}

/// A resolved partitioned table: key column, its family and the strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionedTable {
    pub table: QualifiedName,
    pub column: String,
    pub family: ColumnFamily,
    pub strategy: PartitionStrategy,
    /// Session time zone; calendar steps of `timestamptz` keys are taken in it
    pub zone: Tz,
}

impl PartitionedTable {
    pub fn child(&self, name: &str) -> Result<QualifiedName, PartitionError> {
        self.table.sibling(name)
    }
}
