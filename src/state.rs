//! Durable engine state: per-table maintenance settings and the registry of
//! detached partitions awaiting drop.

use crate::error::PartitionError;
use crate::ident::QualifiedName;
use crate::interval::CalendarInterval;
use chrono::NaiveDate;
use sea_query::{ColumnDef, Index, IntoIden, PostgresQueryBuilder, SchemaName, Table, TableCreateStatement, TableName};
use serde::{Deserialize, Serialize};

/// Minimum cool-down between detach and drop.
pub const MIN_DROP_COOL_DOWN_DAYS: i32 = 4;
/// Lowest `nr` the orchestrator will aim for.
pub const MIN_FREE_PARTITIONS: u32 = 3;
/// Partitions kept ahead of the configured minimum.
pub const FREE_PARTITION_MARGIN: u32 = 2;

/// Pruning constraint request: add `<marker>_min` / `<marker>_max` checks on `constraint_column`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateConstraint {
    pub marker: String,
    pub constraint_column: String,
}

/// Maintenance settings for one table, stored as a JSON object.
///
/// ```json
/// {"auto-maintenance": true, "nr": 5, "detach": "3 months", "drop_detached": "7 days",
///  "date_constraint": {"marker": "created", "constraint_column": "created_at"}}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSettings {
    #[serde(rename = "auto-maintenance", default)]
    pub auto_maintenance: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nr: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_constraint: Option<DateConstraint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detach: Option<CalendarInterval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_detached: Option<CalendarInterval>,
}

impl PartitionSettings {
    pub fn from_json(text: &str) -> Result<Self, PartitionError> {
        serde_json::from_str(text).map_err(|e| PartitionError::Configuration(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, PartitionError> {
        serde_json::to_string(self).map_err(|e| PartitionError::Configuration(e.to_string()))
    }

    /// Free partitions the orchestrator keeps: `max(nr, 3) + 2`.
    pub fn target_free_partitions(&self) -> u32 {
        self.nr.unwrap_or(0).max(MIN_FREE_PARTITIONS) + FREE_PARTITION_MARGIN
    }

    /// Drop cool-down with its four-day floor applied, if dropping is configured.
    ///
    /// The floor is applied to the resulting cutoff rather than to the
    /// interval, since months and days do not compare directly.
    pub fn drop_cutoff(&self, today: NaiveDate) -> Option<NaiveDate> {
        let cool_down = self.drop_detached?;
        let configured = cool_down.before_date(today)?.date();
        let floor = CalendarInterval::days(MIN_DROP_COOL_DOWN_DAYS).before_date(today)?.date();
        Some(configured.min(floor))
    }
}

/// A configuration row as stored; decoded per row so one bad row cannot
/// stop a maintenance run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredConfiguration {
    pub schema: String,
    pub table: String,
    pub config: String,
}

impl StoredConfiguration {
    pub fn decode(&self) -> Result<(QualifiedName, PartitionSettings), PartitionError> {
        let table = QualifiedName::new(self.schema.clone(), self.table.clone())?;
        let settings = PartitionSettings::from_json(&self.config)?;
        Ok((table, settings))
    }
}

/// A partition detached by the engine and not yet dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedPartitionRecord {
    pub schema: String,
    pub parent: String,
    pub partition: String,
    /// Bound literals as they were when attached
    pub lower_bound: String,
    pub upper_bound: String,
    pub detached_on: NaiveDate,
}

impl DetachedPartitionRecord {
    pub fn partition_name(&self) -> Result<QualifiedName, PartitionError> {
        QualifiedName::new(self.schema.clone(), self.partition.clone())
    }
}

fn table_ref(table: &QualifiedName) -> TableName {
    TableName(Some(SchemaName::from(table.schema.clone())), table.name.clone().into_iden())
}

/// `CREATE TABLE IF NOT EXISTS` for the configuration table.
pub fn create_config_table(table: &QualifiedName) -> TableCreateStatement {
    Table::create()
        .table(table_ref(table))
        .if_not_exists()
        .col(ColumnDef::new("schema_name").text().not_null())
        .col(ColumnDef::new("table_name").text().not_null())
        .col(ColumnDef::new("config").json_binary().not_null())
        .primary_key(Index::create().col("schema_name").col("table_name"))
        .to_owned()
}

/// `CREATE TABLE IF NOT EXISTS` for the detached-partition registry.
pub fn create_detached_table(table: &QualifiedName) -> TableCreateStatement {
    Table::create()
        .table(table_ref(table))
        .if_not_exists()
        .col(ColumnDef::new("schema_name").text().not_null())
        .col(ColumnDef::new("parent_name").text().not_null())
        .col(ColumnDef::new("partition_name").text().not_null())
        .col(ColumnDef::new("lower_bound").text().not_null())
        .col(ColumnDef::new("upper_bound").text().not_null())
        .col(ColumnDef::new("detached_on").date().not_null())
        .primary_key(
            Index::create()
                .col("schema_name")
                .col("parent_name")
                .col("partition_name"),
        )
        .to_owned()
}

/// Statements creating the state schema and tables, in execution order.
pub fn state_table_statements(config_table: &QualifiedName, detached_table: &QualifiedName) -> Vec<String> {
    let mut statements = vec![format!(
        "CREATE SCHEMA IF NOT EXISTS {}",
        crate::ident::quote_ident(&config_table.schema)
    )];
    if detached_table.schema != config_table.schema {
        statements.push(format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            crate::ident::quote_ident(&detached_table.schema)
        ));
    }
    statements.push(create_config_table(config_table).build(PostgresQueryBuilder));
    statements.push(create_detached_table(detached_table).build(PostgresQueryBuilder));
    statements
}
