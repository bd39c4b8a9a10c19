//! Database capabilities the engine consumes.
//!
//! [`Catalog`] answers typed introspection questions, [`SchemaExecutor`]
//! runs [`Ddl`] and [`PartitionStateStore`] owns the engine's own tables.
//! [`PgBackend`] implements all three over a [`PgExecutor`](crate::PgExecutor).

mod postgres;

pub use postgres::PgBackend;

use crate::ddl::{Ddl, ForeignKeyDefinition};
use crate::executor::ExecError;
use crate::ident::QualifiedName;
use crate::model::{BoundValue, ColumnFamily, Partition, PartitionStrategy, PartitionedTable};
use crate::state::{DetachedPartitionRecord, PartitionSettings, StoredConfiguration};
use chrono::NaiveDate;
use chrono_tz::Tz;
use std::collections::HashSet;
use std::time::Duration;

/// Registered range key of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionKey {
    pub column: String,
    pub strategy: PartitionStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub name: String,
    /// Plain key columns; expression entries are omitted.
    pub columns: Vec<String>,
    pub unique: bool,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerInfo {
    pub name: String,
    /// `pg_get_triggerdef` output
    pub definition: String,
}

/// Typed catalog introspection.
pub trait Catalog {
    fn table_exists(&self, table: &QualifiedName) -> Result<bool, ExecError>;

    /// The range key, if the table is partitioned natively or by inheritance.
    fn partition_key(&self, table: &QualifiedName) -> Result<Option<PartitionKey>, ExecError>;

    /// `format_type` of the column's base type, `None` if the column does not exist.
    fn column_type(&self, table: &QualifiedName, column: &str) -> Result<Option<String>, ExecError>;

    /// Children of `table` with typed bounds, in no particular order.
    fn partitions(&self, table: &PartitionedTable) -> Result<Vec<Partition>, ExecError>;

    fn max_value(&self, table: &QualifiedName, column: &str, family: ColumnFamily)
        -> Result<Option<BoundValue>, ExecError>;

    fn min_value(&self, table: &QualifiedName, column: &str, family: ColumnFamily)
        -> Result<Option<BoundValue>, ExecError>;

    fn row_exists(&self, table: &QualifiedName, column: &str, value: &BoundValue) -> Result<bool, ExecError>;

    fn has_rows(&self, table: &QualifiedName) -> Result<bool, ExecError>;

    /// The database's `current_date`.
    fn current_date(&self) -> Result<NaiveDate, ExecError>;

    /// The session `TimeZone` setting, which `timestamptz` calendar arithmetic follows.
    fn time_zone(&self) -> Result<Tz, ExecError>;

    fn owner(&self, table: &QualifiedName) -> Result<String, ExecError>;

    /// `pg_class.reloptions` entries (`name=value`).
    fn storage_options(&self, table: &QualifiedName) -> Result<Vec<String>, ExecError>;

    fn indexes(&self, table: &QualifiedName) -> Result<Vec<IndexInfo>, ExecError>;

    /// Names of every relation (tables, indexes, sequences) in `schema`.
    fn relation_names(&self, schema: &str) -> Result<HashSet<String>, ExecError>;

    /// Foreign keys declared on other tables that reference `table`.
    fn referencing_foreign_keys(&self, table: &QualifiedName) -> Result<Vec<ForeignKeyDefinition>, ExecError>;

    /// User-defined triggers on `table`.
    fn triggers(&self, table: &QualifiedName) -> Result<Vec<TriggerInfo>, ExecError>;

    /// Names of CHECK constraints on `table`.
    fn check_constraints(&self, table: &QualifiedName) -> Result<Vec<String>, ExecError>;

    /// Whether `table` is currently a child of any parent.
    fn is_attached(&self, table: &QualifiedName) -> Result<bool, ExecError>;
}

/// DDL execution.
pub trait SchemaExecutor {
    /// Run one statement on its own.
    fn execute(&self, ddl: &Ddl) -> Result<(), ExecError>;

    /// Run `statements` in one transaction under `SET LOCAL lock_timeout`.
    ///
    /// A lock wait beyond `lock_timeout` fails with
    /// `ExecError::LockNotAvailable` and rolls the batch back.
    fn execute_locked(&self, statements: &[Ddl], lock_timeout: Duration) -> Result<(), ExecError>;
}

/// Engine-owned durable state.
pub trait PartitionStateStore {
    /// Create the state schema and tables if missing.
    fn ensure_state_tables(&self) -> Result<(), ExecError>;

    fn configurations(&self) -> Result<Vec<StoredConfiguration>, ExecError>;

    fn save_configuration(&self, table: &QualifiedName, settings: &PartitionSettings) -> Result<(), ExecError>;

    fn detached_record(&self, table: &QualifiedName, partition: &str)
        -> Result<Option<DetachedPartitionRecord>, ExecError>;

    fn detached_records(&self, table: &QualifiedName) -> Result<Vec<DetachedPartitionRecord>, ExecError>;

    /// Run `detach` and store `record` in one transaction under `SET LOCAL lock_timeout`.
    fn detach_and_record(&self, detach: &Ddl, record: &DetachedPartitionRecord, lock_timeout: Duration)
        -> Result<(), ExecError>;

    /// Drop the partition and delete its record in one transaction.
    ///
    /// The partition is locked and checked again inside the transaction;
    /// returns `false` without dropping anything if it has been attached in
    /// the meantime.
    fn drop_detached(&self, record: &DetachedPartitionRecord, lock_timeout: Duration) -> Result<bool, ExecError>;
}

/// Everything the engine needs from a database.
pub trait PartitionBackend: Catalog + SchemaExecutor + PartitionStateStore {}

impl<T: Catalog + SchemaExecutor + PartitionStateStore> PartitionBackend for T {}
