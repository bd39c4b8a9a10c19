//! Engine error taxonomy.
//!
//! Structural precondition failures (wrong column type, table not
//! partitioned, referenced table conflict, ...) are errors and abort the
//! operation. Lock contention is not represented here: it is retried and,
//! once the retry budget is spent, reported as a `false` result.

use crate::executor::ExecError;
use crate::ident::QualifiedName;
use thiserror::Error;

/// Errors raised by partition lifecycle operations
#[derive(Debug, Error)]
pub enum PartitionError {
    /// The table has no range partitioning key registered
    #[error("{0} is not range partitioned")]
    NotPartitioned(QualifiedName),

    /// The partitioning (or pruning) column has a type the engine cannot do arithmetic on
    #[error("column {column} of {table} has unsupported type {type_name}; expected an integer, date or timestamp type")]
    UnsupportedColumnType {
        table: QualifiedName,
        column: String,
        type_name: String,
    },

    /// Inheritance partitioning cannot be applied to a table that other tables reference
    #[error("{table} is referenced by foreign keys ({}); inheritance partitioning cannot keep them valid", referencing.join(", "))]
    ReferencedTableConflict {
        table: QualifiedName,
        referencing: Vec<String>,
    },

    /// Detach without override targeted something other than the oldest partition
    #[error("{partition} is not the oldest partition of {table} (oldest is {oldest})")]
    NotOldestPartition {
        table: QualifiedName,
        partition: String,
        oldest: String,
    },

    /// Drop requested for a partition that was never detached by the engine
    #[error("{partition} has no detach record for {table}")]
    UnregisteredPartition {
        table: QualifiedName,
        partition: String,
    },

    /// Drop requested for a partition that is attached to a parent again
    #[error("{0} is still attached to a parent table")]
    PartitionStillAttached(QualifiedName),

    #[error("table {0} does not exist")]
    TableNotFound(QualifiedName),

    #[error("column {column} does not exist on {table}")]
    ColumnNotFound { table: QualifiedName, column: String },

    #[error("partition {partition} does not belong to {table}")]
    PartitionNotFound {
        table: QualifiedName,
        partition: String,
    },

    /// The DEFAULT (or inheritance overflow) partition has no range to act on
    #[error("{0} is the catch-all partition and has no range")]
    CatchAllPartition(QualifiedName),

    #[error("{0} is already partitioned")]
    AlreadyPartitioned(QualifiedName),

    /// A relation the operation needs to create already exists
    #[error("relation {0} already exists")]
    NameConflict(QualifiedName),

    /// Growth needs an existing generated partition to copy and measure
    #[error("{0} has no generated partition to use as a template")]
    NoTemplatePartition(QualifiedName),

    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    #[error("invalid partition bound: {0}")]
    InvalidBound(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("invalid index expression: {0}")]
    InvalidExpression(String),

    /// Pruning constraints need an integer key and a date/timestamp target column
    #[error("cannot add pruning constraints on {table}: {reason}")]
    PruningColumnMismatch { table: QualifiedName, reason: String },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Database(#[from] ExecError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_table() {
        let table = QualifiedName::new("public", "orders").unwrap();
        let err = PartitionError::NotPartitioned(table.clone());
        assert_eq!(err.to_string(), "public.orders is not range partitioned");

        let err = PartitionError::ReferencedTableConflict {
            table,
            referencing: vec!["public.order_lines".to_string()],
        };
        assert!(err.to_string().contains("public.order_lines"));
    }

    #[test]
    fn test_database_errors_convert() {
        let err: PartitionError = ExecError::Other("boom".to_string()).into();
        assert!(matches!(err, PartitionError::Database(_)));
    }
}
