use super::PartitionManager;
use crate::error::PartitionError;
use crate::ident::QualifiedName;
use crate::model::{ColumnFamily, PartitionedTable};
use chrono_tz::Tz;

impl PartitionManager<'_> {
    /// Resolve the partitioning column, its family and the strategy of `table`.
    ///
    /// `column` overrides the registered key column.
    ///
    /// # Errors
    ///
    /// `TableNotFound`, `NotPartitioned`, `ColumnNotFound` or
    /// `UnsupportedColumnType`.
    pub fn resolve_table(&self, table: &QualifiedName, column: Option<&str>) -> Result<PartitionedTable, PartitionError> {
        if !self.backend.table_exists(table)? {
            return Err(PartitionError::TableNotFound(table.clone()));
        }
        let key = self
            .backend
            .partition_key(table)?
            .ok_or_else(|| PartitionError::NotPartitioned(table.clone()))?;
        let column = column.map_or(key.column, str::to_string);
        let family = self.resolve_family(table, &column)?;
        Ok(PartitionedTable {
            table: table.clone(),
            column,
            family,
            strategy: key.strategy,
            zone: self.zone_for(family)?,
        })
    }

    /// The session zone for `timestamptz` keys; other families never consult it.
    pub(crate) fn zone_for(&self, family: ColumnFamily) -> Result<Tz, PartitionError> {
        match family {
            ColumnFamily::TimestampTz => Ok(self.backend.time_zone()?),
            _ => Ok(Tz::UTC),
        }
    }

    pub(crate) fn resolve_family(&self, table: &QualifiedName, column: &str) -> Result<ColumnFamily, PartitionError> {
        let type_name = self
            .backend
            .column_type(table, column)?
            .ok_or_else(|| PartitionError::ColumnNotFound {
                table: table.clone(),
                column: column.to_string(),
            })?;
        ColumnFamily::from_type_name(&type_name).ok_or_else(|| PartitionError::UnsupportedColumnType {
            table: table.clone(),
            column: column.to_string(),
            type_name,
        })
    }
}
