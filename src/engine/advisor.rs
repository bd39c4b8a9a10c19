use super::PartitionManager;
use crate::boundary::{pruning_max_name, pruning_min_name};
use crate::ddl::{CheckExpr, Ddl};
use crate::error::PartitionError;
use crate::ident::QualifiedName;
use crate::model::{BoundValue, ColumnFamily};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

impl PartitionManager<'_> {
    /// Add `column >= min` and `column <= max` CHECKs to each integer-keyed
    /// partition so the planner can prune on a date or timestamp column.
    ///
    /// The minimum is added once a partition holds rows; the maximum only when
    /// the partition holds its last key (`upper - 1`) and can no longer grow.
    /// Existing constraints are never widened. Returns the number added.
    pub fn add_pruning_constraints(&self, table: &QualifiedName, marker: &str, column: &str)
        -> Result<usize, PartitionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::operation_span("add_pruning_constraints", &table.to_string()).entered();

        if marker.is_empty() || !marker.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(PartitionError::InvalidIdentifier(format!("constraint marker {marker:?}")));
        }
        let resolved = self.resolve_table(table, None)?;
        if resolved.family != ColumnFamily::Integer {
            return Err(PartitionError::PruningColumnMismatch {
                table: table.clone(),
                reason: format!("partition key {} is not an integer column", resolved.column),
            });
        }
        let family = match self.resolve_family(table, column) {
            Ok(family) if family.is_temporal() => family,
            Ok(_) | Err(PartitionError::UnsupportedColumnType { .. }) => {
                return Err(PartitionError::PruningColumnMismatch {
                    table: table.clone(),
                    reason: format!("{column} is not a date or timestamp column"),
                })
            }
            Err(e) => return Err(e),
        };

        let mut added = 0;
        for partition in self.backend.partitions(&resolved)?.iter().filter(|p| p.is_generated()) {
            let Some(bounds) = partition.bounds else { continue };
            let child = resolved.child(&partition.name)?;
            let existing = self.backend.check_constraints(&child)?;

            let min_name = pruning_min_name(&child.name, marker);
            if !existing.contains(&min_name) && self.backend.has_rows(&child)? {
                if let Some(min) = self.backend.min_value(&child, column, family)? {
                    let check = CheckExpr::AtLeast {
                        column: column.to_string(),
                        value: min,
                    };
                    added += usize::from(self.add_trusted_check(&child, min_name, check)?);
                }
            }

            let max_name = pruning_max_name(&child.name, marker);
            let last_key = bounds.upper.as_integer().map(|upper| BoundValue::Integer(upper - 1));
            if let (false, Some(last_key)) = (existing.contains(&max_name), last_key) {
                if self.backend.row_exists(&child, &resolved.column, &last_key)? {
                    if let Some(max) = self.backend.max_value(&child, column, family)? {
                        let check = CheckExpr::AtMost {
                            column: column.to_string(),
                            value: max,
                        };
                        added += usize::from(self.add_trusted_check(&child, max_name, check)?);
                    }
                }
            }
        }
        log::info!("{table}: added {added} pruning constraint(s) on {column}");
        Ok(added)
    }

    /// NOT VALID, then flagged valid: the value was just read from the same rows.
    fn add_trusted_check(&self, child: &QualifiedName, name: String, check: CheckExpr) -> Result<bool, PartitionError> {
        let statements = [
            Ddl::AddCheck {
                table: child.clone(),
                name: name.clone(),
                check,
                not_valid: true,
            },
            Ddl::MarkConstraintValid {
                table: child.clone(),
                name: name.clone(),
            },
        ];
        let applied = self.locked("constrain", &statements)?.is_applied();
        if applied {
            log::debug!("{child}: added {name}");
        } else {
            log::warn!("{child}: skipped {name}, table is busy");
        }
        Ok(applied)
    }
}
