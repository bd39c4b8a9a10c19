use super::PartitionManager;
use crate::backend::{IndexInfo, TriggerInfo};
use crate::boundary::{
    attach_check_name, bounds_from, original_data_name, overflow_name, partition_name, range_check_name, template_name,
    PartitionInterval,
};
use crate::ddl::{CheckExpr, Ddl, ForeignKeyDefinition, IndexColumn, IndexDefinition};
use crate::error::PartitionError;
use crate::ident::{truncate_with_suffix, QualifiedName};
use crate::model::{BoundValue, ColumnFamily, PartitionBounds, PartitionStrategy, PartitionedTable, RangeKey};
use chrono_tz::Tz;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Parameters of a one-time conversion.
///
/// `start` and `end` bound the existing data, which becomes the first
/// partition as is; a second partition `[end, end + interval)` is created for
/// new rows. Bound values and the interval are given as text in the key
/// column's representation (`1000000`, `2024-01-01`, `1 month`).
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionRequest {
    pub table: QualifiedName,
    pub key_column: String,
    pub start: String,
    pub end: String,
    pub interval: String,
    pub strategy: PartitionStrategy,
    /// Use a template table even when a primary key covers the key column
    pub no_primary_key: bool,
    /// Recreate the original table's triggers on the new parent
    pub move_triggers: bool,
}

/// Everything about the original table that has to be captured before it is renamed.
struct Original {
    table: QualifiedName,
    renamed: QualifiedName,
    family: ColumnFamily,
    zone: Tz,
    bounds: PartitionBounds,
    next: PartitionBounds,
    indexes: Vec<IndexInfo>,
    foreign_keys: Vec<ForeignKeyDefinition>,
    owner: String,
    storage_options: Vec<String>,
    /// Definitions name the table before the rename
    triggers: Vec<TriggerInfo>,
}

impl PartitionManager<'_> {
    /// Turn a plain table into a range-partitioned one.
    ///
    /// The original table is renamed to `<table>_original_data` and becomes
    /// the first partition without moving rows. Each step takes its locks
    /// separately; returns `false` if one of them could not get its lock, in
    /// which case the steps already done are kept and logged.
    pub fn convert_table(&self, request: &ConversionRequest) -> Result<bool, PartitionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::operation_span("convert_table", &request.table.to_string()).entered();

        let original = self.inspect_original(request)?;
        match request.strategy {
            PartitionStrategy::Native => self.convert_native(request, &original),
            PartitionStrategy::Inheritance => {
                if !original.foreign_keys.is_empty() {
                    return Err(PartitionError::ReferencedTableConflict {
                        table: original.table.clone(),
                        referencing: original
                            .foreign_keys
                            .iter()
                            .map(|fk| format!("{} ({})", fk.table, fk.name))
                            .collect(),
                    });
                }
                self.convert_inheritance(request, &original)
            }
        }
    }

    fn inspect_original(&self, request: &ConversionRequest) -> Result<Original, PartitionError> {
        let table = &request.table;
        if !self.backend.table_exists(table)? {
            return Err(PartitionError::TableNotFound(table.clone()));
        }
        if self.backend.partition_key(table)?.is_some() || self.backend.is_attached(table)? {
            return Err(PartitionError::AlreadyPartitioned(table.clone()));
        }
        let family = self.resolve_family(table, &request.key_column)?;
        let zone = self.zone_for(family)?;

        let start = BoundValue::parse(family, &request.start)?;
        let end = BoundValue::parse(family, &request.end)?;
        let bounds = PartitionBounds::new(start, end)?;
        let interval = PartitionInterval::parse(family, &request.interval)?;
        let next = bounds_from(end, &interval, zone)?;

        let renamed = table.sibling(original_data_name(&table.name))?;
        for name in [
            renamed.clone(),
            table.sibling(template_name(&table.name))?,
            table.sibling(partition_name(&table.name, RangeKey::Default, &next, zone))?,
        ] {
            if self.backend.table_exists(&name)? {
                return Err(PartitionError::NameConflict(name));
            }
        }

        Ok(Original {
            table: table.clone(),
            renamed,
            family,
            zone,
            bounds,
            next,
            indexes: self.backend.indexes(table)?,
            foreign_keys: self.backend.referencing_foreign_keys(table)?,
            owner: self.backend.owner(table)?,
            storage_options: self.backend.storage_options(table)?,
            triggers: if request.move_triggers {
                self.backend.triggers(table)?
            } else {
                Vec::new()
            },
        })
    }

    fn convert_native(&self, request: &ConversionRequest, original: &Original) -> Result<bool, PartitionError> {
        let table = &original.table;
        let key = &request.key_column;
        let unique_without_key = original.indexes.iter().any(|i| i.unique && !i.columns.contains(key));
        let primary_with_key = original.indexes.iter().any(|i| i.primary && i.columns.contains(key));
        let use_template = request.no_primary_key || unique_without_key || !primary_with_key;

        // rename and release referencing foreign keys in one lock window
        let mut statements = self.rename_statements(original);
        statements.extend(original.foreign_keys.iter().map(|fk| Ddl::DropConstraint {
            table: fk.table.clone(),
            name: fk.name.clone(),
        }));
        if !self.locked("convert.rename", &statements)?.is_applied() {
            log::warn!("{table}: conversion abandoned, could not rename the original table");
            return Ok(false);
        }
        log::info!("{table}: renamed to {}", original.renamed);

        self.execute(&Ddl::CreatePartitionedTable {
            table: table.clone(),
            source: original.renamed.clone(),
            column: key.clone(),
            include_indexes: !use_template,
        })?;
        if use_template {
            // referencing foreign keys need a unique index on the parent itself
            for index in original.indexes.iter().filter(|i| i.unique && i.columns.contains(key)) {
                self.execute(&Ddl::CreateIndex(parent_unique_index(table, index)))?;
            }
        }
        let template = if use_template {
            let template = table.sibling(template_name(&table.name))?;
            self.execute(&Ddl::CreateTableLike {
                table: template.clone(),
                source: original.renamed.clone(),
                include_indexes: true,
            })?;
            log::info!("{table}: created template {template}");
            Some(template)
        } else {
            None
        };

        let check_name = attach_check_name(&original.renamed.name);
        self.execute(&Ddl::AddCheck {
            table: original.renamed.clone(),
            name: check_name.clone(),
            check: CheckExpr::Range {
                column: key.clone(),
                bounds: original.bounds,
            },
            not_valid: true,
        })?;
        self.execute(&Ddl::MarkConstraintValid {
            table: original.renamed.clone(),
            name: check_name.clone(),
        })?;
        let attach = Ddl::AttachPartition {
            parent: table.clone(),
            child: original.renamed.clone(),
            bounds: original.bounds,
        };
        if !self.locked("convert.attach", &[attach])?.is_applied() {
            log::error!(
                "{table}: created but {} is not attached; attach it for [{}, {}) to finish",
                original.renamed,
                original.bounds.lower,
                original.bounds.upper
            );
            return Ok(false);
        }
        self.execute(&Ddl::DropConstraint {
            table: original.renamed.clone(),
            name: check_name,
        })?;

        // new partitions take the parent's owner
        for t in std::iter::once(table).chain(template.as_ref()) {
            self.execute(&Ddl::SetOwner {
                table: t.clone(),
                owner: original.owner.clone(),
            })?;
        }

        let resolved = PartitionedTable {
            table: table.clone(),
            column: key.clone(),
            family: original.family,
            strategy: PartitionStrategy::Native,
            zone: original.zone,
        };
        let source = template.clone().unwrap_or_else(|| original.renamed.clone());
        let name = partition_name(&table.name, RangeKey::Default, &original.next, original.zone);
        if !self.create_and_attach(&resolved, &source, &name, original.next, &[])?.is_applied() {
            return Ok(false);
        }

        for fk in &original.foreign_keys {
            self.execute(&Ddl::AddForeignKey {
                definition: fk.clone(),
                not_valid: true,
            })?;
            self.execute(&Ddl::ValidateConstraint {
                table: fk.table.clone(),
                name: fk.name.clone(),
            })?;
        }

        self.move_triggers(original)?;
        self.report_storage_options(original);
        log::info!("{table}: converted to native range partitioning on {key}");
        Ok(true)
    }

    fn convert_inheritance(&self, request: &ConversionRequest, original: &Original) -> Result<bool, PartitionError> {
        let table = &original.table;
        let key = &request.key_column;

        if !self.locked("convert.rename", &self.rename_statements(original))?.is_applied() {
            log::warn!("{table}: conversion abandoned, could not rename the original table");
            return Ok(false);
        }
        log::info!("{table}: renamed to {}", original.renamed);

        self.execute(&Ddl::CreateTableLike {
            table: table.clone(),
            source: original.renamed.clone(),
            include_indexes: true,
        })?;

        let check_name = range_check_name(&original.renamed.name);
        self.execute(&Ddl::AddCheck {
            table: original.renamed.clone(),
            name: check_name.clone(),
            check: CheckExpr::Range {
                column: key.clone(),
                bounds: original.bounds,
            },
            not_valid: true,
        })?;
        self.execute(&Ddl::ValidateConstraint {
            table: original.renamed.clone(),
            name: check_name,
        })?;
        let inherit = Ddl::Inherit {
            child: original.renamed.clone(),
            parent: table.clone(),
        };
        if !self.locked("convert.inherit", &[inherit])?.is_applied() {
            log::error!("{table}: created but {} does not inherit from it yet", original.renamed);
            return Ok(false);
        }

        self.execute(&Ddl::SetOwner {
            table: table.clone(),
            owner: original.owner.clone(),
        })?;

        let resolved = PartitionedTable {
            table: table.clone(),
            column: key.clone(),
            family: original.family,
            strategy: PartitionStrategy::Inheritance,
            zone: original.zone,
        };
        let name = partition_name(&table.name, RangeKey::Default, &original.next, original.zone);
        if !self
            .create_and_attach(&resolved, &original.renamed, &name, original.next, &[])?
            .is_applied()
        {
            return Ok(false);
        }

        let overflow = table.sibling(overflow_name(&table.name))?;
        self.execute(&Ddl::CreateTableLike {
            table: overflow.clone(),
            source: table.clone(),
            include_indexes: true,
        })?;
        let inherit = Ddl::Inherit {
            child: overflow.clone(),
            parent: table.clone(),
        };
        if !self.locked("convert.overflow", &[inherit])?.is_applied() {
            self.execute(&Ddl::DropTable { table: overflow })?;
            return Ok(false);
        }

        self.execute(&Ddl::SetOwner {
            table: overflow,
            owner: original.owner.clone(),
        })?;
        self.move_triggers(original)?;
        self.report_storage_options(original);
        log::info!("{table}: converted to inheritance partitioning on {key}");
        Ok(true)
    }

    /// Rename the table and its indexes out of the way of the new parent.
    fn rename_statements(&self, original: &Original) -> Vec<Ddl> {
        let mut statements = vec![Ddl::RenameTable {
            table: original.table.clone(),
            new_name: original.renamed.name.clone(),
        }];
        for index in &original.indexes {
            let new_name = match index.name.strip_prefix(&original.table.name) {
                Some(rest) if rest.starts_with('_') => {
                    truncate_with_suffix(&original.renamed.name, rest.trim_start_matches('_'))
                }
                _ => truncate_with_suffix(&index.name, "original"),
            };
            statements.push(Ddl::RenameIndex {
                index: QualifiedName {
                    schema: original.table.schema.clone(),
                    name: index.name.clone(),
                },
                new_name,
            });
        }
        statements
    }

    fn move_triggers(&self, original: &Original) -> Result<(), PartitionError> {
        for trigger in &original.triggers {
            self.execute(&Ddl::DropTrigger {
                table: original.renamed.clone(),
                name: trigger.name.clone(),
            })?;
            self.execute(&Ddl::CreateTrigger {
                table: original.table.clone(),
                name: trigger.name.clone(),
                definition: trigger.definition.clone(),
            })?;
        }
        Ok(())
    }

    fn report_storage_options(&self, original: &Original) {
        for option in &original.storage_options {
            log::warn!(
                "{}: original table had storage option {option}; set it on the parent when a rewrite is acceptable",
                original.table
            );
        }
    }
}

/// A unique index on the new parent matching `index` of the original table.
fn parent_unique_index(table: &QualifiedName, index: &IndexInfo) -> IndexDefinition {
    let suffix = if index.primary {
        "pkey".to_string()
    } else {
        format!("{}_key", index.columns.join("_"))
    };
    IndexDefinition {
        name: truncate_with_suffix(&table.name, &suffix),
        table: table.clone(),
        method: "btree".to_string(),
        columns: index.columns.iter().map(IndexColumn::column).collect(),
        unique: true,
        concurrently: false,
        if_not_exists: false,
    }
}
