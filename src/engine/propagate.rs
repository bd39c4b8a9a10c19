use super::PartitionManager;
use crate::boundary::template_name;
use crate::ddl::{Ddl, ForeignKeyDefinition, IndexColumn, IndexDefinition, ReferentialAction};
use crate::error::PartitionError;
use crate::ident::{truncate_with_suffix, validate_identifier, QualifiedName};
use crate::model::{Partition, PartitionedTable};
use std::collections::HashSet;

/// Name candidates tried before giving up on a collision-free index name.
const INDEX_NAME_CANDIDATES: usize = 9;

impl PartitionManager<'_> {
    /// Statements creating an index on every partition, the parent and the template.
    ///
    /// Children are indexed `CONCURRENTLY`; the parent statement is left out
    /// for a unique index that does not include the partitioning column.
    /// Nothing is executed.
    pub fn partitioned_index_statements(
        &self,
        table: &QualifiedName,
        columns: &[&str],
        method: &str,
        unique: bool,
    ) -> Result<Vec<Ddl>, PartitionError> {
        if columns.is_empty() {
            return Err(PartitionError::InvalidExpression("an index needs at least one column".to_string()));
        }
        if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(PartitionError::InvalidExpression(format!("unknown index method {method:?}")));
        }
        let columns = columns
            .iter()
            .map(|c| IndexColumn::parse(c))
            .collect::<Result<Vec<_>, _>>()?;
        let resolved = self.resolve_table(table, None)?;
        let fragment = columns.iter().map(IndexColumn::name_fragment).collect::<Vec<_>>().join("_");
        let mut taken = self.backend.relation_names(&table.schema)?;

        let index = |target: QualifiedName, name: String, concurrently: bool| {
            Ddl::CreateIndex(IndexDefinition {
                name,
                table: target,
                method: method.to_ascii_lowercase(),
                columns: columns.clone(),
                unique,
                concurrently,
                if_not_exists: true,
            })
        };

        let mut statements = Vec::new();
        for child in self.ordered_children(&resolved)? {
            let name = unique_index_name(&child.name, &fragment, &mut taken);
            statements.push(index(resolved.child(&child.name)?, name, true));
        }

        if unique && !columns.iter().any(|c| c.refers_to_column(&resolved.column)) {
            log::warn!(
                "{table}: unique index on ({fragment}) does not include {}; only partitions get it",
                resolved.column
            );
        } else {
            let name = unique_index_name(&table.name, &fragment, &mut taken);
            statements.push(index(table.clone(), name, false));
        }

        if let Some(template) = self.template_of(table)? {
            let name = unique_index_name(&template.name, &fragment, &mut taken);
            statements.push(index(template, name, false));
        }
        Ok(statements)
    }

    /// Statements adding a foreign key to every partition, the parent and the template.
    ///
    /// Children get a NOT VALID constraint first and a separate VALIDATE
    /// each, so the scans can be scheduled apart from the metadata change.
    pub fn partitioned_foreign_key_statements(
        &self,
        table: &QualifiedName,
        constraint: &str,
        references: &QualifiedName,
        columns: &[&str],
        referenced_columns: &[&str],
    ) -> Result<Vec<Ddl>, PartitionError> {
        validate_identifier(constraint)?;
        if columns.is_empty() || columns.len() != referenced_columns.len() {
            return Err(PartitionError::InvalidExpression(format!(
                "foreign key {constraint}: {} column(s) cannot reference {} column(s)",
                columns.len(),
                referenced_columns.len()
            )));
        }
        for column in columns.iter().chain(referenced_columns) {
            validate_identifier(column)?;
        }
        let resolved = self.resolve_table(table, None)?;

        let definition = |target: QualifiedName| ForeignKeyDefinition {
            name: constraint.to_string(),
            table: target,
            columns: columns.iter().map(ToString::to_string).collect(),
            references: references.clone(),
            referenced_columns: referenced_columns.iter().map(ToString::to_string).collect(),
            on_delete: ReferentialAction::NoAction,
            on_update: ReferentialAction::NoAction,
        };

        let children = self
            .ordered_children(&resolved)?
            .iter()
            .map(|p| resolved.child(&p.name))
            .collect::<Result<Vec<_>, _>>()?;
        let mut statements: Vec<Ddl> = children
            .iter()
            .map(|child| Ddl::AddForeignKey {
                definition: definition(child.clone()),
                not_valid: true,
            })
            .collect();
        statements.extend(children.iter().map(|child| Ddl::ValidateConstraint {
            table: child.clone(),
            name: constraint.to_string(),
        }));
        statements.push(Ddl::AddForeignKey {
            definition: definition(table.clone()),
            not_valid: false,
        });
        if let Some(template) = self.template_of(table)? {
            statements.push(Ddl::AddForeignKey {
                definition: definition(template),
                not_valid: false,
            });
        }
        Ok(statements)
    }

    /// Children grouped and ordered by range, catch-all partitions last.
    fn ordered_children(&self, table: &PartitionedTable) -> Result<Vec<Partition>, PartitionError> {
        let mut children = self.backend.partitions(table)?;
        children.sort_by(|a, b| {
            (a.is_default, a.range_key, a.lower(), &a.name).cmp(&(b.is_default, b.range_key, b.lower(), &b.name))
        });
        Ok(children)
    }

    fn template_of(&self, table: &QualifiedName) -> Result<Option<QualifiedName>, PartitionError> {
        let template = table.sibling(template_name(&table.name))?;
        Ok(self.backend.table_exists(&template)?.then_some(template))
    }
}

/// `<table>_<columns>_idx`, then `_idx_1` .. `_idx_8`.
///
/// When every candidate is taken the last one is returned anyway and the
/// statement will fail when executed.
fn unique_index_name(table: &str, fragment: &str, taken: &mut HashSet<String>) -> String {
    let prefix = format!("{table}_{fragment}");
    let candidates = (0..INDEX_NAME_CANDIDATES).map(|i| match i {
        0 => truncate_with_suffix(&prefix, "idx"),
        n => truncate_with_suffix(&prefix, &format!("idx_{n}")),
    });
    let mut last = String::new();
    for candidate in candidates {
        if !taken.contains(&candidate) {
            taken.insert(candidate.clone());
            return candidate;
        }
        last = candidate;
    }
    log::warn!("no free index name for {prefix} after {INDEX_NAME_CANDIDATES} tries; using {last}");
    last
}
