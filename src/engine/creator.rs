use super::PartitionManager;
use crate::boundary::{attach_check_name, next_bounds, partition_name, range_check_name};
use crate::ddl::{CheckExpr, Ddl, StorageOption};
use crate::error::PartitionError;
use crate::ident::QualifiedName;
use crate::lock::AttachOutcome;
use crate::model::{PartitionBounds, PartitionStrategy, PartitionedTable, RangeGroup, RangeKey};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

impl PartitionManager<'_> {
    /// Grow every range group until it has at least `min_free` free partitions.
    ///
    /// Returns `false` when a group could not reach the target because an
    /// attach exhausted its lock retries or the run was cancelled; other
    /// groups are still grown.
    pub fn ensure_free_partitions(&self, table: &QualifiedName, min_free: usize) -> Result<bool, PartitionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::operation_span("ensure_free_partitions", &table.to_string()).entered();

        let resolved = self.resolve_table(table, None)?;
        let groups = RangeGroup::group(&self.backend.partitions(&resolved)?);
        for group in &groups {
            for (before, after) in group.gaps() {
                log::warn!("{table} group {}: {before} and {after} are not contiguous", group.key);
            }
        }
        let keys: Vec<RangeKey> = groups.into_iter().filter(|g| g.latest().is_some()).map(|g| g.key).collect();
        if keys.is_empty() {
            return Err(PartitionError::NoTemplatePartition(table.clone()));
        }

        let mut reached = true;
        for key in keys {
            if !self.grow_group(&resolved, key, min_free)? {
                reached = false;
            }
        }
        Ok(reached)
    }

    fn grow_group(&self, table: &PartitionedTable, key: RangeKey, min_free: usize) -> Result<bool, PartitionError> {
        loop {
            let groups = RangeGroup::group(&self.backend.partitions(table)?);
            let group = groups
                .iter()
                .find(|g| g.key == key)
                .ok_or_else(|| PartitionError::NoTemplatePartition(table.table.clone()))?;
            let free = self.free_in_group(table, &groups, group)?;
            if free >= min_free {
                log::debug!("{} group {key}: {free} free partition(s)", table.table);
                return Ok(true);
            }
            if self.cancel.is_cancelled() {
                log::warn!("{} group {key}: cancelled with {free}/{min_free} free partition(s)", table.table);
                return Ok(false);
            }

            let latest = group
                .latest()
                .ok_or_else(|| PartitionError::NoTemplatePartition(table.table.clone()))?;
            let current = latest
                .bounds
                .ok_or_else(|| PartitionError::CatchAllPartition(table.table.clone()))?;
            let bounds = next_bounds(&current, table.zone)?;
            let name = partition_name(&table.table.name, key, &bounds, table.zone);
            let source = table.child(&latest.name)?;

            let outcome = self.create_and_attach(table, &source, &name, bounds, &latest.storage_options)?;
            if !outcome.is_applied() {
                return Ok(false);
            }
        }
    }

    /// Create `name` shaped like `source`, constrain it to `bounds` and attach it.
    ///
    /// The new table is dropped again if the attach cannot get its lock or
    /// any preparation step fails, so a failed growth leaves no stray table.
    /// An empty unattached table already holding the name is left over from
    /// an interrupted run and is replaced.
    pub(crate) fn create_and_attach(
        &self,
        table: &PartitionedTable,
        source: &QualifiedName,
        name: &str,
        bounds: PartitionBounds,
        storage_options: &[String],
    ) -> Result<AttachOutcome, PartitionError> {
        let child = table.child(name)?;
        if self.backend.table_exists(&child)? {
            if self.backend.is_attached(&child)? || self.backend.has_rows(&child)? {
                return Err(PartitionError::NameConflict(child));
            }
            log::warn!("{}: replacing leftover unattached table {child}", table.table);
            self.execute(&Ddl::DropTable { table: child.clone() })?;
        }
        self.execute(&Ddl::CreateTableLike {
            table: child.clone(),
            source: source.clone(),
            include_indexes: true,
        })?;

        let outcome = match self.prepare_and_attach(table, source, &child, bounds, storage_options) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.discard(&child);
                return Err(e);
            }
        };
        if !outcome.is_applied() {
            log::warn!("{}: could not attach {child}; dropped it again", table.table);
            self.discard(&child);
            return Ok(outcome);
        }

        let owner = self.backend.owner(&table.table)?;
        self.execute(&Ddl::SetOwner { table: child.clone(), owner })?;
        if table.strategy == PartitionStrategy::Native {
            self.execute(&Ddl::DropConstraint {
                table: child.clone(),
                name: attach_check_name(name),
            })?;
        }

        #[cfg(feature = "metrics")]
        METRICS.partitions_created.add(1, &[]);
        log::info!("{}: created partition {child} for [{}, {})", table.table, bounds.lower, bounds.upper);
        Ok(outcome)
    }

    fn prepare_and_attach(
        &self,
        table: &PartitionedTable,
        source: &QualifiedName,
        child: &QualifiedName,
        bounds: PartitionBounds,
        storage_options: &[String],
    ) -> Result<AttachOutcome, PartitionError> {
        // constraints copied from the source describe the source's range
        let copied_prefix = format!("{}_", source.name);
        for constraint in self.backend.check_constraints(child)? {
            if constraint.starts_with(&copied_prefix) {
                self.execute(&Ddl::DropConstraint {
                    table: child.clone(),
                    name: constraint,
                })?;
            }
        }

        let check = CheckExpr::Range {
            column: table.column.clone(),
            bounds,
        };
        let check_name = match table.strategy {
            PartitionStrategy::Native => attach_check_name(&child.name),
            PartitionStrategy::Inheritance => range_check_name(&child.name),
        };
        self.execute(&Ddl::AddCheck {
            table: child.clone(),
            name: check_name,
            check,
            not_valid: false,
        })?;

        let options = storage_options
            .iter()
            .map(|o| StorageOption::parse(o))
            .collect::<Result<Vec<_>, _>>()?;
        if !options.is_empty() {
            self.execute(&Ddl::SetStorageOptions {
                table: child.clone(),
                options,
            })?;
        }

        let attach = match table.strategy {
            PartitionStrategy::Native => Ddl::AttachPartition {
                parent: table.table.clone(),
                child: child.clone(),
                bounds,
            },
            PartitionStrategy::Inheritance => Ddl::Inherit {
                child: child.clone(),
                parent: table.table.clone(),
            },
        };
        self.locked("attach", &[attach])
    }

    fn discard(&self, child: &QualifiedName) {
        if let Err(e) = self.execute(&Ddl::DropTable { table: child.clone() }) {
            log::error!("could not drop unattached table {child}: {e}");
        }
    }
}
