use super::PartitionManager;
use crate::ddl::Ddl;
use crate::error::PartitionError;
use crate::ident::QualifiedName;
use crate::lock::with_lock_retry;
use crate::model::{PartitionStrategy, RangeGroup};
use crate::state::DetachedPartitionRecord;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

impl PartitionManager<'_> {
    /// Detach `partition` from `table` and record it for a later drop.
    ///
    /// With `oldest_only` the partition must be the oldest generated one of
    /// its range group. Returns `false` if the lock could not be taken, in
    /// which case nothing changed.
    pub fn detach_partition(&self, table: &QualifiedName, partition: &str, oldest_only: bool)
        -> Result<bool, PartitionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::operation_span("detach_partition", &table.to_string()).entered();

        let resolved = self.resolve_table(table, None)?;
        let partitions = self.backend.partitions(&resolved)?;
        let target = partitions
            .iter()
            .find(|p| p.name == partition)
            .ok_or_else(|| PartitionError::PartitionNotFound {
                table: table.clone(),
                partition: partition.to_string(),
            })?;
        let child = resolved.child(partition)?;
        let Some(bounds) = target.bounds else {
            return Err(PartitionError::CatchAllPartition(child));
        };

        if oldest_only {
            let groups = RangeGroup::group(&partitions);
            let oldest = groups
                .iter()
                .find(|g| g.key == target.range_key)
                .and_then(RangeGroup::oldest)
                .map(|p| p.name.clone());
            if oldest.as_deref() != Some(partition) {
                return Err(PartitionError::NotOldestPartition {
                    table: table.clone(),
                    partition: partition.to_string(),
                    oldest: oldest.unwrap_or_else(|| "none".to_string()),
                });
            }
        }

        let detach = match resolved.strategy {
            PartitionStrategy::Native => Ddl::DetachPartition {
                parent: table.clone(),
                child: child.clone(),
            },
            PartitionStrategy::Inheritance => Ddl::NoInherit {
                child: child.clone(),
                parent: table.clone(),
            },
        };
        let record = DetachedPartitionRecord {
            schema: table.schema.clone(),
            parent: table.name.clone(),
            partition: partition.to_string(),
            lower_bound: bounds.lower.to_string(),
            upper_bound: bounds.upper.to_string(),
            detached_on: self.backend.current_date()?,
        };
        let outcome = with_lock_retry(&self.retry, &self.cancel, "detach", || {
            self.backend.detach_and_record(&detach, &record, self.retry.lock_timeout)
        })?;
        if !outcome.is_applied() {
            return Ok(false);
        }
        #[cfg(feature = "metrics")]
        METRICS.partitions_detached.add(1, &[]);
        log::info!("{table}: detached {child} [{}, {})", bounds.lower, bounds.upper);
        Ok(true)
    }

    /// Drop a partition previously detached by [`detach_partition`](Self::detach_partition).
    ///
    /// The table and its detach record are removed together. Returns `false`
    /// if the lock could not be taken.
    pub fn drop_detached_partition(&self, table: &QualifiedName, partition: &str) -> Result<bool, PartitionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::operation_span("drop_detached_partition", &table.to_string()).entered();

        let record = self
            .backend
            .detached_record(table, partition)?
            .ok_or_else(|| PartitionError::UnregisteredPartition {
                table: table.clone(),
                partition: partition.to_string(),
            })?;
        let child = record.partition_name()?;

        let mut attached = false;
        let outcome = with_lock_retry(&self.retry, &self.cancel, "drop", || {
            attached = !self.backend.drop_detached(&record, self.retry.lock_timeout)?;
            Ok(())
        })?;
        if attached {
            return Err(PartitionError::PartitionStillAttached(child));
        }
        if !outcome.is_applied() {
            return Ok(false);
        }
        #[cfg(feature = "metrics")]
        METRICS.partitions_dropped.add(1, &[]);
        log::info!("{table}: dropped {child} (detached on {})", record.detached_on);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::testing::manager;
    use crate::error::PartitionError;
    use crate::model::PartitionBounds;
    use crate::test_helpers::{day, int_bounds, qn, timestamp, FakeBackend};
    use pretty_assertions::assert_eq;

    fn weekly() -> FakeBackend {
        let db = FakeBackend::new(day("2024-03-01"));
        db.create_partitioned("public.logs", &[("at", "timestamp without time zone")], "at");
        for (lower, upper) in [("2024-01-01", "2024-01-08"), ("2024-01-08", "2024-01-15"), ("2024-01-15", "2024-01-22")] {
            let bounds = PartitionBounds::new(timestamp(&format!("{lower} 00:00:00")), timestamp(&format!("{upper} 00:00:00"))).unwrap();
            db.add_partition("public.logs", &format!("logs_{}", bounds.name_suffix(chrono_tz::Tz::UTC)), Some(bounds));
        }
        db.add_partition("public.logs", "logs_default", None);
        db
    }

    #[test]
    fn test_detach_oldest_records_bounds() {
        let db = weekly();
        assert!(manager(&db).detach_partition(&qn("logs"), "logs_20240101_20240108", true).unwrap());

        let record = &db.detached()[0];
        assert_eq!(record.partition, "logs_20240101_20240108");
        assert_eq!(record.lower_bound, "2024-01-01 00:00:00");
        assert_eq!(record.detached_on, day("2024-03-01"));
        assert!(db.table("public.logs_20240101_20240108").unwrap().attached_to.is_none());
    }

    #[test]
    fn test_detach_refuses_non_oldest_without_override() {
        let db = weekly();
        let m = manager(&db);
        let err = m.detach_partition(&qn("logs"), "logs_20240108_20240115", true).unwrap_err();
        assert!(matches!(err, PartitionError::NotOldestPartition { ref oldest, .. } if oldest == "logs_20240101_20240108"));
        assert!(db.detached().is_empty());

        assert!(m.detach_partition(&qn("logs"), "logs_20240108_20240115", false).unwrap());

        let err = m.detach_partition(&qn("logs"), "logs_default", false).unwrap_err();
        assert!(matches!(err, PartitionError::CatchAllPartition(_)));
        let err = m.detach_partition(&qn("logs"), "logs_19990101_19990108", false).unwrap_err();
        assert!(matches!(err, PartitionError::PartitionNotFound { .. }));
    }

    #[test]
    fn test_detach_lock_exhaustion_has_no_side_effects() {
        let db = weekly();
        db.fail_locked_batches(3);
        assert!(!manager(&db).detach_partition(&qn("logs"), "logs_20240101_20240108", true).unwrap());
        assert!(db.detached().is_empty());
        assert!(db.table("public.logs_20240101_20240108").unwrap().attached_to.is_some());
    }

    #[test]
    fn test_failed_record_write_keeps_partition_attached() {
        let db = weekly();
        db.fail_record_writes(1);
        let err = manager(&db).detach_partition(&qn("logs"), "logs_20240101_20240108", true).unwrap_err();
        assert!(matches!(err, PartitionError::Database(_)), "{err:?}");
        assert!(db.detached().is_empty());
        assert_eq!(db.table("public.logs_20240101_20240108").unwrap().attached_to, Some(qn("logs")));

        // nothing was left half done, so the next attempt goes through
        assert!(manager(&db).detach_partition(&qn("logs"), "logs_20240101_20240108", true).unwrap());
        assert_eq!(db.detached().len(), 1);
    }

    #[test]
    fn test_drop_requires_record_and_detachment() {
        let db = weekly();
        let m = manager(&db);
        let err = m.drop_detached_partition(&qn("logs"), "logs_20240101_20240108").unwrap_err();
        assert!(matches!(err, PartitionError::UnregisteredPartition { .. }));

        assert!(m.detach_partition(&qn("logs"), "logs_20240101_20240108", true).unwrap());
        // re-attached out of band
        db.with_table("public.logs_20240101_20240108", |t| t.attached_to = Some(qn("logs")));
        let err = m.drop_detached_partition(&qn("logs"), "logs_20240101_20240108").unwrap_err();
        assert!(matches!(err, PartitionError::PartitionStillAttached(_)));
        assert!(db.exists("public.logs_20240101_20240108"));
        assert_eq!(db.detached().len(), 1);

        db.with_table("public.logs_20240101_20240108", |t| t.attached_to = None);
        assert!(m.drop_detached_partition(&qn("logs"), "logs_20240101_20240108").unwrap());
        assert!(!db.exists("public.logs_20240101_20240108"));
        assert!(db.detached().is_empty());
    }

    #[test]
    fn test_inheritance_detach_uses_no_inherit() {
        let db = FakeBackend::new(day("2024-01-01"));
        db.create_table("public.legacy", &[("id", "integer")]);
        db.add_inheritance_child("public.legacy", "legacy_1_101", "id", Some(int_bounds(1, 101)));
        db.add_inheritance_child("public.legacy", "legacy_101_201", "id", Some(int_bounds(101, 201)));

        assert!(manager(&db).detach_partition(&qn("legacy"), "legacy_1_101", true).unwrap());
        assert!(db.executed().iter().any(|sql| sql.contains("NO INHERIT")));
        assert_eq!(db.children("public.legacy"), vec!["legacy_101_201"]);
    }
}
