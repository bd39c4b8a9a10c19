use super::PartitionManager;
use crate::error::PartitionError;
use crate::ident::QualifiedName;
use crate::model::{BoundValue, ColumnFamily, PartitionedTable, RangeGroup, RangeKey};

impl PartitionManager<'_> {
    /// Partitions lying entirely ahead of the stored data.
    ///
    /// Integer keys count partitions whose lower bound exceeds the current
    /// maximum (zero for an empty table); temporal keys count partitions
    /// starting at or after tomorrow's midnight. With several range groups and no `range_key`,
    /// the smallest group count is returned.
    pub fn count_free_partitions(
        &self,
        table: &QualifiedName,
        column: Option<&str>,
        family: Option<ColumnFamily>,
        range_key: Option<RangeKey>,
    ) -> Result<usize, PartitionError> {
        let mut resolved = self.resolve_table(table, column)?;
        if let Some(family) = family {
            resolved.family = family;
            resolved.zone = self.zone_for(family)?;
        }
        let groups = RangeGroup::group(&self.backend.partitions(&resolved)?);

        match range_key {
            Some(key) => match groups.iter().find(|g| g.key == key) {
                Some(group) => self.free_in_group(&resolved, &groups, group),
                None => Ok(0),
            },
            None => {
                let mut min: Option<usize> = None;
                for group in &groups {
                    let free = self.free_in_group(&resolved, &groups, group)?;
                    min = Some(min.map_or(free, |m| m.min(free)));
                }
                Ok(min.unwrap_or(0))
            }
        }
    }

    pub(crate) fn free_in_group(
        &self,
        table: &PartitionedTable,
        groups: &[RangeGroup],
        group: &RangeGroup,
    ) -> Result<usize, PartitionError> {
        let free = match table.family {
            ColumnFamily::Integer => {
                let max = self.group_max(table, groups, group)?;
                group.generated().filter(|p| p.lower().is_some_and(|lower| lower > max)).count()
            }
            family => {
                // a partition starting later today still takes today's rows
                let today = self.backend.current_date()?;
                let tomorrow = today
                    .succ_opt()
                    .and_then(|d| BoundValue::start_of_day(family, d, table.zone))
                    .ok_or_else(|| PartitionError::InvalidBound(format!("cannot represent {today} + 1 day as {family:?}")))?;
                group.generated().filter(|p| p.lower().is_some_and(|lower| lower >= tomorrow)).count()
            }
        };
        Ok(free)
    }

    /// Highest stored key: the whole table for one group, the group's own
    /// children otherwise.
    fn group_max(&self, table: &PartitionedTable, groups: &[RangeGroup], group: &RangeGroup)
        -> Result<BoundValue, PartitionError> {
        let max = if groups.len() <= 1 {
            self.backend.max_value(&table.table, &table.column, table.family)?
        } else {
            let mut max = None;
            for partition in &group.partitions {
                let child = table.child(&partition.name)?;
                max = max.max(self.backend.max_value(&child, &table.column, table.family)?);
            }
            max
        };
        Ok(max.unwrap_or(BoundValue::Integer(0)))
    }
}
