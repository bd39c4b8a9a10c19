use super::PartitionManager;
use crate::error::PartitionError;
use crate::ident::QualifiedName;
use crate::interval::CalendarInterval;
use crate::model::{BoundValue, RangeGroup};
use crate::state::PartitionSettings;
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// The stages of a maintenance run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenancePass {
    Configuration,
    Grow,
    Constrain,
    Detach,
    Drop,
}

impl fmt::Display for MaintenancePass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "configuration",
            Self::Grow => "grow",
            Self::Constrain => "constrain",
            Self::Detach => "detach",
            Self::Drop => "drop",
        };
        f.write_str(name)
    }
}

/// One table that a pass could not finish.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaintenanceFailure {
    pub table: String,
    pub pass: MaintenancePass,
    pub reason: String,
}

/// Outcome of [`PartitionManager::run_maintenance`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    /// Configured tables with auto-maintenance enabled
    pub tables: usize,
    pub grown: Vec<String>,
    pub constraints_added: usize,
    pub detached: Vec<String>,
    pub dropped: Vec<String>,
    pub failures: Vec<MaintenanceFailure>,
    pub cancelled: bool,
}

impl MaintenanceReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    fn fail(&mut self, table: impl fmt::Display, pass: MaintenancePass, reason: impl fmt::Display) {
        let failure = MaintenanceFailure {
            table: table.to_string(),
            pass,
            reason: reason.to_string(),
        };
        log::warn!("maintenance {pass} failed for {}: {}", failure.table, failure.reason);
        self.failures.push(failure);
    }
}

impl PartitionManager<'_> {
    /// Grow, constrain, detach and drop every table with auto-maintenance on.
    ///
    /// Passes run in that order over all tables, so partitions created by the
    /// grow pass are visible to the later ones. A failing table is recorded in
    /// the report and the run continues; only reading the configuration
    /// itself is fatal.
    pub fn run_maintenance(&self) -> Result<MaintenanceReport, PartitionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::operation_span("run_maintenance", "*").entered();

        let mut report = MaintenanceReport::default();
        let mut tables: Vec<(QualifiedName, PartitionSettings)> = Vec::new();
        for row in self.backend.configurations()? {
            match row.decode() {
                Ok((table, settings)) if settings.auto_maintenance => tables.push((table, settings)),
                Ok(_) => {}
                Err(e) => report.fail(format!("{}.{}", row.schema, row.table), MaintenancePass::Configuration, e),
            }
        }
        report.tables = tables.len();
        let today = self.backend.current_date()?;
        log::info!("maintenance: {} table(s) configured", tables.len());

        for pass in [MaintenancePass::Grow, MaintenancePass::Constrain, MaintenancePass::Detach, MaintenancePass::Drop] {
            for (table, settings) in &tables {
                if self.cancel.is_cancelled() {
                    log::warn!("maintenance cancelled before {pass} of {table}");
                    report.cancelled = true;
                    return Ok(report);
                }
                if let Err(e) = self.run_pass(pass, table, settings, today, &mut report) {
                    report.fail(table, pass, e);
                }
            }
        }
        log::info!(
            "maintenance: {} grown, {} constraint(s), {} detached, {} dropped, {} failure(s)",
            report.grown.len(),
            report.constraints_added,
            report.detached.len(),
            report.dropped.len(),
            report.failures.len()
        );
        Ok(report)
    }

    fn run_pass(
        &self,
        pass: MaintenancePass,
        table: &QualifiedName,
        settings: &PartitionSettings,
        today: NaiveDate,
        report: &mut MaintenanceReport,
    ) -> Result<(), PartitionError> {
        match pass {
            MaintenancePass::Configuration => {}
            MaintenancePass::Grow => {
                let target = settings.target_free_partitions() as usize;
                if self.ensure_free_partitions(table, target)? {
                    report.grown.push(table.to_string());
                } else {
                    report.fail(table, pass, format!("fewer than {target} free partitions; lock retries exhausted"));
                }
            }
            MaintenancePass::Constrain => {
                if let Some(constraint) = &settings.date_constraint {
                    report.constraints_added +=
                        self.add_pruning_constraints(table, &constraint.marker, &constraint.constraint_column)?;
                }
            }
            MaintenancePass::Detach => {
                if let Some(age) = &settings.detach {
                    for name in self.aged_partitions(table, age, today)? {
                        if !self.detach_partition(table, &name, true)? {
                            report.fail(table, pass, format!("could not lock {table} to detach {name}"));
                            break;
                        }
                        report.detached.push(format!("{}.{name}", table.schema));
                    }
                }
            }
            MaintenancePass::Drop => {
                if let Some(cutoff) = settings.drop_cutoff(today) {
                    for record in self.backend.detached_records(table)? {
                        if record.detached_on > cutoff {
                            continue;
                        }
                        if self.drop_detached_partition(table, &record.partition)? {
                            report.dropped.push(format!("{}.{}", record.schema, record.partition));
                        } else {
                            report.fail(table, pass, format!("could not lock {} to drop it", record.partition));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Generated partitions ending before `today - age`, oldest first per group.
    fn aged_partitions(&self, table: &QualifiedName, age: &CalendarInterval, today: NaiveDate)
        -> Result<Vec<String>, PartitionError> {
        let resolved = self.resolve_table(table, None)?;
        if !resolved.family.is_temporal() {
            return Err(PartitionError::Configuration(format!(
                "detach by age needs a date or timestamp key, {} is an integer column",
                resolved.column
            )));
        }
        let cutoff = age
            .before_date(today)
            .and_then(|at| BoundValue::from_datetime(resolved.family, at, resolved.zone))
            .ok_or_else(|| PartitionError::InvalidInterval(format!("{today} - {age} is out of range")))?;

        let mut aged = Vec::new();
        for group in RangeGroup::group(&self.backend.partitions(&resolved)?) {
            aged.extend(
                group
                    .generated()
                    .filter(|p| p.bounds.is_some_and(|b| b.upper < cutoff))
                    .map(|p| p.name.clone()),
            );
        }
        Ok(aged)
    }
}
