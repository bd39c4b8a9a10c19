//! In-memory backend for engine tests.
//!
//! `FakeBackend` keeps a tiny model of the catalog (tables, attachments,
//! CHECK constraints, indexes, foreign keys, rows keyed by column) and
//! interprets [`Ddl`] against it, so lifecycle operations can be exercised
//! without a server. Locked batches are atomic and can be scripted to fail
//! with `lock_not_available`.

#![allow(dead_code)]

use crate::backend::{Catalog, IndexInfo, PartitionKey, PartitionStateStore, SchemaExecutor, TriggerInfo};
use crate::boundary::range_check_name;
use crate::ddl::{CheckExpr, Ddl, ForeignKeyDefinition, IndexTarget};
use crate::executor::ExecError;
use crate::ident::QualifiedName;
use crate::model::{BoundValue, ColumnFamily, Partition, PartitionBounds, PartitionStrategy, PartitionedTable};
use crate::state::{DetachedPartitionRecord, PartitionSettings, StoredConfiguration};
use chrono::NaiveDate;
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

pub type FakeRow = BTreeMap<String, BoundValue>;

#[derive(Debug, Clone)]
pub struct FakeCheck {
    pub name: String,
    pub check: CheckExpr,
    pub valid: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FakeTable {
    pub columns: Vec<(String, String)>,
    pub rows: Vec<FakeRow>,
    pub owner: String,
    /// Range key of a native partitioned parent
    pub partition_key: Option<String>,
    pub attached_to: Option<QualifiedName>,
    /// Native partition bound; `None` with `attached_to` set means DEFAULT or inheritance
    pub bound: Option<PartitionBounds>,
    pub checks: Vec<FakeCheck>,
    pub indexes: Vec<IndexInfo>,
    pub storage_options: Vec<String>,
    pub triggers: Vec<TriggerInfo>,
}

#[derive(Debug, Clone, Default)]
struct FakeState {
    tables: BTreeMap<QualifiedName, FakeTable>,
    foreign_keys: Vec<(ForeignKeyDefinition, bool)>,
    configurations: Vec<StoredConfiguration>,
    detached: Vec<DetachedPartitionRecord>,
    today: Option<NaiveDate>,
    zone: Option<Tz>,
    executed: Vec<String>,
    lock_failures: u32,
    record_failures: u32,
}

/// In-memory [`PartitionBackend`](crate::backend::PartitionBackend).
#[derive(Debug, Default)]
pub struct FakeBackend {
    state: RefCell<FakeState>,
}

pub fn qn(text: &str) -> QualifiedName {
    QualifiedName::parse(text).unwrap()
}

pub fn int_bounds(lower: i64, upper: i64) -> PartitionBounds {
    PartitionBounds::new(BoundValue::Integer(lower), BoundValue::Integer(upper)).unwrap()
}

pub fn date(text: &str) -> BoundValue {
    BoundValue::parse(ColumnFamily::Date, text).unwrap()
}

pub fn timestamp(text: &str) -> BoundValue {
    BoundValue::parse(ColumnFamily::Timestamp, text).unwrap()
}

pub fn day(text: &str) -> NaiveDate {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").unwrap()
}

fn other(message: impl Into<String>) -> ExecError {
    ExecError::Other(message.into())
}

const FAKE_USER: &str = "partwarden";

impl FakeBackend {
    pub fn new(today: NaiveDate) -> Self {
        let backend = Self::default();
        backend.state.borrow_mut().today = Some(today);
        backend
    }

    pub fn set_today(&self, today: NaiveDate) {
        self.state.borrow_mut().today = Some(today);
    }

    pub fn set_time_zone(&self, zone: Tz) {
        self.state.borrow_mut().zone = Some(zone);
    }

    /// The next `n` writes to the detached-partition registry fail.
    pub fn fail_record_writes(&self, n: u32) {
        self.state.borrow_mut().record_failures = n;
    }

    /// The next `n` locked batches fail with `lock_not_available`.
    pub fn fail_locked_batches(&self, n: u32) {
        self.state.borrow_mut().lock_failures = n;
    }

    pub fn create_table(&self, table: &str, columns: &[(&str, &str)]) {
        let mut state = self.state.borrow_mut();
        state.tables.insert(
            qn(table),
            FakeTable {
                columns: columns.iter().map(|(n, t)| (n.to_string(), t.to_string())).collect(),
                owner: "app".to_string(),
                ..Default::default()
            },
        );
    }

    /// A native range-partitioned parent.
    pub fn create_partitioned(&self, table: &str, columns: &[(&str, &str)], key: &str) {
        self.create_table(table, columns);
        self.with_table(table, |t| t.partition_key = Some(key.to_string()));
    }

    /// A child shaped like `parent`, attached for `bounds` (DEFAULT when `None`).
    pub fn add_partition(&self, parent: &str, child: &str, bounds: Option<PartitionBounds>) {
        let parent_name = qn(parent);
        let columns = self.table(parent).map(|t| t.columns).unwrap_or_default();
        let mut state = self.state.borrow_mut();
        state.tables.insert(
            parent_name.sibling(child).unwrap(),
            FakeTable {
                columns,
                owner: "app".to_string(),
                attached_to: Some(parent_name),
                bound: bounds,
                ..Default::default()
            },
        );
    }

    /// An inheritance child guarded by `<child>_range_check`.
    pub fn add_inheritance_child(&self, parent: &str, child: &str, key: &str, bounds: Option<PartitionBounds>) {
        self.add_partition(parent, child, None);
        if let Some(bounds) = bounds {
            self.with_table(&format!("{}.{child}", qn(parent).schema), |t| {
                t.checks.push(FakeCheck {
                    name: range_check_name(child),
                    check: CheckExpr::Range {
                        column: key.to_string(),
                        bounds,
                    },
                    valid: true,
                })
            });
        }
    }

    pub fn with_table(&self, table: &str, f: impl FnOnce(&mut FakeTable)) {
        let mut state = self.state.borrow_mut();
        let entry = state.tables.get_mut(&qn(table)).expect("fake table exists");
        f(entry);
    }

    pub fn add_index(&self, table: &str, name: &str, columns: &[&str], unique: bool, primary: bool) {
        self.with_table(table, |t| {
            t.indexes.push(IndexInfo {
                name: name.to_string(),
                columns: columns.iter().map(ToString::to_string).collect(),
                unique,
                primary,
            })
        });
    }

    pub fn add_foreign_key(&self, definition: ForeignKeyDefinition) {
        self.state.borrow_mut().foreign_keys.push((definition, true));
    }

    /// Insert a row, routing through native parents.
    pub fn insert(&self, table: &str, values: &[(&str, BoundValue)]) -> Result<(), ExecError> {
        let row: FakeRow = values.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        let mut state = self.state.borrow_mut();
        let target = route(&state, &qn(table), &row)?;
        let entry = state.tables.get_mut(&target).ok_or_else(|| other("no such table"))?;
        for check in &entry.checks {
            if !check_holds(&check.check, &row) {
                return Err(other(format!("new row violates check constraint {}", check.name)));
            }
        }
        entry.rows.push(row);
        Ok(())
    }

    pub fn insert_int(&self, table: &str, column: &str, value: i64) {
        self.insert(table, &[(column, BoundValue::Integer(value))]).unwrap();
    }

    pub fn table(&self, table: &str) -> Option<FakeTable> {
        self.state.borrow().tables.get(&qn(table)).cloned()
    }

    pub fn exists(&self, table: &str) -> bool {
        self.state.borrow().tables.contains_key(&qn(table))
    }

    /// Rows reachable through `table` and its descendants.
    pub fn row_count(&self, table: &str) -> usize {
        let state = self.state.borrow();
        collect_rows(&state, &qn(table)).len()
    }

    /// Children of `parent` ordered by name.
    pub fn children(&self, parent: &str) -> Vec<String> {
        let parent = qn(parent);
        self.state
            .borrow()
            .tables
            .iter()
            .filter(|(_, t)| t.attached_to.as_ref() == Some(&parent))
            .map(|(name, _)| name.name.clone())
            .collect()
    }

    /// Native bounds of every attached child, ordered by lower bound.
    pub fn attached_bounds(&self, parent: &str) -> Vec<PartitionBounds> {
        let parent = qn(parent);
        let state = self.state.borrow();
        let mut bounds: Vec<PartitionBounds> = state
            .tables
            .values()
            .filter(|t| t.attached_to.as_ref() == Some(&parent))
            .filter_map(|t| t.bound)
            .collect();
        bounds.sort_by_key(|b| b.lower);
        bounds
    }

    pub fn foreign_keys(&self) -> Vec<(ForeignKeyDefinition, bool)> {
        self.state.borrow().foreign_keys.clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.borrow().executed.clone()
    }

    pub fn detached(&self) -> Vec<DetachedPartitionRecord> {
        self.state.borrow().detached.clone()
    }

    pub fn add_configuration(&self, schema: &str, table: &str, config: &str) {
        self.state.borrow_mut().configurations.push(StoredConfiguration {
            schema: schema.to_string(),
            table: table.to_string(),
            config: config.to_string(),
        });
    }

    fn apply(state: &mut FakeState, ddl: &Ddl) -> Result<(), ExecError> {
        match ddl {
            Ddl::CreateTableLike {
                table,
                source,
                include_indexes,
            }
            | Ddl::CreatePartitionedTable {
                table,
                source,
                include_indexes,
                ..
            } => {
                if state.tables.contains_key(table) {
                    return Err(other(format!("relation {table} already exists")));
                }
                let src = state.tables.get(source).ok_or_else(|| other(format!("{source} does not exist")))?;
                let indexes = if *include_indexes {
                    src.indexes
                        .iter()
                        .map(|index| IndexInfo {
                            name: format!("{}_{}_idx", table.name, index.columns.join("_")),
                            ..index.clone()
                        })
                        .collect()
                } else {
                    Vec::new()
                };
                let partition_key = match ddl {
                    Ddl::CreatePartitionedTable { column, .. } => Some(column.clone()),
                    _ => None,
                };
                let created = FakeTable {
                    columns: src.columns.clone(),
                    owner: FAKE_USER.to_string(),
                    partition_key,
                    checks: src.checks.clone(),
                    indexes,
                    ..Default::default()
                };
                state.tables.insert(table.clone(), created);
            }
            Ddl::AddCheck {
                table,
                name,
                check,
                not_valid,
            } => {
                let rows = collect_rows(state, table);
                let entry = table_mut(state, table)?;
                if entry.checks.iter().any(|c| &c.name == name) {
                    return Err(other(format!("constraint {name} already exists")));
                }
                if !not_valid && !rows.iter().all(|row| check_holds(check, row)) {
                    return Err(other(format!("check constraint {name} is violated by some row")));
                }
                entry.checks.push(FakeCheck {
                    name: name.clone(),
                    check: check.clone(),
                    valid: !not_valid,
                });
            }
            Ddl::ValidateConstraint { table, name } => {
                if let Some((_, valid)) = state
                    .foreign_keys
                    .iter_mut()
                    .find(|(fk, _)| &fk.table == table && &fk.name == name)
                {
                    *valid = true;
                    return Ok(());
                }
                let rows = collect_rows(state, table);
                let entry = table_mut(state, table)?;
                let check = entry
                    .checks
                    .iter_mut()
                    .find(|c| &c.name == name)
                    .ok_or_else(|| other(format!("constraint {name} does not exist")))?;
                if !rows.iter().all(|row| check_holds(&check.check, row)) {
                    return Err(other(format!("check constraint {name} is violated by some row")));
                }
                check.valid = true;
            }
            Ddl::MarkConstraintValid { table, name } => {
                if let Some(entry) = state.tables.get_mut(table) {
                    for check in entry.checks.iter_mut().filter(|c| &c.name == name) {
                        check.valid = true;
                    }
                }
            }
            Ddl::DropConstraint { table, name } => {
                state.foreign_keys.retain(|(fk, _)| !(&fk.table == table && &fk.name == name));
                if let Some(entry) = state.tables.get_mut(table) {
                    entry.checks.retain(|c| &c.name != name);
                }
            }
            Ddl::AddForeignKey { definition, not_valid } => {
                if !state.tables.contains_key(&definition.table) || !state.tables.contains_key(&definition.references) {
                    return Err(other(format!("foreign key {} refers to a missing table", definition.name)));
                }
                let referenced: HashSet<&String> = definition.referenced_columns.iter().collect();
                let covered = state.tables[&definition.references]
                    .indexes
                    .iter()
                    .any(|i| i.unique && i.columns.iter().collect::<HashSet<_>>() == referenced);
                if !covered {
                    return Err(other(format!(
                        "there is no unique constraint matching given keys for referenced table {}",
                        definition.references
                    )));
                }
                if state
                    .foreign_keys
                    .iter()
                    .any(|(fk, _)| fk.table == definition.table && fk.name == definition.name)
                {
                    return Err(other(format!("constraint {} already exists", definition.name)));
                }
                state.foreign_keys.push((definition.clone(), !not_valid));
            }
            Ddl::SetStorageOptions { table, options } => {
                let entry = table_mut(state, table)?;
                for option in options {
                    let rendered = format!("{}={}", option.name, option.value);
                    entry.storage_options.retain(|o| !o.starts_with(&format!("{}=", option.name)));
                    entry.storage_options.push(rendered);
                }
            }
            Ddl::AttachPartition { parent, child, bounds } => {
                let parent_entry = state.tables.get(parent).ok_or_else(|| other(format!("{parent} does not exist")))?;
                let key = parent_entry
                    .partition_key
                    .clone()
                    .ok_or_else(|| other(format!("{parent} is not partitioned")))?;
                let overlap = state
                    .tables
                    .iter()
                    .filter(|(_, t)| t.attached_to.as_ref() == Some(parent))
                    .find(|(_, t)| t.bound.is_some_and(|b| b.overlaps(bounds)));
                if let Some((name, _)) = overlap {
                    return Err(other(format!("partition {child} would overlap partition {name}")));
                }
                let entry = table_mut(state, child)?;
                if entry.attached_to.is_some() {
                    return Err(other(format!("{child} is already a partition")));
                }
                let outside = entry
                    .rows
                    .iter()
                    .any(|row| row.get(&key).map_or(true, |v| !bounds.contains(v)));
                if outside {
                    return Err(other(format!("partition constraint of {child} is violated by some row")));
                }
                entry.attached_to = Some(parent.clone());
                entry.bound = Some(*bounds);
            }
            Ddl::DetachPartition { parent, child } | Ddl::NoInherit { child, parent } => {
                let entry = table_mut(state, child)?;
                if entry.attached_to.as_ref() != Some(parent) {
                    return Err(other(format!("{child} is not a child of {parent}")));
                }
                entry.attached_to = None;
                entry.bound = None;
            }
            Ddl::Inherit { child, parent } => {
                if !state.tables.contains_key(parent) {
                    return Err(other(format!("{parent} does not exist")));
                }
                let entry = table_mut(state, child)?;
                entry.attached_to = Some(parent.clone());
            }
            Ddl::RenameTable { table, new_name } => {
                let renamed = table.sibling(new_name.clone()).map_err(|e| other(e.to_string()))?;
                if state.tables.contains_key(&renamed) {
                    return Err(other(format!("relation {renamed} already exists")));
                }
                let entry = state.tables.remove(table).ok_or_else(|| other(format!("{table} does not exist")))?;
                state.tables.insert(renamed.clone(), entry);
                for t in state.tables.values_mut() {
                    if t.attached_to.as_ref() == Some(table) {
                        t.attached_to = Some(renamed.clone());
                    }
                }
                // pg_get_triggerdef prints the current name
                for trigger in state.tables.values_mut().flat_map(|t| t.triggers.iter_mut()) {
                    trigger.definition = retarget_trigger(&trigger.definition, table, &renamed);
                }
                for (fk, _) in &mut state.foreign_keys {
                    if &fk.table == table {
                        fk.table = renamed.clone();
                    }
                    if &fk.references == table {
                        fk.references = renamed.clone();
                    }
                }
            }
            Ddl::RenameIndex { index, new_name } => {
                let names = relation_names(state, &index.schema);
                if names.contains(new_name) {
                    return Err(other(format!("relation {new_name} already exists")));
                }
                let found = state
                    .tables
                    .iter_mut()
                    .filter(|(t, _)| t.schema == index.schema)
                    .flat_map(|(_, t)| t.indexes.iter_mut())
                    .find(|i| i.name == index.name)
                    .ok_or_else(|| other(format!("index {index} does not exist")))?;
                found.name = new_name.clone();
            }
            Ddl::SetOwner { table, owner } => table_mut(state, table)?.owner = owner.clone(),
            Ddl::DropTable { table } => {
                state.tables.remove(table);
                state.foreign_keys.retain(|(fk, _)| &fk.table != table);
            }
            Ddl::CreateIndex(index) => {
                let names = relation_names(state, &index.table.schema);
                if names.contains(&index.name) {
                    if index.if_not_exists {
                        return Ok(());
                    }
                    return Err(other(format!("relation {} already exists", index.name)));
                }
                let entry = table_mut(state, &index.table)?;
                if let (Some(key), true) = (&entry.partition_key, index.unique) {
                    if !index.columns.iter().any(|c| c.refers_to_column(key)) {
                        return Err(other("unique constraint on partitioned table must include all partitioning columns"));
                    }
                }
                entry.indexes.push(IndexInfo {
                    name: index.name.clone(),
                    columns: index
                        .columns
                        .iter()
                        .filter_map(|c| match &c.target {
                            IndexTarget::Column(name) => Some(name.clone()),
                            IndexTarget::Expression(_) => None,
                        })
                        .collect(),
                    unique: index.unique,
                    primary: false,
                });
            }
            Ddl::DropTrigger { table, name } => table_mut(state, table)?.triggers.retain(|t| &t.name != name),
            Ddl::CreateTrigger { table, name, definition } => {
                // the statement's ON clause decides where the trigger lands
                let target = trigger_target(definition).unwrap_or_else(|| table.clone());
                let entry = table_mut(state, &target)?;
                if entry.triggers.iter().any(|t| &t.name == name) {
                    return Err(other(format!("trigger {name} for relation {target} already exists")));
                }
                entry.triggers.push(TriggerInfo {
                    name: name.clone(),
                    definition: definition.clone(),
                });
            }
        }
        Ok(())
    }
}

fn table_mut<'a>(state: &'a mut FakeState, table: &QualifiedName) -> Result<&'a mut FakeTable, ExecError> {
    state
        .tables
        .get_mut(table)
        .ok_or_else(|| other(format!("relation {table} does not exist")))
}

fn relation_names(state: &FakeState, schema: &str) -> HashSet<String> {
    state
        .tables
        .iter()
        .filter(|(name, _)| name.schema == schema)
        .flat_map(|(name, t)| std::iter::once(name.name.clone()).chain(t.indexes.iter().map(|i| i.name.clone())))
        .collect()
}

fn check_holds(check: &CheckExpr, row: &FakeRow) -> bool {
    match check {
        CheckExpr::Range { column, bounds } => row.get(column).is_some_and(|v| bounds.contains(v)),
        CheckExpr::AtLeast { column, value } => row.get(column).map_or(true, |v| v >= value),
        CheckExpr::AtMost { column, value } => row.get(column).map_or(true, |v| v <= value),
    }
}

static TRIGGER_ON: Lazy<Regex> = Lazy::new(|| Regex::new(r"\sON\s+(\S+)\s").expect("static regex"));

fn trigger_target(definition: &str) -> Option<QualifiedName> {
    let caps = TRIGGER_ON.captures(definition)?;
    QualifiedName::parse(caps.get(1)?.as_str()).ok()
}

fn retarget_trigger(definition: &str, from: &QualifiedName, to: &QualifiedName) -> String {
    let Some(on) = TRIGGER_ON.captures(definition).and_then(|c| c.get(1)) else {
        return definition.to_string();
    };
    match QualifiedName::parse(on.as_str()) {
        Ok(target) if &target == from => format!("{}{to}{}", &definition[..on.start()], &definition[on.end()..]),
        _ => definition.to_string(),
    }
}

/// Native parents route rows to their partitions; inheritance parents keep
/// them, as PostgreSQL does without a routing trigger.
fn route(state: &FakeState, table: &QualifiedName, row: &FakeRow) -> Result<QualifiedName, ExecError> {
    let entry = state.tables.get(table).ok_or_else(|| other(format!("{table} does not exist")))?;
    let children: Vec<(&QualifiedName, &FakeTable)> = state
        .tables
        .iter()
        .filter(|(_, t)| t.attached_to.as_ref() == Some(table))
        .collect();

    if let Some(key) = &entry.partition_key {
        let value = row.get(key).ok_or_else(|| other("null partition key"))?;
        let target = children
            .iter()
            .find(|(_, t)| t.bound.is_some_and(|b| b.contains(value)))
            .or_else(|| children.iter().find(|(_, t)| t.bound.is_none()))
            .ok_or_else(|| other(format!("no partition of {table} found for row")))?;
        return route(state, target.0, row);
    }
    Ok(table.clone())
}

fn collect_rows(state: &FakeState, table: &QualifiedName) -> Vec<FakeRow> {
    let Some(entry) = state.tables.get(table) else {
        return Vec::new();
    };
    let mut rows = entry.rows.clone();
    for (name, _) in state.tables.iter().filter(|(_, t)| t.attached_to.as_ref() == Some(table)) {
        rows.extend(collect_rows(state, name));
    }
    rows
}

impl Catalog for FakeBackend {
    fn table_exists(&self, table: &QualifiedName) -> Result<bool, ExecError> {
        Ok(self.state.borrow().tables.contains_key(table))
    }

    fn partition_key(&self, table: &QualifiedName) -> Result<Option<PartitionKey>, ExecError> {
        let state = self.state.borrow();
        let Some(entry) = state.tables.get(table) else {
            return Ok(None);
        };
        if let Some(column) = &entry.partition_key {
            return Ok(Some(PartitionKey {
                column: column.clone(),
                strategy: PartitionStrategy::Native,
            }));
        }
        let inherited = state
            .tables
            .iter()
            .filter(|(_, t)| t.attached_to.as_ref() == Some(table))
            .flat_map(|(name, t)| t.checks.iter().filter(move |c| c.name == range_check_name(&name.name)))
            .find_map(|c| match &c.check {
                CheckExpr::Range { column, .. } => Some(column.clone()),
                _ => None,
            });
        Ok(inherited.map(|column| PartitionKey {
            column,
            strategy: PartitionStrategy::Inheritance,
        }))
    }

    fn column_type(&self, table: &QualifiedName, column: &str) -> Result<Option<String>, ExecError> {
        let state = self.state.borrow();
        Ok(state
            .tables
            .get(table)
            .and_then(|t| t.columns.iter().find(|(name, _)| name == column))
            .map(|(_, type_name)| type_name.clone()))
    }

    fn partitions(&self, table: &PartitionedTable) -> Result<Vec<Partition>, ExecError> {
        let state = self.state.borrow();
        Ok(state
            .tables
            .iter()
            .filter(|(_, t)| t.attached_to.as_ref() == Some(&table.table))
            .map(|(name, t)| {
                let bounds = match table.strategy {
                    PartitionStrategy::Native => t.bound,
                    PartitionStrategy::Inheritance => t
                        .checks
                        .iter()
                        .find(|c| c.name == range_check_name(&name.name))
                        .and_then(|c| match &c.check {
                            CheckExpr::Range { bounds, .. } => Some(*bounds),
                            _ => None,
                        }),
                };
                Partition::from_catalog(&table.table.name, &name.name, bounds, t.storage_options.clone())
            })
            .collect())
    }

    fn max_value(&self, table: &QualifiedName, column: &str, _family: ColumnFamily)
        -> Result<Option<BoundValue>, ExecError> {
        let state = self.state.borrow();
        Ok(collect_rows(&state, table).iter().filter_map(|r| r.get(column).copied()).max())
    }

    fn min_value(&self, table: &QualifiedName, column: &str, _family: ColumnFamily)
        -> Result<Option<BoundValue>, ExecError> {
        let state = self.state.borrow();
        Ok(collect_rows(&state, table).iter().filter_map(|r| r.get(column).copied()).min())
    }

    fn row_exists(&self, table: &QualifiedName, column: &str, value: &BoundValue) -> Result<bool, ExecError> {
        let state = self.state.borrow();
        Ok(collect_rows(&state, table).iter().any(|r| r.get(column) == Some(value)))
    }

    fn has_rows(&self, table: &QualifiedName) -> Result<bool, ExecError> {
        let state = self.state.borrow();
        Ok(!collect_rows(&state, table).is_empty())
    }

    fn current_date(&self) -> Result<NaiveDate, ExecError> {
        self.state.borrow().today.ok_or_else(|| other("fake clock not set"))
    }

    fn time_zone(&self) -> Result<Tz, ExecError> {
        Ok(self.state.borrow().zone.unwrap_or(Tz::UTC))
    }

    fn owner(&self, table: &QualifiedName) -> Result<String, ExecError> {
        Ok(table_ref(&self.state.borrow(), table)?.owner)
    }

    fn storage_options(&self, table: &QualifiedName) -> Result<Vec<String>, ExecError> {
        Ok(table_ref(&self.state.borrow(), table)?.storage_options)
    }

    fn indexes(&self, table: &QualifiedName) -> Result<Vec<IndexInfo>, ExecError> {
        Ok(table_ref(&self.state.borrow(), table)?.indexes)
    }

    fn relation_names(&self, schema: &str) -> Result<HashSet<String>, ExecError> {
        Ok(relation_names(&self.state.borrow(), schema))
    }

    fn referencing_foreign_keys(&self, table: &QualifiedName) -> Result<Vec<ForeignKeyDefinition>, ExecError> {
        Ok(self
            .state
            .borrow()
            .foreign_keys
            .iter()
            .filter(|(fk, _)| &fk.references == table)
            .map(|(fk, _)| fk.clone())
            .collect())
    }

    fn triggers(&self, table: &QualifiedName) -> Result<Vec<TriggerInfo>, ExecError> {
        Ok(table_ref(&self.state.borrow(), table)?.triggers)
    }

    fn check_constraints(&self, table: &QualifiedName) -> Result<Vec<String>, ExecError> {
        Ok(table_ref(&self.state.borrow(), table)?
            .checks
            .iter()
            .map(|c| c.name.clone())
            .collect())
    }

    fn is_attached(&self, table: &QualifiedName) -> Result<bool, ExecError> {
        Ok(self
            .state
            .borrow()
            .tables
            .get(table)
            .is_some_and(|t| t.attached_to.is_some()))
    }
}

fn table_ref(state: &FakeState, table: &QualifiedName) -> Result<FakeTable, ExecError> {
    state
        .tables
        .get(table)
        .cloned()
        .ok_or_else(|| other(format!("relation {table} does not exist")))
}

impl SchemaExecutor for FakeBackend {
    fn execute(&self, ddl: &Ddl) -> Result<(), ExecError> {
        let mut state = self.state.borrow_mut();
        state.executed.push(ddl.to_string());
        let mut scratch = state.clone();
        FakeBackend::apply(&mut scratch, ddl)?;
        *state = scratch;
        Ok(())
    }

    fn execute_locked(&self, statements: &[Ddl], _lock_timeout: Duration) -> Result<(), ExecError> {
        let mut state = self.state.borrow_mut();
        if state.lock_failures > 0 {
            state.lock_failures -= 1;
            return Err(ExecError::LockNotAvailable(format!(
                "canceling statement due to lock timeout on {}",
                statements.first().map(|d| d.target().to_string()).unwrap_or_default()
            )));
        }
        let mut scratch = state.clone();
        for ddl in statements {
            scratch.executed.push(ddl.to_string());
            FakeBackend::apply(&mut scratch, ddl)?;
        }
        *state = scratch;
        Ok(())
    }
}

impl PartitionStateStore for FakeBackend {
    fn ensure_state_tables(&self) -> Result<(), ExecError> {
        Ok(())
    }

    fn configurations(&self) -> Result<Vec<StoredConfiguration>, ExecError> {
        Ok(self.state.borrow().configurations.clone())
    }

    fn save_configuration(&self, table: &QualifiedName, settings: &PartitionSettings) -> Result<(), ExecError> {
        let config = settings.to_json().map_err(|e| other(e.to_string()))?;
        let mut state = self.state.borrow_mut();
        state
            .configurations
            .retain(|c| !(c.schema == table.schema && c.table == table.name));
        state.configurations.push(StoredConfiguration {
            schema: table.schema.clone(),
            table: table.name.clone(),
            config,
        });
        Ok(())
    }

    fn detached_record(&self, table: &QualifiedName, partition: &str)
        -> Result<Option<DetachedPartitionRecord>, ExecError> {
        Ok(self
            .state
            .borrow()
            .detached
            .iter()
            .find(|r| r.schema == table.schema && r.parent == table.name && r.partition == partition)
            .cloned())
    }

    fn detached_records(&self, table: &QualifiedName) -> Result<Vec<DetachedPartitionRecord>, ExecError> {
        let mut records: Vec<_> = self
            .state
            .borrow()
            .detached
            .iter()
            .filter(|r| r.schema == table.schema && r.parent == table.name)
            .cloned()
            .collect();
        records.sort_by(|a, b| (a.detached_on, &a.partition).cmp(&(b.detached_on, &b.partition)));
        Ok(records)
    }

    fn detach_and_record(&self, detach: &Ddl, record: &DetachedPartitionRecord, _lock_timeout: Duration)
        -> Result<(), ExecError> {
        let mut state = self.state.borrow_mut();
        if state.lock_failures > 0 {
            state.lock_failures -= 1;
            return Err(ExecError::LockNotAvailable(format!("lock timeout detaching {}", record.partition)));
        }
        let mut scratch = state.clone();
        scratch.executed.push(detach.to_string());
        FakeBackend::apply(&mut scratch, detach)?;
        if scratch.record_failures > 0 {
            state.record_failures -= 1;
            return Err(other(format!("could not record detached partition {}", record.partition)));
        }
        scratch
            .detached
            .retain(|r| !(r.schema == record.schema && r.parent == record.parent && r.partition == record.partition));
        scratch.detached.push(record.clone());
        *state = scratch;
        Ok(())
    }

    fn drop_detached(&self, record: &DetachedPartitionRecord, _lock_timeout: Duration) -> Result<bool, ExecError> {
        let mut state = self.state.borrow_mut();
        if state.lock_failures > 0 {
            state.lock_failures -= 1;
            return Err(ExecError::LockNotAvailable(format!("lock timeout dropping {}", record.partition)));
        }
        let partition = record.partition_name().map_err(|e| other(e.to_string()))?;
        if state.tables.get(&partition).is_some_and(|t| t.attached_to.is_some()) {
            return Ok(false);
        }
        let drop = Ddl::DropTable { table: partition };
        state.executed.push(drop.to_string());
        FakeBackend::apply(&mut state, &drop)?;
        state
            .detached
            .retain(|r| !(r.schema == record.schema && r.parent == record.parent && r.partition == record.partition));
        Ok(true)
    }
}
