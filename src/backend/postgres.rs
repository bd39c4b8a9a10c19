//! PostgreSQL implementation of the backend traits.
//!
//! All catalog text parsing (partition bound expressions, range CHECK
//! definitions) is confined to this file; callers only see typed values.

use super::{Catalog, IndexInfo, PartitionKey, PartitionStateStore, SchemaExecutor, TriggerInfo};
use crate::boundary::range_check_name;
use crate::ddl::{Ddl, ForeignKeyDefinition, ReferentialAction};
use crate::executor::{ExecError, PgExecutor};
use crate::ident::{quote_ident, QualifiedName};
use crate::model::{BoundValue, ColumnFamily, Partition, PartitionBounds, PartitionStrategy, PartitionedTable};
use crate::state::{self, DetachedPartitionRecord, PartitionSettings, StoredConfiguration};
use chrono::NaiveDate;
use chrono_tz::Tz;
use may_postgres::Row;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// oid of `$1.$2`
const REL_OID: &str = "(SELECT c.oid FROM pg_catalog.pg_class c \
     JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
     WHERE n.nspname = $1 AND c.relname = $2)";

static NATIVE_BOUND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^FOR VALUES FROM \((?P<lower>.+)\) TO \((?P<upper>.+)\)$").expect("static regex")
});

static RANGE_CHECK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"\((?P<col>"(?:[^"]|"")+"|[A-Za-z_][A-Za-z0-9_$]*) >= (?P<lower>.+?)\) AND \((?:"(?:[^"]|"")+"|[A-Za-z_][A-Za-z0-9_$]*) < (?P<upper>.+?)\)"#,
    )
    .expect("static regex")
});

/// Catalog, DDL and state-store access over one connection.
pub struct PgBackend<E: PgExecutor> {
    executor: E,
    config_table: QualifiedName,
    detached_table: QualifiedName,
}

impl<E: PgExecutor> PgBackend<E> {
    /// Backend using the given state tables.
    pub fn new(executor: E, config_table: QualifiedName, detached_table: QualifiedName) -> Self {
        Self {
            executor,
            config_table,
            detached_table,
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    fn in_transaction<F>(&self, lock_timeout: Duration, body: F) -> Result<(), ExecError>
    where
        F: FnOnce(&E) -> Result<(), ExecError>,
    {
        self.executor.execute("BEGIN", &[])?;
        let result = self
            .executor
            .execute(
                &format!("SET LOCAL lock_timeout = '{}ms'", lock_timeout.as_millis().max(1)),
                &[],
            )
            .and_then(|_| body(&self.executor));

        match result {
            Ok(()) => {
                self.executor.execute("COMMIT", &[])?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.executor.execute("ROLLBACK", &[]) {
                    log::warn!("rollback after failed batch also failed: {rollback}");
                }
                Err(e)
            }
        }
    }

    fn exists(&self, sql: &str, table: &QualifiedName) -> Result<bool, ExecError> {
        let row = self.executor.query_one(sql, &[&table.schema, &table.name])?;
        Ok(row.get(0))
    }

    fn aggregate(&self, function: &str, table: &QualifiedName, column: &str, family: ColumnFamily)
        -> Result<Option<BoundValue>, ExecError> {
        let sql = format!("SELECT {function}({})::text FROM {}", quote_ident(column), table.quoted());
        let row = self.executor.query_one(&sql, &[])?;
        let value: Option<String> = row.get(0);
        value.map(|text| parse_bound(family, &text)).transpose()
    }

    /// `child -> pg_get_constraintdef` of each child's own range CHECK.
    fn range_checks(&self, table: &QualifiedName) -> Result<HashMap<String, String>, ExecError> {
        let sql = format!(
            "SELECT c.relname::text, con.conname::text, pg_catalog.pg_get_constraintdef(con.oid) \
             FROM pg_catalog.pg_inherits i \
             JOIN pg_catalog.pg_class c ON c.oid = i.inhrelid \
             JOIN pg_catalog.pg_constraint con ON con.conrelid = c.oid AND con.contype = 'c' \
             WHERE i.inhparent = {REL_OID}"
        );
        let rows = self.executor.query_all(&sql, &[&table.schema, &table.name])?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let child: String = row.get(0);
                let constraint: String = row.get(1);
                (constraint == range_check_name(&child)).then(|| (child, row.get::<_, String>(2)))
            })
            .collect())
    }
}

fn parse_bound(family: ColumnFamily, text: &str) -> Result<BoundValue, ExecError> {
    BoundValue::parse(family, text).map_err(|e| ExecError::Parse(e.to_string()))
}

fn unquote_column(text: &str) -> String {
    match text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => text.to_string(),
    }
}

/// Bounds from `FOR VALUES FROM (..) TO (..)`; `None` for DEFAULT and
/// MINVALUE/MAXVALUE ranges, which behave as catch-alls here.
fn parse_native_bound(family: ColumnFamily, expr: &str) -> Result<Option<PartitionBounds>, ExecError> {
    let Some(caps) = NATIVE_BOUND.captures(expr.trim()) else {
        return Ok(None);
    };
    let (lower, upper) = (&caps["lower"], &caps["upper"]);
    if [lower, upper].iter().any(|b| b.eq_ignore_ascii_case("MINVALUE") || b.eq_ignore_ascii_case("MAXVALUE")) {
        log::debug!("treating unbounded range {expr} as catch-all");
        return Ok(None);
    }
    let bounds = PartitionBounds::new(parse_bound(family, lower)?, parse_bound(family, upper)?)
        .map_err(|e| ExecError::Parse(e.to_string()))?;
    Ok(Some(bounds))
}

/// Column and bounds of a range CHECK as printed by `pg_get_constraintdef`.
fn parse_range_check(family: Option<ColumnFamily>, definition: &str) -> Option<(String, Option<PartitionBounds>)> {
    let caps = RANGE_CHECK.captures(definition)?;
    let column = unquote_column(&caps["col"]);
    let bounds = family.and_then(|family| {
        let lower = BoundValue::parse(family, &caps["lower"]).ok()?;
        let upper = BoundValue::parse(family, &caps["upper"]).ok()?;
        PartitionBounds::new(lower, upper).ok()
    });
    Some((column, bounds))
}

/// `SHOW TimeZone` output as an IANA zone; `localtime` and POSIX-style
/// settings are rejected.
fn parse_time_zone(name: &str) -> Result<Tz, ExecError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ExecError::Parse(format!("session time zone '{name}' is not an IANA zone name")))
}

fn string_array(row: &Row, idx: usize) -> Vec<String> {
    row.get::<_, Option<Vec<String>>>(idx).unwrap_or_default()
}

fn record_from_row(row: &Row) -> Result<DetachedPartitionRecord, ExecError> {
    let detached_on: String = row.get(5);
    let detached_on = NaiveDate::parse_from_str(&detached_on, "%Y-%m-%d")
        .map_err(|e| ExecError::Parse(format!("detached_on '{detached_on}': {e}")))?;
    Ok(DetachedPartitionRecord {
        schema: row.get(0),
        parent: row.get(1),
        partition: row.get(2),
        lower_bound: row.get(3),
        upper_bound: row.get(4),
        detached_on,
    })
}

impl<E: PgExecutor> Catalog for PgBackend<E> {
    fn table_exists(&self, table: &QualifiedName) -> Result<bool, ExecError> {
        self.exists(
            "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_class c \
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind IN ('r', 'p'))",
            table,
        )
    }

    fn partition_key(&self, table: &QualifiedName) -> Result<Option<PartitionKey>, ExecError> {
        let sql = format!(
            "SELECT a.attname::text FROM pg_catalog.pg_partitioned_table pt \
             JOIN pg_catalog.pg_attribute a ON a.attrelid = pt.partrelid AND a.attnum = pt.partattrs[0] \
             WHERE pt.partrelid = {REL_OID} AND pt.partstrat = 'r'"
        );
        let rows = self.executor.query_all(&sql, &[&table.schema, &table.name])?;
        if let Some(row) = rows.first() {
            return Ok(Some(PartitionKey {
                column: row.get(0),
                strategy: PartitionStrategy::Native,
            }));
        }

        let checks = self.range_checks(table)?;
        Ok(checks.values().find_map(|def| parse_range_check(None, def)).map(|(column, _)| PartitionKey {
            column,
            strategy: PartitionStrategy::Inheritance,
        }))
    }

    fn column_type(&self, table: &QualifiedName, column: &str) -> Result<Option<String>, ExecError> {
        let sql = format!(
            "SELECT pg_catalog.format_type(CASE WHEN t.typtype = 'd' THEN t.typbasetype ELSE a.atttypid END, NULL) \
             FROM pg_catalog.pg_attribute a JOIN pg_catalog.pg_type t ON t.oid = a.atttypid \
             WHERE a.attrelid = {REL_OID} AND a.attname = $3 AND a.attnum > 0 AND NOT a.attisdropped"
        );
        let rows = self.executor.query_all(&sql, &[&table.schema, &table.name, &column])?;
        Ok(rows.first().map(|row| row.get(0)))
    }

    fn partitions(&self, table: &PartitionedTable) -> Result<Vec<Partition>, ExecError> {
        let parent = &table.table;
        let sql = format!(
            "SELECT c.relname::text, pg_catalog.pg_get_expr(c.relpartbound, c.oid), \
             coalesce(c.reloptions, '{{}}')::text[] \
             FROM pg_catalog.pg_inherits i JOIN pg_catalog.pg_class c ON c.oid = i.inhrelid \
             WHERE i.inhparent = {REL_OID}"
        );
        let rows = self.executor.query_all(&sql, &[&parent.schema, &parent.name])?;
        let checks = match table.strategy {
            PartitionStrategy::Native => HashMap::new(),
            PartitionStrategy::Inheritance => self.range_checks(parent)?,
        };

        let mut partitions = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.get(0);
            let bounds = match table.strategy {
                PartitionStrategy::Native => {
                    let expr: Option<String> = row.get(1);
                    match expr {
                        Some(expr) => parse_native_bound(table.family, &expr)?,
                        None => None,
                    }
                }
                PartitionStrategy::Inheritance => checks
                    .get(&name)
                    .and_then(|def| parse_range_check(Some(table.family), def))
                    .and_then(|(_, bounds)| bounds),
            };
            partitions.push(Partition::from_catalog(&parent.name, &name, bounds, string_array(row, 2)));
        }
        Ok(partitions)
    }

    fn max_value(&self, table: &QualifiedName, column: &str, family: ColumnFamily)
        -> Result<Option<BoundValue>, ExecError> {
        self.aggregate("max", table, column, family)
    }

    fn min_value(&self, table: &QualifiedName, column: &str, family: ColumnFamily)
        -> Result<Option<BoundValue>, ExecError> {
        self.aggregate("min", table, column, family)
    }

    fn row_exists(&self, table: &QualifiedName, column: &str, value: &BoundValue) -> Result<bool, ExecError> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE {} = {})",
            table.quoted(),
            quote_ident(column),
            value.to_sql_literal()
        );
        Ok(self.executor.query_one(&sql, &[])?.get(0))
    }

    fn has_rows(&self, table: &QualifiedName) -> Result<bool, ExecError> {
        let sql = format!("SELECT EXISTS (SELECT 1 FROM {})", table.quoted());
        Ok(self.executor.query_one(&sql, &[])?.get(0))
    }

    fn current_date(&self) -> Result<NaiveDate, ExecError> {
        let today: String = self.executor.query_one("SELECT current_date::text", &[])?.get(0);
        NaiveDate::parse_from_str(&today, "%Y-%m-%d").map_err(|e| ExecError::Parse(format!("current_date '{today}': {e}")))
    }

    fn time_zone(&self) -> Result<Tz, ExecError> {
        let name: String = self.executor.query_one("SHOW TimeZone", &[])?.get(0);
        parse_time_zone(&name)
    }

    fn owner(&self, table: &QualifiedName) -> Result<String, ExecError> {
        let sql = format!("SELECT pg_catalog.pg_get_userbyid(c.relowner)::text FROM pg_catalog.pg_class c WHERE c.oid = {REL_OID}");
        Ok(self.executor.query_one(&sql, &[&table.schema, &table.name])?.get(0))
    }

    fn storage_options(&self, table: &QualifiedName) -> Result<Vec<String>, ExecError> {
        let sql = format!(
            "SELECT coalesce(c.reloptions, '{{}}')::text[] FROM pg_catalog.pg_class c WHERE c.oid = {REL_OID}"
        );
        let row = self.executor.query_one(&sql, &[&table.schema, &table.name])?;
        Ok(string_array(&row, 0))
    }

    fn indexes(&self, table: &QualifiedName) -> Result<Vec<IndexInfo>, ExecError> {
        let sql = format!(
            "SELECT ic.relname::text, ix.indisunique, ix.indisprimary, \
             ARRAY(SELECT a.attname::text FROM unnest(ix.indkey::int2[]) WITH ORDINALITY k(attnum, ord) \
                   JOIN pg_catalog.pg_attribute a ON a.attrelid = ix.indrelid AND a.attnum = k.attnum \
                   ORDER BY k.ord) \
             FROM pg_catalog.pg_index ix JOIN pg_catalog.pg_class ic ON ic.oid = ix.indexrelid \
             WHERE ix.indrelid = {REL_OID} \
             ORDER BY ic.relname"
        );
        let rows = self.executor.query_all(&sql, &[&table.schema, &table.name])?;
        Ok(rows
            .iter()
            .map(|row| IndexInfo {
                name: row.get(0),
                unique: row.get(1),
                primary: row.get(2),
                columns: string_array(row, 3),
            })
            .collect())
    }

    fn relation_names(&self, schema: &str) -> Result<HashSet<String>, ExecError> {
        let rows = self.executor.query_all(
            "SELECT c.relname::text FROM pg_catalog.pg_class c \
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace WHERE n.nspname = $1",
            &[&schema],
        )?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    fn referencing_foreign_keys(&self, table: &QualifiedName) -> Result<Vec<ForeignKeyDefinition>, ExecError> {
        let sql = format!(
            "SELECT con.conname::text, rn.nspname::text, rc.relname::text, \
             ARRAY(SELECT a.attname::text FROM unnest(con.conkey) WITH ORDINALITY k(attnum, ord) \
                   JOIN pg_catalog.pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum \
                   ORDER BY k.ord), \
             ARRAY(SELECT a.attname::text FROM unnest(con.confkey) WITH ORDINALITY k(attnum, ord) \
                   JOIN pg_catalog.pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum \
                   ORDER BY k.ord), \
             con.confdeltype::text, con.confupdtype::text \
             FROM pg_catalog.pg_constraint con \
             JOIN pg_catalog.pg_class rc ON rc.oid = con.conrelid \
             JOIN pg_catalog.pg_namespace rn ON rn.oid = rc.relnamespace \
             WHERE con.contype = 'f' AND con.conparentid = 0 AND con.confrelid = {REL_OID} \
             ORDER BY rn.nspname, rc.relname, con.conname"
        );
        let rows = self.executor.query_all(&sql, &[&table.schema, &table.name])?;
        rows.iter()
            .map(|row| {
                let schema: String = row.get(1);
                let name: String = row.get(2);
                let referencing = QualifiedName::new(schema, name).map_err(|e| ExecError::Parse(e.to_string()))?;
                Ok(ForeignKeyDefinition {
                    name: row.get(0),
                    table: referencing,
                    columns: string_array(row, 3),
                    references: table.clone(),
                    referenced_columns: string_array(row, 4),
                    on_delete: ReferentialAction::from_catalog_code(&row.get::<_, String>(5)),
                    on_update: ReferentialAction::from_catalog_code(&row.get::<_, String>(6)),
                })
            })
            .collect()
    }

    fn triggers(&self, table: &QualifiedName) -> Result<Vec<TriggerInfo>, ExecError> {
        let sql = format!(
            "SELECT t.tgname::text, pg_catalog.pg_get_triggerdef(t.oid) FROM pg_catalog.pg_trigger t \
             WHERE t.tgrelid = {REL_OID} AND NOT t.tgisinternal ORDER BY t.tgname"
        );
        let rows = self.executor.query_all(&sql, &[&table.schema, &table.name])?;
        Ok(rows
            .iter()
            .map(|row| TriggerInfo {
                name: row.get(0),
                definition: row.get(1),
            })
            .collect())
    }

    fn check_constraints(&self, table: &QualifiedName) -> Result<Vec<String>, ExecError> {
        let sql = format!(
            "SELECT con.conname::text FROM pg_catalog.pg_constraint con \
             WHERE con.conrelid = {REL_OID} AND con.contype = 'c' ORDER BY con.conname"
        );
        let rows = self.executor.query_all(&sql, &[&table.schema, &table.name])?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    fn is_attached(&self, table: &QualifiedName) -> Result<bool, ExecError> {
        self.exists(
            &format!("SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_inherits WHERE inhrelid = {REL_OID})"),
            table,
        )
    }
}

impl<E: PgExecutor> SchemaExecutor for PgBackend<E> {
    fn execute(&self, ddl: &Ddl) -> Result<(), ExecError> {
        let sql = ddl.to_string();
        log::debug!("{sql}");
        self.executor.execute(&sql, &[]).map(|_| ())
    }

    fn execute_locked(&self, statements: &[Ddl], lock_timeout: Duration) -> Result<(), ExecError> {
        if let Some(ddl) = statements.iter().find(|ddl| ddl.requires_autocommit()) {
            return Err(ExecError::Other(format!("cannot run inside a transaction: {ddl}")));
        }
        self.in_transaction(lock_timeout, |executor| {
            for ddl in statements {
                let sql = ddl.to_string();
                log::debug!("{sql}");
                executor.execute(&sql, &[])?;
            }
            Ok(())
        })
    }
}

impl<E: PgExecutor> PartitionStateStore for PgBackend<E> {
    fn ensure_state_tables(&self) -> Result<(), ExecError> {
        for sql in state::state_table_statements(&self.config_table, &self.detached_table) {
            log::debug!("{sql}");
            self.executor.execute(&sql, &[])?;
        }
        Ok(())
    }

    fn configurations(&self) -> Result<Vec<StoredConfiguration>, ExecError> {
        let sql = format!(
            "SELECT schema_name, table_name, config::text FROM {} ORDER BY schema_name, table_name",
            self.config_table.quoted()
        );
        let rows = self.executor.query_all(&sql, &[])?;
        Ok(rows
            .iter()
            .map(|row| StoredConfiguration {
                schema: row.get(0),
                table: row.get(1),
                config: row.get(2),
            })
            .collect())
    }

    fn save_configuration(&self, table: &QualifiedName, settings: &PartitionSettings) -> Result<(), ExecError> {
        let config = settings.to_json().map_err(|e| ExecError::Parse(e.to_string()))?;
        let sql = format!(
            "INSERT INTO {} (schema_name, table_name, config) VALUES ($1, $2, $3::text::jsonb) \
             ON CONFLICT (schema_name, table_name) DO UPDATE SET config = EXCLUDED.config",
            self.config_table.quoted()
        );
        self.executor.execute(&sql, &[&table.schema, &table.name, &config])?;
        Ok(())
    }

    fn detached_record(&self, table: &QualifiedName, partition: &str)
        -> Result<Option<DetachedPartitionRecord>, ExecError> {
        let sql = format!(
            "SELECT schema_name, parent_name, partition_name, lower_bound, upper_bound, detached_on::text \
             FROM {} WHERE schema_name = $1 AND parent_name = $2 AND partition_name = $3",
            self.detached_table.quoted()
        );
        let rows = self.executor.query_all(&sql, &[&table.schema, &table.name, &partition])?;
        rows.first().map(record_from_row).transpose()
    }

    fn detached_records(&self, table: &QualifiedName) -> Result<Vec<DetachedPartitionRecord>, ExecError> {
        let sql = format!(
            "SELECT schema_name, parent_name, partition_name, lower_bound, upper_bound, detached_on::text \
             FROM {} WHERE schema_name = $1 AND parent_name = $2 ORDER BY detached_on, partition_name",
            self.detached_table.quoted()
        );
        let rows = self.executor.query_all(&sql, &[&table.schema, &table.name])?;
        rows.iter().map(record_from_row).collect()
    }

    fn detach_and_record(&self, detach: &Ddl, record: &DetachedPartitionRecord, lock_timeout: Duration)
        -> Result<(), ExecError> {
        let insert = format!(
            "INSERT INTO {} (schema_name, parent_name, partition_name, lower_bound, upper_bound, detached_on) \
             VALUES ($1, $2, $3, $4, $5, $6::text::date) \
             ON CONFLICT (schema_name, parent_name, partition_name) DO UPDATE \
             SET lower_bound = EXCLUDED.lower_bound, upper_bound = EXCLUDED.upper_bound, detached_on = EXCLUDED.detached_on",
            self.detached_table.quoted()
        );
        let detached_on = record.detached_on.format("%Y-%m-%d").to_string();
        self.in_transaction(lock_timeout, |executor| {
            let detach = detach.to_string();
            log::debug!("{detach}");
            executor.execute(&detach, &[])?;
            executor.execute(
                &insert,
                &[
                    &record.schema,
                    &record.parent,
                    &record.partition,
                    &record.lower_bound,
                    &record.upper_bound,
                    &detached_on,
                ],
            )?;
            Ok(())
        })
    }

    fn drop_detached(&self, record: &DetachedPartitionRecord, lock_timeout: Duration) -> Result<bool, ExecError> {
        let partition = record.partition_name().map_err(|e| ExecError::Parse(e.to_string()))?;
        let attached_sql = format!("SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_inherits WHERE inhrelid = {REL_OID})");
        let delete = format!(
            "DELETE FROM {} WHERE schema_name = $1 AND parent_name = $2 AND partition_name = $3",
            self.detached_table.quoted()
        );
        let mut attached = false;
        self.in_transaction(lock_timeout, |executor| {
            // holding the lock, nobody can attach it between the check and the drop
            executor.execute(&format!("LOCK TABLE {} IN ACCESS EXCLUSIVE MODE", partition.quoted()), &[])?;
            attached = executor
                .query_one(&attached_sql, &[&partition.schema, &partition.name])?
                .get(0);
            if attached {
                return Ok(());
            }
            let drop = Ddl::DropTable { table: partition.clone() }.to_string();
            log::debug!("{drop}");
            executor.execute(&drop, &[])?;
            executor.execute(&delete, &[&record.schema, &record.parent, &record.partition])?;
            Ok(())
        })?;
        Ok(!attached)
    }
}
