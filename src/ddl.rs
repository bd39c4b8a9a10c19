//! Typed DDL statements.
//!
//! Every structural change the engine makes is a [`Ddl`] value. Rendering
//! (`Display`) is the only place identifiers and literals become SQL text, and
//! it always goes through [`quote_ident`] / [`quote_literal`].

use crate::error::PartitionError;
use crate::ident::{quote_ident, quote_literal, QualifiedName};
use crate::model::{BoundValue, PartitionBounds};
use std::fmt;

/// Body of a CHECK constraint over one column.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckExpr {
    /// `col IS NOT NULL AND col >= lower AND col < upper`; implies a native partition constraint.
    Range { column: String, bounds: PartitionBounds },
    AtLeast { column: String, value: BoundValue },
    AtMost { column: String, value: BoundValue },
}

impl fmt::Display for CheckExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckExpr::Range { column, bounds } => {
                let col = quote_ident(column);
                write!(
                    f,
                    "{col} IS NOT NULL AND {col} >= {} AND {col} < {}",
                    bounds.lower.to_sql_literal(),
                    bounds.upper.to_sql_literal()
                )
            }
            CheckExpr::AtLeast { column, value } => write!(f, "{} >= {}", quote_ident(column), value.to_sql_literal()),
            CheckExpr::AtMost { column, value } => write!(f, "{} <= {}", quote_ident(column), value.to_sql_literal()),
        }
    }
}

/// A `name=value` relation option (`fillfactor=70`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageOption {
    pub name: String,
    pub value: String,
}

impl StorageOption {
    /// Parse one `pg_class.reloptions` entry.
    pub fn parse(text: &str) -> Result<Self, PartitionError> {
        let (name, value) = text
            .split_once('=')
            .ok_or_else(|| PartitionError::Configuration(format!("storage option {text:?} is not name=value")))?;
        let valid_name = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid_name {
            return Err(PartitionError::Configuration(format!("invalid storage option name {name:?}")));
        }
        Ok(Self {
            name: name.to_string(),
            value: value.to_string(),
        })
    }
}

impl fmt::Display for StorageOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.name, quote_literal(&self.value))
    }
}

/// `ON DELETE` / `ON UPDATE` behaviour of a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    /// From `pg_constraint.confdeltype` / `confupdtype`.
    pub fn from_catalog_code(code: &str) -> Self {
        match code {
            "r" => Self::Restrict,
            "c" => Self::Cascade,
            "n" => Self::SetNull,
            "d" => Self::SetDefault,
            _ => Self::NoAction,
        }
    }

    fn keyword(self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Restrict => "RESTRICT",
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
        }
    }
}

/// A foreign key as declared on the referencing table.
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyDefinition {
    pub name: String,
    pub table: QualifiedName,
    pub columns: Vec<String>,
    pub references: QualifiedName,
    pub referenced_columns: Vec<String>,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsOrder {
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexTarget {
    Column(String),
    /// Validated expression, rendered parenthesized.
    Expression(String),
}

/// One element of an index column list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumn {
    pub target: IndexTarget,
    pub opclass: Option<String>,
    pub order: Option<SortOrder>,
    pub nulls: Option<NullsOrder>,
}

impl IndexColumn {
    pub fn column(name: impl Into<String>) -> Self {
        Self {
            target: IndexTarget::Column(name.into()),
            opclass: None,
            order: None,
            nulls: None,
        }
    }

    /// Parse `col`, `"Col"`, `lower(email)`, `(a + b)` followed by an optional
    /// operator class and `ASC`/`DESC`/`NULLS FIRST`/`NULLS LAST`.
    pub fn parse(text: &str) -> Result<Self, PartitionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PartitionError::InvalidExpression("empty index column".to_string()));
        }
        if text.contains(';') || text.contains("--") || text.contains("/*") {
            return Err(PartitionError::InvalidExpression(format!("{text:?} contains forbidden characters")));
        }

        let (target, rest) = split_target(text)?;
        let mut column = Self {
            target,
            opclass: None,
            order: None,
            nulls: None,
        };

        let tokens: Vec<String> = rest.split_whitespace().map(str::to_ascii_uppercase).collect();
        let mut i = 0;
        while i < tokens.len() {
            match tokens[i].as_str() {
                "ASC" => column.order = Some(SortOrder::Asc),
                "DESC" => column.order = Some(SortOrder::Desc),
                "NULLS" => {
                    column.nulls = match tokens.get(i + 1).map(String::as_str) {
                        Some("FIRST") => Some(NullsOrder::First),
                        Some("LAST") => Some(NullsOrder::Last),
                        _ => return Err(PartitionError::InvalidExpression(format!("{text:?}: NULLS needs FIRST or LAST"))),
                    };
                    i += 1;
                }
                _ if i == 0 && column.opclass.is_none() && is_plain_identifier(&tokens[i]) => {
                    column.opclass = Some(tokens[i].to_ascii_lowercase());
                }
                other => {
                    return Err(PartitionError::InvalidExpression(format!("{text:?}: unexpected {other}")));
                }
            }
            i += 1;
        }
        Ok(column)
    }

    /// Lowercased alphanumeric fragment used when deriving index names.
    pub fn name_fragment(&self) -> String {
        let raw = match &self.target {
            IndexTarget::Column(name) => name.as_str(),
            IndexTarget::Expression(expr) => expr.as_str(),
        };
        let mut fragment = String::with_capacity(raw.len());
        for c in raw.chars() {
            if c.is_ascii_alphanumeric() {
                fragment.push(c.to_ascii_lowercase());
            } else if !fragment.ends_with('_') {
                fragment.push('_');
            }
        }
        fragment.trim_matches('_').to_string()
    }

    pub fn refers_to_column(&self, column: &str) -> bool {
        matches!(&self.target, IndexTarget::Column(name) if name == column)
    }
}

impl fmt::Display for IndexColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            IndexTarget::Column(name) => f.write_str(&quote_ident(name))?,
            IndexTarget::Expression(expr) => write!(f, "({expr})")?,
        }
        if let Some(opclass) = &self.opclass {
            write!(f, " {opclass}")?;
        }
        match self.order {
            Some(SortOrder::Asc) => f.write_str(" ASC")?,
            Some(SortOrder::Desc) => f.write_str(" DESC")?,
            None => {}
        }
        match self.nulls {
            Some(NullsOrder::First) => f.write_str(" NULLS FIRST"),
            Some(NullsOrder::Last) => f.write_str(" NULLS LAST"),
            None => Ok(()),
        }
    }
}

fn is_plain_identifier(token: &str) -> bool {
    token.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Split the leading column or expression from its modifiers.
fn split_target(text: &str) -> Result<(IndexTarget, &str), PartitionError> {
    if let Some(quoted) = text.strip_prefix('"') {
        let mut name = String::new();
        let mut chars = quoted.char_indices().peekable();
        while let Some((pos, c)) = chars.next() {
            if c == '"' {
                if chars.peek().map(|(_, next)| *next) == Some('"') {
                    name.push('"');
                    chars.next();
                    continue;
                }
                return Ok((IndexTarget::Column(name), &quoted[pos + 1..]));
            }
            name.push(c);
        }
        return Err(PartitionError::InvalidExpression(format!("{text:?}: unterminated quoted identifier")));
    }

    let head_len = text
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
        .unwrap_or(text.len());
    let after_head = &text[head_len..];
    if head_len > 0 && !after_head.trim_start().starts_with('(') {
        return Ok((IndexTarget::Column(text[..head_len].to_string()), after_head));
    }

    // function call `f(...)` or parenthesized `(...)`
    let open = text
        .find('(')
        .ok_or_else(|| PartitionError::InvalidExpression(format!("{text:?} is not a column or expression")))?;
    let close = matching_paren(text, open)?;
    let expr = &text[..=close];
    let expr = if head_len == 0 { &expr[1..expr.len() - 1] } else { expr };
    if expr.trim().is_empty() {
        return Err(PartitionError::InvalidExpression(format!("{text:?}: empty expression")));
    }
    Ok((IndexTarget::Expression(expr.trim().to_string()), &text[close + 1..]))
}

fn matching_paren(text: &str, open: usize) -> Result<usize, PartitionError> {
    let mut depth = 0usize;
    let mut in_string = false;
    for (pos, c) in text.char_indices().skip_while(|(pos, _)| *pos < open) {
        match c {
            '\'' => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Ok(pos);
                }
            }
            _ => {}
        }
    }
    Err(PartitionError::InvalidExpression(format!("{text:?}: unbalanced parentheses")))
}

/// `CREATE [UNIQUE] INDEX [CONCURRENTLY] [IF NOT EXISTS] name ON table USING method (...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDefinition {
    pub name: String,
    pub table: QualifiedName,
    pub method: String,
    pub columns: Vec<IndexColumn>,
    pub unique: bool,
    pub concurrently: bool,
    pub if_not_exists: bool,
}

/// A structural change to the database.
#[derive(Debug, Clone, PartialEq)]
pub enum Ddl {
    /// `CREATE TABLE t (LIKE source INCLUDING ALL [EXCLUDING INDEXES])`
    CreateTableLike {
        table: QualifiedName,
        source: QualifiedName,
        include_indexes: bool,
    },
    /// Range-partitioned parent shaped like `source`.
    CreatePartitionedTable {
        table: QualifiedName,
        source: QualifiedName,
        column: String,
        include_indexes: bool,
    },
    AddCheck {
        table: QualifiedName,
        name: String,
        check: CheckExpr,
        not_valid: bool,
    },
    ValidateConstraint {
        table: QualifiedName,
        name: String,
    },
    /// Flag a NOT VALID constraint as validated without scanning the table.
    MarkConstraintValid {
        table: QualifiedName,
        name: String,
    },
    DropConstraint {
        table: QualifiedName,
        name: String,
    },
    AddForeignKey {
        definition: ForeignKeyDefinition,
        not_valid: bool,
    },
    SetStorageOptions {
        table: QualifiedName,
        options: Vec<StorageOption>,
    },
    AttachPartition {
        parent: QualifiedName,
        child: QualifiedName,
        bounds: PartitionBounds,
    },
    DetachPartition {
        parent: QualifiedName,
        child: QualifiedName,
    },
    Inherit {
        child: QualifiedName,
        parent: QualifiedName,
    },
    NoInherit {
        child: QualifiedName,
        parent: QualifiedName,
    },
    RenameTable {
        table: QualifiedName,
        new_name: String,
    },
    RenameIndex {
        index: QualifiedName,
        new_name: String,
    },
    SetOwner {
        table: QualifiedName,
        owner: String,
    },
    DropTable {
        table: QualifiedName,
    },
    CreateIndex(IndexDefinition),
    DropTrigger {
        table: QualifiedName,
        name: String,
    },
    /// A trigger definition as printed by `pg_get_triggerdef`.
    CreateTrigger {
        table: QualifiedName,
        name: String,
        definition: String,
    },
}

impl Ddl {
    /// The relation the statement locks or creates.
    pub fn target(&self) -> &QualifiedName {
        match self {
            Ddl::CreateTableLike { table, .. }
            | Ddl::CreatePartitionedTable { table, .. }
            | Ddl::AddCheck { table, .. }
            | Ddl::ValidateConstraint { table, .. }
            | Ddl::MarkConstraintValid { table, .. }
            | Ddl::DropConstraint { table, .. }
            | Ddl::SetStorageOptions { table, .. }
            | Ddl::RenameTable { table, .. }
            | Ddl::SetOwner { table, .. }
            | Ddl::DropTable { table }
            | Ddl::DropTrigger { table, .. }
            | Ddl::CreateTrigger { table, .. } => table,
            Ddl::AddForeignKey { definition, .. } => &definition.table,
            Ddl::AttachPartition { parent, .. } | Ddl::DetachPartition { parent, .. } => parent,
            Ddl::Inherit { child, .. } | Ddl::NoInherit { child, .. } => child,
            Ddl::RenameIndex { index, .. } => index,
            Ddl::CreateIndex(index) => &index.table,
        }
    }

    /// `CREATE INDEX CONCURRENTLY` cannot run inside a transaction block.
    pub fn requires_autocommit(&self) -> bool {
        matches!(self, Ddl::CreateIndex(index) if index.concurrently)
    }
}

fn column_list(columns: &[String]) -> String {
    columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for Ddl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ddl::CreateTableLike {
                table,
                source,
                include_indexes,
            } => {
                let excluding = if *include_indexes { "" } else { " EXCLUDING INDEXES" };
                write!(f, "CREATE TABLE {} (LIKE {} INCLUDING ALL{excluding})", table.quoted(), source.quoted())
            }
            Ddl::CreatePartitionedTable {
                table,
                source,
                column,
                include_indexes,
            } => {
                let excluding = if *include_indexes { "" } else { " EXCLUDING INDEXES" };
                write!(
                    f,
                    "CREATE TABLE {} (LIKE {} INCLUDING ALL{excluding}) PARTITION BY RANGE ({})",
                    table.quoted(),
                    source.quoted(),
                    quote_ident(column)
                )
            }
            Ddl::AddCheck {
                table,
                name,
                check,
                not_valid,
            } => {
                let not_valid = if *not_valid { " NOT VALID" } else { "" };
                write!(
                    f,
                    "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({check}){not_valid}",
                    table.quoted(),
                    quote_ident(name)
                )
            }
            Ddl::ValidateConstraint { table, name } => {
                write!(f, "ALTER TABLE {} VALIDATE CONSTRAINT {}", table.quoted(), quote_ident(name))
            }
            Ddl::MarkConstraintValid { table, name } => write!(
                f,
                "UPDATE pg_catalog.pg_constraint SET convalidated = true WHERE conname = {} AND conrelid = {}::regclass",
                quote_literal(name),
                quote_literal(&table.quoted())
            ),
            Ddl::DropConstraint { table, name } => {
                write!(f, "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}", table.quoted(), quote_ident(name))
            }
            Ddl::AddForeignKey { definition, not_valid } => {
                write!(
                    f,
                    "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                    definition.table.quoted(),
                    quote_ident(&definition.name),
                    column_list(&definition.columns),
                    definition.references.quoted(),
                    column_list(&definition.referenced_columns)
                )?;
                if definition.on_delete != ReferentialAction::NoAction {
                    write!(f, " ON DELETE {}", definition.on_delete.keyword())?;
                }
                if definition.on_update != ReferentialAction::NoAction {
                    write!(f, " ON UPDATE {}", definition.on_update.keyword())?;
                }
                if *not_valid {
                    f.write_str(" NOT VALID")?;
                }
                Ok(())
            }
            Ddl::SetStorageOptions { table, options } => {
                let options = options.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
                write!(f, "ALTER TABLE {} SET ({options})", table.quoted())
            }
            Ddl::AttachPartition { parent, child, bounds } => write!(
                f,
                "ALTER TABLE {} ATTACH PARTITION {} FOR VALUES FROM ({}) TO ({})",
                parent.quoted(),
                child.quoted(),
                bounds.lower.to_sql_literal(),
                bounds.upper.to_sql_literal()
            ),
            Ddl::DetachPartition { parent, child } => {
                write!(f, "ALTER TABLE {} DETACH PARTITION {}", parent.quoted(), child.quoted())
            }
            Ddl::Inherit { child, parent } => {
                write!(f, "ALTER TABLE {} INHERIT {}", child.quoted(), parent.quoted())
            }
            Ddl::NoInherit { child, parent } => {
                write!(f, "ALTER TABLE {} NO INHERIT {}", child.quoted(), parent.quoted())
            }
            Ddl::RenameTable { table, new_name } => {
                write!(f, "ALTER TABLE {} RENAME TO {}", table.quoted(), quote_ident(new_name))
            }
            Ddl::RenameIndex { index, new_name } => {
                write!(f, "ALTER INDEX {} RENAME TO {}", index.quoted(), quote_ident(new_name))
            }
            Ddl::SetOwner { table, owner } => {
                write!(f, "ALTER TABLE {} OWNER TO {}", table.quoted(), quote_ident(owner))
            }
            Ddl::DropTable { table } => write!(f, "DROP TABLE IF EXISTS {}", table.quoted()),
            Ddl::CreateIndex(index) => {
                let unique = if index.unique { "UNIQUE " } else { "" };
                let concurrently = if index.concurrently { "CONCURRENTLY " } else { "" };
                let if_not_exists = if index.if_not_exists { "IF NOT EXISTS " } else { "" };
                let columns = index.columns.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
                write!(
                    f,
                    "CREATE {unique}INDEX {concurrently}{if_not_exists}{} ON {} USING {} ({columns})",
                    quote_ident(&index.name),
                    index.table.quoted(),
                    index.method
                )
            }
            Ddl::DropTrigger { table, name } => {
                write!(f, "DROP TRIGGER IF EXISTS {} ON {}", quote_ident(name), table.quoted())
            }
            Ddl::CreateTrigger { definition, .. } => f.write_str(definition),
        }
    }
}
