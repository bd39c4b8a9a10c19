//! Identifier handling for generated SQL.
//!
//! Every schema, table, index and constraint name that ends up in a statement
//! goes through this module. Names are validated once when they enter the
//! engine and are always rendered double-quoted.

use crate::error::PartitionError;
use std::fmt;

/// PostgreSQL's `NAMEDATALEN - 1`.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// A schema-qualified relation name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedName {
    pub schema: String,
    pub name: String,
}

impl QualifiedName {
    /// Build a validated qualified name.
    ///
    /// # Errors
    ///
    /// Returns `PartitionError::InvalidIdentifier` if either part is empty,
    /// contains a NUL byte or exceeds 63 bytes.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Result<Self, PartitionError> {
        let schema = schema.into();
        let name = name.into();
        validate_identifier(&schema)?;
        validate_identifier(&name)?;
        Ok(Self { schema, name })
    }

    /// Parse `schema.table` or a bare `table` (defaulting to `public`).
    ///
    /// Quoted parts are not supported here; callers with dots inside names
    /// should use [`QualifiedName::new`].
    pub fn parse(text: &str) -> Result<Self, PartitionError> {
        match text.split_once('.') {
            Some((schema, name)) => Self::new(schema, name),
            None => Self::new("public", text),
        }
    }

    /// A sibling relation in the same schema.
    pub fn sibling(&self, name: impl Into<String>) -> Result<Self, PartitionError> {
        Self::new(self.schema.clone(), name)
    }

    /// Render as `"schema"."name"`.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Check that `ident` is usable as a PostgreSQL identifier once quoted.
pub fn validate_identifier(ident: &str) -> Result<(), PartitionError> {
    if ident.is_empty() {
        return Err(PartitionError::InvalidIdentifier("identifier cannot be empty".to_string()));
    }
    if ident.contains('\0') {
        return Err(PartitionError::InvalidIdentifier(format!(
            "identifier contains a NUL byte: {ident:?}"
        )));
    }
    if ident.len() > MAX_IDENTIFIER_LEN {
        return Err(PartitionError::InvalidIdentifier(format!(
            "identifier longer than {MAX_IDENTIFIER_LEN} bytes: {ident}"
        )));
    }
    Ok(())
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quote a string literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Join `prefix` and `suffix` with `_`, shortening the prefix so the result
/// fits in 63 bytes. The suffix carries the distinguishing part (bounds,
/// counters) and is never cut.
pub fn truncate_with_suffix(prefix: &str, suffix: &str) -> String {
    let budget = MAX_IDENTIFIER_LEN.saturating_sub(suffix.len() + 1);
    let mut end = prefix.len().min(budget);
    while !prefix.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}_{}", &prefix[..end], suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_doubles_quotes() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("2023-01-01"), "'2023-01-01'");
        assert_eq!(quote_literal("o'neil"), "'o''neil'");
    }

    #[test]
    fn test_qualified_name_parse() {
        let name = QualifiedName::parse("sales.orders").unwrap();
        assert_eq!(name.schema, "sales");
        assert_eq!(name.name, "orders");
        assert_eq!(name.quoted(), "\"sales\".\"orders\"");

        let bare = QualifiedName::parse("orders").unwrap();
        assert_eq!(bare.schema, "public");
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(QualifiedName::new("", "t").is_err());
        assert!(QualifiedName::new("s", "a\0b").is_err());
        assert!(QualifiedName::new("s", "x".repeat(64)).is_err());
        assert!(QualifiedName::new("s", "x".repeat(63)).is_ok());
    }

    #[test]
    fn test_truncate_keeps_suffix() {
        let long = "a".repeat(70);
        let name = truncate_with_suffix(&long, "20230101_20230201");
        assert_eq!(name.len(), MAX_IDENTIFIER_LEN);
        assert!(name.ends_with("_20230101_20230201"));

        assert_eq!(truncate_with_suffix("orders", "idx"), "orders_idx");
    }
}
