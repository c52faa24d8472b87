//! Staging schema inference from source column metadata

use crate::error::{Error, Result};
use crate::models::ColumnMeta;
use crate::staging::quote_ident;
use std::fmt;
use tracing::warn;

/// SQLite storage families used for staging columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingType {
    Integer,
    Text,
    Real,
    Blob,
}

impl StagingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagingType::Integer => "INTEGER",
            StagingType::Text => "TEXT",
            StagingType::Real => "REAL",
            StagingType::Blob => "BLOB",
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, StagingType::Integer | StagingType::Real)
    }
}

impl fmt::Display for StagingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a declared source type name to a staging family.
///
/// Size suffixes (`VARCHAR(255)`) and sign modifiers (`INT UNSIGNED`) are
/// ignored. Unknown names are an error; callers fall back to TEXT.
pub fn map_type(type_name: &str) -> Result<StagingType> {
    let upper = type_name.to_ascii_uppercase();
    let base = upper.split('(').next().unwrap_or("");
    let base = base
        .split_whitespace()
        .filter(|w| !matches!(*w, "UNSIGNED" | "SIGNED" | "ZEROFILL"))
        .collect::<Vec<_>>()
        .join(" ");

    let mapped = match base.as_str() {
        "INT" | "INTEGER" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "BIGINT" | "INT8" | "BOOLEAN"
        | "BOOL" | "YEAR" | "BIT" => StagingType::Integer,
        "CHAR" | "VARCHAR" | "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM" | "SET"
        | "JSON" => StagingType::Text,
        "DATE" | "DATETIME" | "TIMESTAMP" | "TIME" => StagingType::Text,
        "FLOAT" | "DOUBLE" | "DECIMAL" | "REAL" | "NUMERIC" => StagingType::Real,
        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => {
            StagingType::Blob
        }
        _ => {
            return Err(Error::Other(format!(
                "unknown source column type: {}",
                type_name
            )))
        }
    };
    Ok(mapped)
}

/// One column clause of the staging `CREATE TABLE`
pub fn column_definition(column: &ColumnMeta) -> String {
    let name = quote_ident(&column.name);
    match map_type(&column.type_name) {
        Ok(ty) => {
            let mut def = format!("{} {}", name, ty);
            if column.nullable == Some(false) {
                def.push_str(" NOT NULL");
            }
            if ty.is_numeric() {
                def.push_str(" DEFAULT 0");
            }
            def
        }
        Err(e) => {
            warn!("{} (column {}), using TEXT", e, column.name);
            format!("{} TEXT", name)
        }
    }
}

pub fn create_table_sql(table: &str, columns: &[ColumnMeta]) -> String {
    let defs = columns
        .iter()
        .map(column_definition)
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {} ({});", quote_ident(table), defs)
}
