//! SQLite data sources

use super::SourceDb;
use crate::error::{Error, Result};
use crate::models::{ColumnMeta, RowRecord, RowValue};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Executor, Row, TypeInfo, ValueRef};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A SQLite database used as an extraction source
pub struct SqliteSource {
    name: String,
    pool: SqlitePool,
}

impl SqliteSource {
    /// Open an existing database file
    pub async fn connect(
        name: &str,
        path: &Path,
        init_sql: &str,
        max_connections: u32,
    ) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "data source {}: {} does not exist",
                name,
                path.display()
            )));
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .busy_timeout(Duration::from_secs(30));

        debug!("Connecting to SQLite source at {:?}", path);

        let init_sql = init_sql.to_string();
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .after_connect(move |conn, _meta| {
                let init_sql = init_sql.clone();
                Box::pin(async move {
                    if !init_sql.is_empty() {
                        conn.execute(init_sql.as_str()).await?;
                    }
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;

        Ok(Self {
            name: name.to_string(),
            pool,
        })
    }

    /// Create (or open) a database file; used to seed fixtures
    pub async fn create(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("sqlite")
            .to_string();
        Ok(Self { name, pool })
    }
}

#[async_trait]
impl SourceDb for SqliteSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn describe(&self, sql: &str) -> Result<Vec<ColumnMeta>> {
        describe_query(&self.pool, sql).await
    }

    fn fetch<'a>(&'a self, sql: &'a str) -> BoxStream<'a, Result<RowRecord>> {
        fetch_rows(&self.pool, sql)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) async fn describe_query(pool: &SqlitePool, sql: &str) -> Result<Vec<ColumnMeta>> {
    let described = pool.describe(sql).await?;
    Ok(described
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| ColumnMeta {
            name: col.name().to_string(),
            type_name: col.type_info().name().to_string(),
            nullable: described.nullable(i),
        })
        .collect())
}

pub(crate) fn fetch_rows<'a>(
    pool: &'a SqlitePool,
    sql: &'a str,
) -> BoxStream<'a, Result<RowRecord>> {
    let mut columns: Option<Arc<[String]>> = None;
    sqlx::query(sql)
        .persistent(false)
        .fetch(pool)
        .map(move |row| {
            let row = row?;
            let columns = columns
                .get_or_insert_with(|| column_names(&row))
                .clone();
            decode_row(&row, columns)
        })
        .boxed()
}

fn column_names(row: &SqliteRow) -> Arc<[String]> {
    row.columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect::<Vec<_>>()
        .into()
}

/// Decode by storage class of the value, not the declared column type
pub(crate) fn decode_row(row: &SqliteRow, columns: Arc<[String]>) -> Result<RowRecord> {
    let mut values = Vec::with_capacity(columns.len());
    for idx in 0..columns.len() {
        values.push(decode_value(row, idx).map_err(|e| {
            Error::RowDecode(format!("column {}: {}", columns[idx], e))
        })?);
    }
    Ok(RowRecord::new(columns, values))
}

fn decode_value(row: &SqliteRow, idx: usize) -> std::result::Result<RowValue, sqlx::Error> {
    let storage = {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(RowValue::Null);
        }
        raw.type_info().name().to_ascii_uppercase()
    };

    let value = match storage.as_str() {
        "INTEGER" | "BOOLEAN" | "INT8" => RowValue::Integer(row.try_get_unchecked::<i64, _>(idx)?),
        "REAL" | "NUMERIC" => RowValue::Float(row.try_get_unchecked::<f64, _>(idx)?),
        "BLOB" => RowValue::from_bytes(row.try_get_unchecked::<Vec<u8>, _>(idx)?),
        _ => RowValue::Text(row.try_get_unchecked::<String, _>(idx)?),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    async fn seeded_source(tmp: &TempDir) -> SqliteSource {
        let source = SqliteSource::create(&tmp.path().join("shop.db")).await.unwrap();
        source
            .execute(
                "CREATE TABLE products (id INTEGER NOT NULL, name TEXT, price REAL, img BLOB);
                 INSERT INTO products VALUES (1, 'lamp', 9.5, x'6869');
                 INSERT INTO products VALUES (2, NULL, 3, x'ff00');",
            )
            .await
            .unwrap();
        source
    }

    #[tokio::test]
    async fn test_fetch_decodes_storage_classes() {
        let tmp = TempDir::new().unwrap();
        let source = seeded_source(&tmp).await;

        let rows: Vec<RowRecord> = source
            .fetch("SELECT id, name, price, img FROM products ORDER BY id")
            .try_collect()
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("name"), Some(&RowValue::Text("lamp".to_string())));
        assert_eq!(rows[0].get("price"), Some(&RowValue::Float(9.5)));
        assert_eq!(rows[0].get("img"), Some(&RowValue::Text("hi".to_string())));
        assert_eq!(rows[1].get("name"), Some(&RowValue::Null));
        assert_eq!(rows[1].get("img"), Some(&RowValue::Binary(vec![0xff, 0x00])));
    }

    #[tokio::test]
    async fn test_describe_and_key_range() {
        let tmp = TempDir::new().unwrap();
        let source = seeded_source(&tmp).await;

        let columns = source.describe("SELECT id, name FROM products").await.unwrap();
        assert_eq!(columns[0].name, "id");
        assert_eq!(columns[0].type_name.to_uppercase(), "INTEGER");
        assert_eq!(columns[1].name, "name");

        let range = source
            .key_range("SELECT MIN(id), MAX(id) FROM products")
            .await
            .unwrap();
        assert_eq!(range, Some((1, 2)));
    }

    #[tokio::test]
    async fn test_init_sql_runs_on_every_connection() {
        let tmp = TempDir::new().unwrap();
        seeded_source(&tmp).await.pool.close().await;
        let path = tmp.path().join("shop.db");

        let source = SqliteSource::connect(
            "shop",
            &path,
            "CREATE TEMP VIEW session_marker AS SELECT 7 AS v",
            1,
        )
        .await
        .unwrap();
        let rows: Vec<RowRecord> = source
            .fetch("SELECT v FROM session_marker")
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows[0].get("v"), Some(&RowValue::Integer(7)));

        let broken = SqliteSource::connect("shop", &path, "NOT A STATEMENT", 1).await;
        assert!(broken.is_err());
    }

    #[tokio::test]
    async fn test_connect_missing_file() {
        let tmp = TempDir::new().unwrap();
        let result = SqliteSource::connect("x", &tmp.path().join("nope.db"), "", 1).await;
        assert!(result.is_err());
    }
}
