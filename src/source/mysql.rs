//! MySQL data sources

use super::SourceDb;
use crate::config::DataSourceConfig;
use crate::error::{Error, Result};
use crate::models::{ColumnMeta, RowRecord, RowValue};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Executor, Row, TypeInfo, ValueRef};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A MySQL (or MariaDB) database used as an extraction source
pub struct MySqlSource {
    name: String,
    pool: MySqlPool,
}

impl MySqlSource {
    pub async fn connect(
        name: &str,
        config: &DataSourceConfig,
        max_connections: u32,
    ) -> Result<Self> {
        let mut options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .password(&config.password)
            .database(&config.dbname)
            .charset("utf8mb4");
        if let Some(tz) = session_time_zone(&config.time_zone) {
            options = options.timezone(Some(tz));
        }

        debug!(
            "Connecting to MySQL {}@{}:{}/{}",
            config.username, config.host, config.port, config.dbname
        );

        let init_sql = config.init_sql.clone();
        if !init_sql.is_empty() {
            info!(data_source = name, "init sql: {}", init_sql);
        }
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
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
}

/// MySQL accepts offsets (`+08:00`) and named zones when the server has
/// zone tables loaded. Empty means keep the server default.
fn session_time_zone(tz: &str) -> Option<String> {
    let tz = tz.trim();
    if tz.is_empty() {
        None
    } else if tz.eq_ignore_ascii_case("utc") {
        Some("+00:00".to_string())
    } else {
        Some(tz.to_string())
    }
}

#[async_trait]
impl SourceDb for MySqlSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn describe(&self, sql: &str) -> Result<Vec<ColumnMeta>> {
        let described = (&self.pool).describe(sql).await?;
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

    fn fetch<'a>(&'a self, sql: &'a str) -> BoxStream<'a, Result<RowRecord>> {
        let mut columns: Option<Arc<[String]>> = None;
        sqlx::query(sql)
            .persistent(false)
            .fetch(&self.pool)
            .map(move |row| {
                let row = row?;
                let columns = columns.get_or_insert_with(|| column_names(&row)).clone();
                decode_row(&row, columns)
            })
            .boxed()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn column_names(row: &MySqlRow) -> Arc<[String]> {
    row.columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect::<Vec<_>>()
        .into()
}

fn decode_row(row: &MySqlRow, columns: Arc<[String]>) -> Result<RowRecord> {
    let mut values = Vec::with_capacity(columns.len());
    for idx in 0..columns.len() {
        values.push(
            decode_value(row, idx)
                .map_err(|e| Error::RowDecode(format!("column {}: {}", columns[idx], e)))?,
        );
    }
    Ok(RowRecord::new(columns, values))
}

/// Value families by MySQL type name, as reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Signed,
    Unsigned,
    Float,
    Double,
    Decimal,
    Date,
    DateTime,
    Timestamp,
    Time,
    Binary,
    Text,
}

fn family(type_name: &str) -> Family {
    let upper = type_name.to_ascii_uppercase();
    let unsigned = upper.contains("UNSIGNED");
    let base = upper.split_whitespace().next().unwrap_or("");
    match base {
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" if unsigned => {
            Family::Unsigned
        }
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" | "YEAR"
        | "BOOLEAN" => Family::Signed,
        "BIT" => Family::Unsigned,
        "FLOAT" => Family::Float,
        "DOUBLE" | "REAL" => Family::Double,
        "DECIMAL" | "NUMERIC" => Family::Decimal,
        "DATE" => Family::Date,
        "DATETIME" => Family::DateTime,
        "TIMESTAMP" => Family::Timestamp,
        "TIME" => Family::Time,
        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" | "GEOMETRY" => {
            Family::Binary
        }
        _ => Family::Text,
    }
}

const ZERO_DATETIME: &str = "0000-00-00 00:00:00";

fn decode_value(row: &MySqlRow, idx: usize) -> std::result::Result<RowValue, sqlx::Error> {
    let type_name = {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(RowValue::Null);
        }
        raw.type_info().name().to_string()
    };

    let value = match family(&type_name) {
        Family::Signed => RowValue::Integer(row.try_get_unchecked::<i64, _>(idx)?),
        Family::Unsigned => {
            let v = row.try_get_unchecked::<u64, _>(idx)?;
            i64::try_from(v)
                .map(RowValue::Integer)
                .unwrap_or_else(|_| RowValue::Text(v.to_string()))
        }
        Family::Float => RowValue::Float(row.try_get_unchecked::<f32, _>(idx)? as f64),
        Family::Double => RowValue::Float(row.try_get_unchecked::<f64, _>(idx)?),
        Family::Decimal => {
            let text = row.try_get_unchecked::<String, _>(idx)?;
            match text.parse::<f64>() {
                Ok(v) => RowValue::Float(v),
                Err(_) => RowValue::Text(text),
            }
        }
        // Zero dates do not decode into chrono types; keep MySQL's textual zero value
        Family::Date => row
            .try_get_unchecked::<NaiveDate, _>(idx)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|_| "0000-00-00".to_string())
            .into(),
        Family::DateTime => row
            .try_get_unchecked::<NaiveDateTime, _>(idx)
            .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|_| ZERO_DATETIME.to_string())
            .into(),
        Family::Timestamp => row
            .try_get_unchecked::<DateTime<Utc>, _>(idx)
            .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|_| ZERO_DATETIME.to_string())
            .into(),
        Family::Time => row
            .try_get_unchecked::<NaiveTime, _>(idx)
            .map(|t| RowValue::Text(t.format("%H:%M:%S").to_string()))
            .or_else(|_| row.try_get_unchecked::<String, _>(idx).map(RowValue::Text))
            .unwrap_or(RowValue::Null),
        Family::Binary => RowValue::from_bytes(row.try_get_unchecked::<Vec<u8>, _>(idx)?),
        Family::Text => match row.try_get_unchecked::<String, _>(idx) {
            Ok(text) => RowValue::Text(text),
            Err(_) => RowValue::from_bytes(row.try_get_unchecked::<Vec<u8>, _>(idx)?),
        },
    };
    Ok(value)
}
