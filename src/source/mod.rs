//! Source databases that extraction templates run against.
//!
//! A site has one default data source; templates may name another with a
//! `-- ds=<name>` directive, which the [`SourceResolver`] opens on demand.

#[cfg(feature = "mysql")]
pub mod mysql;
pub mod sqlite;

#[cfg(feature = "mysql")]
pub use mysql::MySqlSource;
pub use sqlite::SqliteSource;

use crate::config::{DataSourceConfig, PathsConfig};
use crate::error::{Error, Result};
use crate::models::{ColumnMeta, RowRecord, RowValue};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use tracing::info;

/// A queryable source database
#[async_trait]
pub trait SourceDb: Send + Sync {
    /// Data source name, for logging
    fn name(&self) -> &str;

    /// Run a statement whose result is discarded (session setup, DDL, ...)
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Column names, declared types and nullability of a query's result set
    async fn describe(&self, sql: &str) -> Result<Vec<ColumnMeta>>;

    /// Stream the rows of a query. Undecodable values surface as
    /// [`Error::RowDecode`] items; the stream continues after them.
    fn fetch<'a>(&'a self, sql: &'a str) -> BoxStream<'a, Result<RowRecord>>;

    /// Close the underlying pool
    async fn close(&self);

    /// Run a `SELECT MIN(k), MAX(k) ...` query. `None` when the table is
    /// empty or the bounds are not numeric.
    async fn key_range(&self, sql: &str) -> Result<Option<(i64, i64)>> {
        let mut rows = self.fetch(sql);
        let row = match rows.next().await {
            Some(row) => row?,
            None => return Ok(None),
        };
        let bound = |i: usize| row.values.get(i).and_then(key_bound);
        Ok(bound(0).zip(bound(1)))
    }
}

fn key_bound(value: &RowValue) -> Option<i64> {
    match value {
        RowValue::Integer(v) => Some(*v),
        RowValue::Float(v) => Some(*v as i64),
        RowValue::Text(s) => s.trim().parse().ok(),
        RowValue::Null | RowValue::Binary(_) => None,
    }
}

/// Opens data sources by name
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn SourceDb>>;
}

/// Resolves names against `etc/datasources/<name>.toml`
pub struct ConfigResolver {
    paths: PathsConfig,
    max_connections: u32,
}

impl ConfigResolver {
    pub fn new(paths: PathsConfig, max_connections: u32) -> Self {
        Self {
            paths,
            max_connections,
        }
    }
}

#[async_trait]
impl SourceResolver for ConfigResolver {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn SourceDb>> {
        let config = DataSourceConfig::load(&self.paths, name)?;
        connect(name, &config, &self.paths, self.max_connections).await
    }
}

/// Connect to a configured data source
pub async fn connect(
    name: &str,
    config: &DataSourceConfig,
    paths: &PathsConfig,
    max_connections: u32,
) -> Result<Arc<dyn SourceDb>> {
    info!(data_source = name, driver = %config.driver, "Connecting to data source");
    match config.driver.to_lowercase().as_str() {
        "sqlite" => {
            let path = config.path.as_ref().ok_or_else(|| {
                Error::Config(format!("data source {}: sqlite requires path", name))
            })?;
            let path = if path.is_relative() {
                paths.base_dir.join(path)
            } else {
                path.clone()
            };
            let source =
                SqliteSource::connect(name, &path, &config.init_sql, max_connections).await?;
            Ok(Arc::new(source))
        }
        #[cfg(feature = "mysql")]
        "mysql" => {
            let source = MySqlSource::connect(name, config, max_connections).await?;
            Ok(Arc::new(source))
        }
        #[cfg(not(feature = "mysql"))]
        "mysql" => Err(Error::Config(format!(
            "data source {}: built without mysql support",
            name
        ))),
        other => Err(Error::Config(format!(
            "data source {}: unsupported driver '{}'",
            name, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    #[test]
    fn test_key_bound() {
        assert_eq!(key_bound(&RowValue::Integer(5)), Some(5));
        assert_eq!(key_bound(&RowValue::Text(" 12 ".to_string())), Some(12));
        assert_eq!(key_bound(&RowValue::Text("abc".to_string())), None);
        assert_eq!(key_bound(&RowValue::Null), None);
    }

    #[tokio::test]
    async fn test_config_resolver_opens_sqlite() {
        let tmp = TempDir::new().unwrap();
        let config = Config::default().with_base_dir(tmp.path());
        let dir = config.paths.etc_dir.join("datasources");
        std::fs::create_dir_all(&dir).unwrap();

        let db_path = tmp.path().join("external.db");
        let seed = SqliteSource::create(&db_path).await.unwrap();
        seed.execute("CREATE TABLE t (id INTEGER)").await.unwrap();
        seed.close().await;

        std::fs::write(
            dir.join("external.toml"),
            "driver = \"sqlite\"\npath = \"external.db\"\n",
        )
        .unwrap();

        let resolver = ConfigResolver::new(config.paths.clone(), 2);
        let source = resolver.resolve("external").await.unwrap();
        assert_eq!(source.name(), "external");
        assert_eq!(source.key_range("SELECT MIN(id), MAX(id) FROM t").await.unwrap(), None);
        source.close().await;

        assert!(resolver.resolve("missing").await.is_err());
    }
}
