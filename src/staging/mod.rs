//! Local staging store
//!
//! One SQLite file per site (`storage/<site>.db`), rebuilt table by table on
//! every import. The file is disposable, so durability is relaxed: WAL
//! journal and `synchronous=OFF`. Writers share one pool and rely on
//! SQLite's own locking plus a generous busy timeout.

use crate::error::Result;
use crate::models::{RowBatch, RowRecord, RowValue};
use crate::source::sqlite::fetch_rows;
use futures::stream::BoxStream;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Sqlite};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Quote an identifier for SQLite
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub struct StagingStore {
    pool: SqlitePool,
}

impl StagingStore {
    /// Open (creating if needed) the staging database at `path`
    pub async fn open(path: &Path, max_connections: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Off)
            .busy_timeout(Duration::from_secs(60));

        debug!("Opening staging store at {:?}", path);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(2))
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Drop `table` and create it again from `create_sql`
    pub async fn recreate_table(&self, table: &str, create_sql: &str) -> Result<()> {
        let drop_sql = format!("DROP TABLE IF EXISTS {}", quote_ident(table));
        sqlx::query(&drop_sql).execute(&self.pool).await?;
        sqlx::query(create_sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Multi-row parameterized INSERT of a whole batch. Returns rows written.
    pub async fn insert_batch(&self, batch: &RowBatch) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let columns = batch
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            quote_ident(&batch.table),
            columns
        ));
        builder.push_values(batch.rows.iter(), |mut row_builder, row| {
            for value in row {
                match value {
                    RowValue::Null => {
                        row_builder.push_bind(None::<String>);
                    }
                    RowValue::Integer(v) => {
                        row_builder.push_bind(*v);
                    }
                    RowValue::Float(v) => {
                        row_builder.push_bind(*v);
                    }
                    RowValue::Text(s) => {
                        row_builder.push_bind(s.clone());
                    }
                    RowValue::Binary(b) => {
                        row_builder.push_bind(b.clone());
                    }
                }
            }
        });

        let result = builder.build().persistent(false).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Run one or more statements, discarding results
    pub async fn execute_script(&self, sql: &str) -> Result<()> {
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Stream the rows of a query
    pub fn fetch<'a>(&'a self, sql: &'a str) -> BoxStream<'a, Result<RowRecord>> {
        fetch_rows(&self.pool, sql)
    }

    pub async fn count_rows(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Reclaim space left by dropped tables
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// Fold the WAL back into the main file and truncate it
    pub async fn checkpoint(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Checkpoint (best effort) and close the pool
    pub async fn close(&self) {
        match self.checkpoint().await {
            Ok(()) => info!("staging checkpoint done"),
            Err(e) => warn!("staging checkpoint failed: {}", e),
        }
        self.pool.close().await;
    }
}
