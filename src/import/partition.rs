//! Primary-key range partitioning of extraction queries

use crate::error::{Error, Result};
use crate::models::SqlTask;
use crate::source::SourceDb;
use crate::sql::{find_keyword, skip_comments, strip_trailing_comments, trim_statement_end};
use tracing::{debug, info};

/// Clauses that must stay after the injected range predicate
const TAIL_CLAUSES: [&str; 4] = ["GROUP", "HAVING", "ORDER", "LIMIT"];

/// Splits one SELECT into key-range chunks
#[derive(Debug, Clone, Copy)]
pub struct Partitioner {
    window: i64,
    small_range: i64,
}

/// A SELECT cut at its structural positions
struct SelectParts<'a> {
    /// Everything before the tail clauses
    head: &'a str,
    /// Offset of the main SELECT within `head`, after any WITH clause
    select: usize,
    /// `GROUP BY ...`, `ORDER BY ...` or `LIMIT ...` onwards, possibly empty
    tail: &'a str,
    /// Offset of the top-level FROM within `head`
    from: usize,
    has_where: bool,
}

impl<'a> SelectParts<'a> {
    fn parse(select: &'a str) -> Result<Self> {
        let body = trim_statement_end(skip_comments(select));
        let select_at = find_keyword(body, "SELECT")
            .ok_or_else(|| Error::InvalidSql("statement is not a SELECT".to_string()))?;
        let from = find_keyword(&body[select_at..], "FROM")
            .map(|pos| select_at + pos)
            .ok_or_else(|| Error::InvalidSql("SELECT has no FROM clause".to_string()))?;

        let after_from = &body[from..];
        let tail_at = TAIL_CLAUSES
            .iter()
            .filter_map(|kw| find_keyword(after_from, kw))
            .min()
            .map(|pos| from + pos)
            .unwrap_or(body.len());

        let head = strip_trailing_comments(&body[..tail_at]);
        Ok(Self {
            head,
            select: select_at,
            tail: body[tail_at..].trim(),
            from,
            has_where: find_keyword(&body[from..tail_at], "WHERE").is_some(),
        })
    }

    fn with_range(&self, key: &str, lo: i64, hi: i64) -> String {
        let mut sql = self.head.to_string();
        if !self.has_where {
            sql.push_str(" WHERE 1=1");
        }
        sql.push_str(&format!(" AND {} BETWEEN {} AND {}", key, lo, hi));
        if !self.tail.is_empty() {
            sql.push(' ');
            sql.push_str(self.tail);
        }
        sql
    }
}

impl Partitioner {
    pub fn new(window: i64, small_range: i64) -> Self {
        Self {
            window: window.max(1),
            small_range,
        }
    }

    /// `SELECT MIN(key), MAX(key) FROM ...` over the template's FROM/WHERE
    pub fn key_range_sql(select: &str, key: &str) -> Result<String> {
        let parts = SelectParts::parse(select)?;
        Ok(format!(
            "{}SELECT MIN({key}) AS min_id, MAX({key}) AS max_id {}",
            &parts.head[..parts.select],
            &parts.head[parts.from..]
        ))
    }

    /// Split a SELECT over a known key range. Small or unknown ranges yield a
    /// single unmodified task.
    pub fn split(
        &self,
        select: &str,
        key: &str,
        table: &str,
        range: Option<(i64, i64)>,
    ) -> Result<Vec<SqlTask>> {
        let whole = || {
            vec![SqlTask {
                statement: select.to_string(),
                table: table.to_string(),
                is_first_chunk: true,
            }]
        };

        let (min, max) = match range {
            Some((min, max)) if max >= min => (min, max),
            _ => return Ok(whole()),
        };
        if (max as i128 - min as i128) < self.small_range as i128 {
            return Ok(whole());
        }

        let parts = SelectParts::parse(select)?;
        let mut tasks = Vec::new();
        let mut lo = min;
        loop {
            let hi = lo.saturating_add(self.window - 1).min(max);
            tasks.push(SqlTask {
                statement: parts.with_range(key, lo, hi),
                table: table.to_string(),
                is_first_chunk: lo == min,
            });
            if hi >= max {
                break;
            }
            lo = hi + 1;
        }
        Ok(tasks)
    }

    /// Look up the key range on `source`, then split
    pub async fn plan(
        &self,
        source: &dyn SourceDb,
        select: &str,
        key: &str,
        table: &str,
    ) -> Result<Vec<SqlTask>> {
        let range_sql = Self::key_range_sql(select, key)?;
        debug!("key range sql: {}", range_sql);
        let range = source.key_range(&range_sql).await?;
        match range {
            Some((min, max)) => info!(table, key, min, max, "key range"),
            None => info!(table, key, "can not get min max key value"),
        }
        self.split(select, key, table, range)
    }
}
