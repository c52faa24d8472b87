//! SQL template preprocessing
//!
//! Templates are plain SQL files with a few conventions: the file stem names
//! the staging table, `-- key=<col>` and `-- ds=<name>` comment lines carry
//! directives, and `{lang}` is replaced with the site locale. Nothing here is
//! a SQL parser; scanning is limited to comments, quotes and parentheses.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Default primary key used for range partitioning
pub const DEFAULT_KEY: &str = "id";

/// Out-of-band instructions embedded in a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directives {
    pub key: String,
    pub data_source: Option<String>,
}

impl Default for Directives {
    fn default() -> Self {
        Self {
            key: DEFAULT_KEY.to_string(),
            data_source: None,
        }
    }
}

impl Directives {
    pub fn parse(sql: &str) -> Self {
        let mut directives = Directives::default();
        for line in sql.lines() {
            let line = line.trim();
            if let Some(key) = line.strip_prefix("-- key=") {
                let key = key.trim();
                if !key.is_empty() {
                    directives.key = key.to_string();
                }
            } else if let Some(ds) = line.strip_prefix("-- ds=") {
                let ds = ds.trim();
                if !ds.is_empty() {
                    directives.data_source = Some(ds.to_string());
                }
            }
        }
        directives
    }
}

/// Remove leading `--` / `#` lines and `/* */` blocks
pub fn skip_comments(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        rest = rest.trim_start();
        if rest.starts_with("--") || rest.starts_with('#') {
            rest = match rest.find('\n') {
                Some(pos) => &rest[pos + 1..],
                None => "",
            };
        } else if rest.starts_with("/*") {
            rest = match rest.find("*/") {
                Some(pos) => &rest[pos + 2..],
                None => "",
            };
        } else {
            return rest;
        }
    }
}

/// Remove leading comments and one leading `WITH` clause, leaving the first
/// keyword of the main statement in front
pub fn strip_leading_comments(sql: &str) -> &str {
    let rest = skip_comments(sql);
    if starts_with_keyword(rest, "WITH") {
        skip_comments(strip_with_clause(rest))
    } else {
        rest
    }
}

/// Skip a common table expression prefix, returning the main statement
fn strip_with_clause(sql: &str) -> &str {
    let body = &sql[4..];
    match find_keyword(body, "SELECT") {
        Some(pos) => &body[pos..],
        None => sql,
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn starts_with_keyword(sql: &str, keyword: &str) -> bool {
    let bytes = sql.as_bytes();
    bytes.len() >= keyword.len()
        && bytes[..keyword.len()].eq_ignore_ascii_case(keyword.as_bytes())
        && bytes.get(keyword.len()).map_or(true, |b| !is_word_byte(*b))
}

/// Whether the statement's first keyword is SELECT
pub fn is_select(sql: &str) -> bool {
    starts_with_keyword(strip_leading_comments(sql), "SELECT")
}

/// A span that keyword and separator scans step over as a whole
enum Skip {
    /// Quoted string or identifier; ends after the closing quote
    Quoted(usize),
    /// `--` or `#` line comment, or `/* */` block; ends after the comment
    Comment(usize),
}

impl Skip {
    fn end(&self) -> usize {
        match self {
            Skip::Quoted(end) | Skip::Comment(end) => *end,
        }
    }
}

fn skip_at(bytes: &[u8], i: usize) -> Option<Skip> {
    match bytes[i] {
        quote @ (b'\'' | b'"' | b'`') => {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j] != quote {
                if bytes[j] == b'\\' {
                    j += 1;
                }
                j += 1;
            }
            Some(Skip::Quoted((j + 1).min(bytes.len())))
        }
        b'-' if bytes.get(i + 1) == Some(&b'-') => Some(Skip::Comment(line_end(bytes, i))),
        b'#' => Some(Skip::Comment(line_end(bytes, i))),
        b'/' if bytes.get(i + 1) == Some(&b'*') => {
            let end = bytes[i + 2..]
                .windows(2)
                .position(|w| w == b"*/")
                .map_or(bytes.len(), |pos| i + 2 + pos + 2);
            Some(Skip::Comment(end))
        }
        _ => None,
    }
}

fn line_end(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|b| *b == b'\n')
        .map_or(bytes.len(), |pos| from + pos)
}

/// Case-insensitive keyword search at parenthesis depth zero, outside quotes
/// and comments. Returns the byte offset of the match.
pub fn find_keyword(sql: &str, keyword: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let kw = keyword.as_bytes();
    let mut depth: i32 = 0;
    let mut i = 0;

    while i < bytes.len() {
        if let Some(skip) = skip_at(bytes, i) {
            i = skip.end();
            continue;
        }
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ if depth == 0
                && bytes.len() - i >= kw.len()
                && bytes[i..i + kw.len()].eq_ignore_ascii_case(kw)
                && (i == 0 || !is_word_byte(bytes[i - 1]))
                && bytes.get(i + kw.len()).map_or(true, |b| !is_word_byte(*b)) =>
            {
                return Some(i);
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Drop comments and whitespace after the last token, so text appended to
/// the result is never swallowed by a trailing line comment
pub fn strip_trailing_comments(sql: &str) -> &str {
    let bytes = sql.as_bytes();
    let mut end = 0;
    let mut i = 0;
    while i < bytes.len() {
        match skip_at(bytes, i) {
            Some(Skip::Quoted(next)) => {
                end = next;
                i = next;
            }
            Some(Skip::Comment(next)) => i = next,
            None => {
                if !bytes[i].is_ascii_whitespace() {
                    end = i + 1;
                }
                i += 1;
            }
        }
    }
    &sql[..end]
}

/// Statement text without trailing comments, whitespace or `;`
pub fn trim_statement_end(sql: &str) -> &str {
    let mut body = sql;
    loop {
        let trimmed = strip_trailing_comments(body).trim_end_matches(';');
        if trimmed.len() == body.len() {
            return trimmed;
        }
        body = trimmed;
    }
}

/// Split a template into statements on `;`, ignoring separators inside
/// quotes and comments. Segments that are empty or hold only comments are
/// dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if let Some(skip) = skip_at(bytes, i) {
            i = skip.end();
            continue;
        }
        if bytes[i] == b';' {
            push_statement(&mut statements, &sql[start..i]);
            start = i + 1;
        }
        i += 1;
    }
    if start < sql.len() {
        push_statement(&mut statements, &sql[start..]);
    }
    statements
}

fn push_statement(statements: &mut Vec<String>, segment: &str) {
    if !strip_leading_comments(segment).trim().is_empty() {
        statements.push(segment.trim().to_string());
    }
}

pub fn substitute_lang(sql: &str, lang: &str) -> String {
    if sql.contains("{lang}") {
        sql.replace("{lang}", lang)
    } else {
        sql.to_string()
    }
}

/// Append `LIMIT n` to a plain SELECT that has none. A zero limit is a no-op.
pub fn apply_row_limit(sql: &str, limit: u64) -> String {
    if limit == 0 || !is_select(sql) {
        return sql.to_string();
    }
    let stripped = strip_leading_comments(sql);
    if find_keyword(stripped, "LIMIT").is_some() {
        return sql.to_string();
    }
    format!("{} LIMIT {}", trim_statement_end(sql), limit)
}

/// Staging table name derived from a template path: the file name up to its
/// first dot
pub fn table_name_for(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Template(format!("invalid template path {}", path.display())))?;
    let table = name.split('.').next().unwrap_or(name);
    if table.is_empty() || !table.bytes().all(is_word_byte) {
        return Err(Error::Template(format!(
            "template {} does not name a valid table",
            path.display()
        )));
    }
    Ok(table.to_string())
}

/// All `.sql` files below `dir`, sorted by path
pub fn scan_sql_files(dir: &Path) -> Result<Vec<PathBuf>> {
    debug!("scan dir: {}", dir.display());
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Error accessing path under {}: {}", dir.display(), e);
                continue;
            }
        };
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|ext| ext == "sql") {
            debug!("Found file: {}", path.display());
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}
