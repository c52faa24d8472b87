//! Row, task and outcome types shared by the import and export pipelines.

use serde::Serialize;
use serde_json::{Number, Value};
use std::sync::Arc;

/// A dynamically typed scalar read from a source or staging row
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Binary(Vec<u8>),
}

impl RowValue {
    /// Binary payloads that are valid UTF-8 become text; everything else is kept
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => RowValue::Text(text),
            Err(e) => RowValue::Binary(e.into_bytes()),
        }
    }

    /// JSON representation used in index documents
    pub fn to_json(&self) -> Value {
        match self {
            RowValue::Null => Value::Null,
            RowValue::Integer(v) => Value::from(*v),
            RowValue::Float(v) => Number::from_f64(*v).map(Value::Number).unwrap_or(Value::Null),
            RowValue::Text(s) => Value::String(s.clone()),
            RowValue::Binary(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
        }
    }
}

impl From<i64> for RowValue {
    fn from(v: i64) -> Self {
        RowValue::Integer(v)
    }
}

impl From<f64> for RowValue {
    fn from(v: f64) -> Self {
        RowValue::Float(v)
    }
}

impl From<&str> for RowValue {
    fn from(v: &str) -> Self {
        RowValue::Text(v.to_string())
    }
}

impl From<String> for RowValue {
    fn from(v: String) -> Self {
        RowValue::Text(v)
    }
}

impl<T: Into<RowValue>> From<Option<T>> for RowValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(RowValue::Null)
    }
}

/// One source row: column names shared across the result set, values in order
#[derive(Debug, Clone)]
pub struct RowRecord {
    pub columns: Arc<[String]>,
    pub values: Vec<RowValue>,
}

impl RowRecord {
    pub fn new(columns: Arc<[String]>, values: Vec<RowValue>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, name: &str) -> Option<&RowValue> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|i| self.values.get(i))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Convert into a JSON object keyed by column name
    pub fn into_document(self) -> serde_json::Map<String, Value> {
        self.columns
            .iter()
            .zip(self.values.iter())
            .map(|(c, v)| (c.clone(), v.to_json()))
            .collect()
    }
}

/// One unit of extraction work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlTask {
    pub statement: String,
    pub table: String,
    /// The chunk responsible for (re)creating the destination table
    pub is_first_chunk: bool,
}

/// Rows accumulated for one staging table
#[derive(Debug, Clone)]
pub struct RowBatch {
    pub table: String,
    pub columns: Arc<[String]>,
    pub rows: Vec<Vec<RowValue>>,
}

impl RowBatch {
    pub fn new(table: impl Into<String>, columns: Arc<[String]>) -> Self {
        Self {
            table: table.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, values: Vec<RowValue>) {
        self.rows.push(values);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Take the accumulated rows, leaving the batch empty for reuse
    pub fn take(&mut self) -> RowBatch {
        RowBatch {
            table: self.table.clone(),
            columns: Arc::clone(&self.columns),
            rows: std::mem::take(&mut self.rows),
        }
    }
}

/// A document ready for bulk submission
#[derive(Debug, Clone)]
pub struct BulkItem {
    pub document_id: Option<String>,
    /// Serialized JSON body without trailing newline
    pub body: String,
}

/// Column metadata reported by a source query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub type_name: String,
    /// `None` when the driver cannot tell
    pub nullable: Option<bool>,
}

/// Bulk indexing tallies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub success: u64,
    pub failure: u64,
}

impl SyncOutcome {
    pub fn new(success: u64, failure: u64) -> Self {
        Self { success, failure }
    }

    /// Integer-truncated success percentage; zero when nothing was submitted
    pub fn success_rate(&self) -> u32 {
        let total = self.success + self.failure;
        if total == 0 {
            return 0;
        }
        (self.success * 100 / total) as u32
    }
}
