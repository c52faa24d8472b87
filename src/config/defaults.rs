//! Default values for configuration

/// Default host substituted for `{host}` in index templates
pub fn default_app_host() -> String {
    std::env::var("INDEXSYNC_APP_HOST").unwrap_or_else(|_| "http://127.0.0.1:8888".to_string())
}

/// Default base directory holding `etc/` and `storage/`
pub fn default_base_dir() -> String {
    ".".to_string()
}

/// Minimum success rate (percent) required before the alias is swapped
pub fn default_success_threshold() -> u32 {
    80
}

/// Rows per staging INSERT. SQLite rejects statements with too many
/// bound variables, so keep this modest for wide tables.
pub fn default_import_batch_size() -> usize {
    200
}

/// Worker count; 0 means one per logical CPU
pub fn default_workers() -> usize {
    0
}

/// Number of primary keys covered by one extraction chunk
pub fn default_window_size() -> i64 {
    1000
}

/// Key spans below this are read with a single unpartitioned query
pub fn default_small_range() -> i64 {
    10_000
}

/// Flush a bulk buffer once it holds this many bytes (5MB)
pub fn default_flush_bytes() -> usize {
    5 * 1000 * 1000
}

/// Flush a bulk buffer once it holds this many documents
pub fn default_flush_items() -> usize {
    200
}

/// Retries for transient index engine responses (429/502/503/504)
pub fn default_max_retries() -> usize {
    3
}

/// Index engine request timeout in seconds
pub fn default_timeout_secs() -> u64 {
    60
}

/// Source database port
pub fn default_port() -> u16 {
    3306
}

/// Source database driver
pub fn default_driver() -> String {
    "mysql".to_string()
}

/// Document id field
pub fn default_doc_id_key() -> String {
    "id".to_string()
}
