//! Custom error types for indexsync

use thiserror::Error;

/// Main error type for indexsync operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Site not found: {0}")]
    SiteNotFound(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Invalid SQL: {0}")]
    InvalidSql(String),

    #[error("Index engine error: {0}")]
    IndexEngine(String),

    #[error("Alias error: {0}")]
    AliasProtocol(String),

    #[error("Row decode error: {0}")]
    RowDecode(String),

    #[error("Staging table {0} was not created")]
    TableNotReady(String),

    #[error("Success rate {rate}% is below the {threshold}% threshold, alias left unchanged")]
    SuccessRateBelowThreshold { rate: u32, threshold: u32 },

    #[error("{0} already running")]
    AlreadyRunning(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Result type alias for indexsync
pub type Result<T> = std::result::Result<T, Error>;
