//! indexsync - keep a search index in step with a relational database
//!
//! This crate provides:
//! - Range-partitioned extraction of SQL templates into a per-site SQLite staging store
//! - Document export from the staging store into a fresh, timestamped index
//! - Atomic alias cut-over gated on the bulk indexing success rate
//! - Cleanup of indices no alias points at

pub mod commands;
pub mod config;
pub mod error;
pub mod export;
pub mod import;
pub mod models;
pub mod progress;
pub mod source;
pub mod sql;
pub mod staging;
pub mod transform;

pub use config::Config;
pub use error::{Error, Result};
