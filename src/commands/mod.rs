//! CLI commands implementation

pub mod clean;
pub mod sync;

pub use clean::*;
pub use sync::*;
