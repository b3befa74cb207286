//! SDX controller basic library
//!
//! Infrastructure shared by the rule manager and its tools:
//! - SQLite client
//! - logging bootstrap

pub mod logging;

#[cfg(feature = "sqlite")]
pub mod sqlite;

// Re-export common dependencies
pub use anyhow;
pub use tokio;
