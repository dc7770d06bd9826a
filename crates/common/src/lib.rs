//! SelfHeal Common Library
//!
//! Shared types, error taxonomy, and persistence for the SelfHeal platform.

pub mod blob;
pub mod db;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use blob::BlobStore;
pub use db::{Database, InsertOutcome};
pub use error::{Error, Result};
pub use types::*;

/// SelfHeal version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".selfheal")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
