//! Wirevend Common Library
//!
//! Shared types, errors, key material handling, and state storage for the
//! wirevend key vending service.

pub mod db;
pub mod error;
pub mod keygen;
pub mod types;

// Re-export commonly used types
pub use db::Database;
pub use error::{Error, Result};
pub use keygen::WgKeyPair;
pub use types::*;

/// Wirevend version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".wirevend")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
