//! Meshplane Common Library
//!
//! Shared types, storage, and exit-node plumbing for the Meshplane control plane.

pub mod db;
pub mod error;
pub mod peers;
pub mod types;
pub mod wgkey;

// Re-export commonly used types
pub use db::{Database, NewClient, NewSite, TargetUpdate};
pub use error::{Error, Result};
pub use peers::{HttpPeerTable, PeerTable};
pub use types::*;

/// Meshplane version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".meshplane")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
