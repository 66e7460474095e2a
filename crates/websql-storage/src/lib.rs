//! WebSQL Storage Layer
//!
//! The tracker's catalog lives in a single SQLite file next to the per-origin
//! database directories. This crate owns that catalog connection and the
//! file-level helpers used to create, truncate and remove database files.

mod catalog;
mod error;
pub mod fs;
mod migrations;

pub use catalog::{table_exists, CatalogStore};
pub use error::StorageError;

pub type Result<T> = std::result::Result<T, StorageError>;
