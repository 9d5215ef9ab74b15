//! simplefs-cache: a disk-backed HTTP cache store.
//!
//! Entries are compressed blob files in one directory, indexed in memory
//! with per-entry TTLs, an optional entry-count limit and an optional
//! byte quota on the directory. Multi-level entries store several
//! variants of one resource, selected by the request's `Vary` headers.

pub mod cache;
pub mod config;
pub mod disk;
pub mod metrics;
pub mod server;
pub mod storer;

pub use cache::mapping::{Election, Revalidator};
pub use cache::store::SimpleFs;
pub use config::{Config, StorageConfig};
pub use storer::{StoreError, Storer};
