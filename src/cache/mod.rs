//! Disk-backed cache storage.
//!
//! - [`codec`]: lz4/zstd/none payload compression
//! - [`index`]: TTL + capacity index with eviction notifications
//! - [`sweeper`]: background expiry thread
//! - [`accountant`]: on-disk byte accounting and file cleanup
//! - [`reclaimer`]: directory quota enforcement
//! - [`mapping`]: multi-level (Vary) mapping records and election
//! - [`store`]: the SimpleFS engine tying the above together

pub mod accountant;
pub mod codec;
pub mod index;
pub mod mapping;
pub mod reclaimer;
pub mod store;
pub mod sweeper;
