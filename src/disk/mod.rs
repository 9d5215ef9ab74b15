//! On-disk blob files.

pub mod blob;
