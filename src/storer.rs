//! The storage-provider contract consumed by HTTP caching middleware.

use std::collections::HashMap;
use std::time::Duration;

use http::request::Parts;
use http::HeaderMap;
use thiserror::Error;

use crate::cache::codec::CodecError;
use crate::cache::mapping::{Election, MappingError, Revalidator};
use crate::disk::blob::BlobError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store is not initialized")]
    NotInitialized,

    #[error("Key {0:?} uses the reserved mapping prefix")]
    ReservedKey(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("Cannot start background sweeper: {0}")]
    Sweeper(#[source] std::io::Error),

    #[error("Cannot resolve storage directory: {0}")]
    Path(#[source] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// A cache storage backend.
pub trait Storer: Send + Sync {
    /// Fixed identifier of the backend kind.
    fn name(&self) -> &str;

    /// Instance identity.
    fn uuid(&self) -> String;

    fn get(&self, key: &str) -> Option<Vec<u8>>;

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    fn delete(&self, key: &str);

    /// Delete every key matching a regular expression. Invalid patterns are ignored.
    fn delete_many(&self, pattern: &str);

    /// Entries whose key starts with `prefix`, keyed by the remaining suffix.
    fn map_keys(&self, prefix: &str) -> HashMap<String, String>;

    fn list_keys(&self) -> Vec<String>;

    /// Elect a fresh and/or stale variant of `key` for `request`.
    fn get_multi_level(&self, key: &str, request: &Parts, validator: &mut Revalidator) -> Election;

    /// Store one variant of `base_key` and merge it into the mapping record.
    #[allow(clippy::too_many_arguments)]
    fn set_multi_level(
        &self,
        base_key: &str,
        varied_key: &str,
        value: &[u8],
        varied_headers: &HeaderMap,
        etag: &str,
        ttl: Duration,
        real_key: &str,
    ) -> Result<(), StoreError>;

    fn init(&self) -> Result<(), StoreError>;

    fn reset(&self) -> Result<(), StoreError>;
}
