//! The SimpleFS storage engine.
//!
//! Coordinates the codec, blob files, the TTL index, byte accounting and
//! quota reclamation behind the [`Storer`] contract:
//!
//! ```text
//! set:  encode → reclaim → stage blob → commit + index (→ accountant)
//! get:  index → read blob → decode
//! set_multi_level: merge mapping → set(varied) → store mapping record
//! get_multi_level: mapping record → policy election
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::request::Parts;
use http::HeaderMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::accountant::ByteAccountant;
use crate::cache::codec::{Codec, Compression};
use crate::cache::index::{EntryValue, EvictionReason, Expiry, TtlIndex};
use crate::cache::mapping::{
    is_mapping_key, mapping_key, DefaultMappingPolicy, Election, MappingPolicy, Revalidator,
    VariantUpdate,
};
use crate::cache::reclaimer::QuotaReclaimer;
use crate::cache::sweeper::Sweeper;
use crate::config::{DirectorySize, StorageConfig};
use crate::disk::blob::{BlobStore, StoredBlob};
use crate::metrics::StoreMetrics;
use crate::storer::{StoreError, Storer};

/// Backend identifier reported by [`Storer::name`].
pub const STORAGE_NAME: &str = "SIMPLEFS";

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Directory, index and sweeper exist; observers not attached yet.
    Provisioned,
    /// Initialized and accepting writes.
    Serving,
}

/// Disk-backed cache store.
pub struct SimpleFs {
    path: PathBuf,
    size: usize,
    stale: Duration,
    recovered_ttl: Option<Duration>,
    codec: Codec,
    reclaimer: QuotaReclaimer,
    index: Arc<TtlIndex>,
    blobs: Arc<BlobStore>,
    accountant: Arc<ByteAccountant>,
    metrics: Arc<StoreMetrics>,
    policy: Arc<dyn MappingPolicy>,
    lifecycle: Mutex<Lifecycle>,
    /// Serializes read-merge-write of mapping records.
    mapping_lock: Mutex<()>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl SimpleFs {
    /// Create the storage directory, the index and the background sweeper.
    pub fn provision(config: &StorageConfig) -> Result<Self, StoreError> {
        let path = config.resolve_path().map_err(|e| {
            error!(error = %e, "Cannot resolve the storage path");
            StoreError::Path(e)
        })?;

        let blobs = Arc::new(BlobStore::open(&path).inspect_err(|e| {
            error!(path = %path.display(), error = %e, "Cannot create the storage directory");
        })?);
        info!(path = %path.display(), "Created storage directory if needed");

        let index = Arc::new(TtlIndex::new(config.size));
        let sweeper = Sweeper::spawn(index.clone(), config.sweep_interval()).map_err(StoreError::Sweeper)?;

        let accountant = Arc::new(ByteAccountant::new(blobs.clone()));
        let metrics = Arc::new(StoreMetrics::new()?);
        let codec = Codec::new(&config.compression, config.zstd_level);

        info!(
            path = %path.display(),
            size = config.size,
            directory_size = %config.directory_size,
            compression = codec.compression().map(|c| c.as_str()).unwrap_or("unsupported"),
            "SimpleFS storage provisioned"
        );

        Ok(Self {
            path,
            size: config.size,
            stale: config.stale(),
            recovered_ttl: config.recovery_enabled().then(|| config.recovered_ttl()),
            codec,
            reclaimer: QuotaReclaimer::new(config.directory_size),
            index,
            blobs,
            accountant,
            metrics,
            policy: Arc::new(DefaultMappingPolicy),
            lifecycle: Mutex::new(Lifecycle::Provisioned),
            mapping_lock: Mutex::new(()),
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Replace the mapping record format and election rules.
    pub fn with_policy(mut self, policy: Arc<dyn MappingPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    pub fn compression(&self) -> Option<Compression> {
        self.codec.compression()
    }

    pub fn budget(&self) -> DirectorySize {
        self.reclaimer.budget()
    }

    /// Bytes currently accounted on disk.
    pub fn disk_usage(&self) -> u64 {
        self.accountant.total()
    }

    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// Run one expiry sweep now.
    pub fn sweep(&self) -> usize {
        self.index.sweep()
    }

    /// Stop the background sweeper. Expiry then only happens on access.
    pub fn stop_sweeper(&self) {
        if let Some(mut sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
    }

    /// Render metrics with the gauges brought up to date.
    pub fn render_metrics(&self) -> Result<String, StoreError> {
        self.metrics.entries.set(self.index.len() as i64);
        self.metrics
            .bytes_on_disk
            .set(i64::try_from(self.accountant.total()).unwrap_or(i64::MAX));
        Ok(self.metrics.render()?)
    }

    fn ensure_serving(&self) -> Result<(), StoreError> {
        match self.lifecycle() {
            Lifecycle::Serving => Ok(()),
            Lifecycle::Provisioned => Err(StoreError::NotInitialized),
        }
    }

    fn encode(&self, key: &str, value: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.codec.encode(value).map_err(|e| {
            error!(key, error = %e, "Cannot compress data");
            self.metrics.write_failures.inc();
            StoreError::from(e)
        })
    }

    /// Make room for `encoded`, write it as the blob for `key` and index it.
    ///
    /// The commit and the index insert happen under the accountant's files
    /// lock, so a concurrent eviction of `key` cannot delete the new file.
    fn store_blob(&self, key: &str, encoded: &[u8], expiry: Expiry) -> Result<(), StoreError> {
        self.reclaimer
            .reclaim(&self.index, &self.accountant, encoded.len() as u64);

        let written = self.blobs.stage(key, encoded).and_then(|staged| {
            let _files = self.accountant.lock_files();
            let path = self.blobs.commit(staged)?;
            self.index.set(key, EntryValue::File(path), expiry);
            Ok(())
        });
        written.map_err(|e| {
            error!(key, error = %e, "Cannot write file to SimpleFS");
            self.metrics.write_failures.inc();
            StoreError::from(e)
        })
    }

    /// Index blob files left by a previous run, oldest first.
    ///
    /// A file is only adopted when its name is an escaped key and its
    /// content decodes with the configured compressor. Anything else is
    /// counted towards disk usage but never indexed, so it is never deleted.
    fn recover(&self, mut files: Vec<StoredBlob>, ttl: Duration) -> usize {
        files.sort_by_key(|blob| blob.modified);

        let verifiable = matches!(
            self.codec.compression(),
            Some(Compression::Lz4 | Compression::Zstd)
        );
        if !verifiable {
            warn!("Stored files cannot be verified without compression, only counting them");
        }

        let mut recovered = 0;
        let mut foreign = Vec::new();
        for blob in files {
            match self.blobs.key_for(&blob.path) {
                Some(key) if verifiable && !is_mapping_key(&key) && self.owns(&blob) => {
                    debug!(key = %key, size = blob.size, "Recovered entry from disk");
                    self.index.set(&key, EntryValue::File(blob.path), Expiry::After(ttl));
                    recovered += 1;
                }
                _ => foreign.push(blob),
            }
        }

        if !foreign.is_empty() {
            info!(count = foreign.len(), "Files not written by this store are counted but not indexed");
            self.accountant.seed(&foreign);
        }
        recovered
    }

    fn owns(&self, blob: &StoredBlob) -> bool {
        match self.blobs.read(&blob.path) {
            Ok(raw) => self.codec.decode(&raw).is_ok(),
            Err(e) => {
                warn!(path = %blob.path.display(), error = %e, "Cannot read stored file");
                false
            }
        }
    }
}

fn expiry_for(ttl: Duration) -> Expiry {
    if ttl.is_zero() {
        Expiry::NextSweep
    } else {
        Expiry::After(ttl)
    }
}

impl Storer for SimpleFs {
    fn name(&self) -> &str {
        STORAGE_NAME
    }

    fn uuid(&self) -> String {
        format!("{}-{}", self.path.display(), self.size)
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let Some(value) = self.index.get(key) else {
            debug!(key, "Cannot get key from SimpleFS");
            self.metrics.misses.inc();
            return None;
        };

        let path = match value {
            EntryValue::Inline(bytes) => {
                self.metrics.hits.inc();
                return Some(bytes.to_vec());
            }
            EntryValue::File(path) => path,
        };

        let raw = match self.blobs.read(&path) {
            Ok(raw) => raw,
            Err(e) => {
                error!(key, path = %path.display(), error = %e, "Cannot read file from SimpleFS");
                self.metrics.hits.inc();
                return Some(EntryValue::File(path).to_bytes());
            }
        };

        match self.codec.decode(&raw) {
            Ok(data) => {
                self.metrics.hits.inc();
                Some(data)
            }
            Err(e) => {
                error!(key, error = %e, "Cannot decompress data");
                self.metrics.misses.inc();
                None
            }
        }
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.ensure_serving()?;
        if is_mapping_key(key) {
            return Err(StoreError::ReservedKey(key.to_string()));
        }

        let encoded = self.encode(key, value)?;
        self.store_blob(key, &encoded, expiry_for(ttl))
    }

    fn delete(&self, key: &str) {
        self.index.delete(key);
    }

    fn delete_many(&self, pattern: &str) {
        let deleted = self.index.delete_many(pattern);
        debug!(pattern, deleted, "Deleted matching keys");
    }

    fn map_keys(&self, prefix: &str) -> HashMap<String, String> {
        let mut keys = HashMap::new();
        self.index.range(|key, value| {
            if let Some(suffix) = key.strip_prefix(prefix) {
                keys.insert(
                    suffix.to_string(),
                    String::from_utf8_lossy(&value.to_bytes()).into_owned(),
                );
            }
            true
        });
        keys
    }

    fn list_keys(&self) -> Vec<String> {
        self.index.keys()
    }

    fn get_multi_level(&self, key: &str, request: &Parts, validator: &mut Revalidator) -> Election {
        let record_key = mapping_key(key);
        let Some(record) = self.index.get(&record_key) else {
            debug!(key = %record_key, "Cannot get mapping key from SimpleFS");
            self.metrics.misses.inc();
            return Election::default();
        };

        let fetch = |variant: &str| self.get(variant);
        match self.policy.elect(&record.to_bytes(), request, validator, &fetch) {
            Ok(election) => election,
            Err(e) => {
                warn!(key, error = %e, "Mapping election failed");
                Election::default()
            }
        }
    }

    fn set_multi_level(
        &self,
        base_key: &str,
        varied_key: &str,
        value: &[u8],
        varied_headers: &HeaderMap,
        etag: &str,
        ttl: Duration,
        real_key: &str,
    ) -> Result<(), StoreError> {
        self.ensure_serving()?;
        if is_mapping_key(varied_key) {
            return Err(StoreError::ReservedKey(varied_key.to_string()));
        }

        let now = SystemTime::now();
        let encoded = self.encode(varied_key, value)?;

        let _guard = self.mapping_lock.lock();
        let record_key = mapping_key(base_key);
        let current = self.index.get(&record_key).map(|record| record.to_bytes());
        if current.is_none() {
            debug!(key = %record_key, "No mapping yet, starting a new one");
        }

        let merged = self
            .policy
            .update(
                current.as_deref(),
                &VariantUpdate {
                    varied_key,
                    varied_headers,
                    etag,
                    stored_at: now,
                    fresh_until: now + ttl,
                    stale_until: now + ttl + self.stale,
                    real_key,
                },
            )
            .inspect_err(|e| error!(key = %record_key, error = %e, "Cannot update mapping"))?;

        self.store_blob(varied_key, &encoded, expiry_for(ttl))?;

        debug!(key = varied_key, "Store the new mapping for the key in SimpleFS");
        self.index.set(
            &record_key,
            EntryValue::Inline(Bytes::from(merged)),
            Expiry::NextSweep,
        );
        Ok(())
    }

    fn init(&self) -> Result<(), StoreError> {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle == Lifecycle::Serving {
            return Ok(());
        }

        self.accountant.attach(&self.index);
        self.index.subscribe(self.metrics.clone());

        if let Err(e) = self.blobs.remove_temp_files() {
            warn!(error = %e, "Cannot clean up temp files");
        }

        let files = self.blobs.scan()?;
        debug!(files = files.len(), "Regenerating SimpleFS state from files in the directory");
        match self.recovered_ttl {
            Some(ttl) => {
                let recovered = self.recover(files, ttl);
                info!(recovered, total = self.accountant.total(), "Recovered entries from disk");
            }
            None => {
                let total = self.accountant.seed(&files);
                info!(total, "Seeded disk usage from existing files");
            }
        }

        *lifecycle = Lifecycle::Serving;
        Ok(())
    }

    fn reset(&self) -> Result<(), StoreError> {
        let removed = self.index.clear(EvictionReason::Reset);
        info!(removed, total = self.accountant.total(), "SimpleFS storage reset");
        Ok(())
    }
}

impl fmt::Debug for SimpleFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleFs")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("budget", &self.reclaimer.budget())
            .field("compression", &self.codec.compression())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir, compression: &str) -> StorageConfig {
        StorageConfig {
            path: Some(dir.path().to_path_buf()),
            compression: compression.to_string(),
            sweep_interval_ms: 60_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_writes_require_init() {
        let tmp = TempDir::new().unwrap();
        let store = SimpleFs::provision(&config(&tmp, "")).unwrap();
        assert_eq!(store.lifecycle(), Lifecycle::Provisioned);
        assert!(matches!(
            store.set("k", b"v", Duration::from_secs(60)),
            Err(StoreError::NotInitialized)
        ));

        store.init().unwrap();
        assert_eq!(store.lifecycle(), Lifecycle::Serving);
        store.set("k", b"v", Duration::from_secs(60)).unwrap();
        assert_eq!(store.get("k").unwrap(), b"v");
    }

    #[test]
    fn test_name_and_uuid() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp, "");
        cfg.size = 42;
        let store = SimpleFs::provision(&cfg).unwrap();
        assert_eq!(store.name(), "SIMPLEFS");
        assert_eq!(store.uuid(), format!("{}-42", tmp.path().display()));
    }

    #[test]
    fn test_reserved_prefix_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = SimpleFs::provision(&config(&tmp, "")).unwrap();
        store.init().unwrap();
        assert!(matches!(
            store.set("IDX_sneaky", b"v", Duration::from_secs(1)),
            Err(StoreError::ReservedKey(_))
        ));
    }

    #[test]
    fn test_unsupported_compression_fails_write() {
        let tmp = TempDir::new().unwrap();
        let store = SimpleFs::provision(&config(&tmp, "brotli")).unwrap();
        store.init().unwrap();

        assert!(matches!(
            store.set("k", b"v", Duration::from_secs(60)),
            Err(StoreError::Codec(_))
        ));
        assert!(store.get("k").is_none());
        assert_eq!(store.disk_usage(), 0);
        assert_eq!(store.metrics().write_failures.get(), 1);
    }

    #[test]
    fn test_read_failure_falls_back_to_stored_path() {
        let tmp = TempDir::new().unwrap();
        let store = SimpleFs::provision(&config(&tmp, "none")).unwrap();
        store.init().unwrap();

        store.set("k", b"payload", Duration::from_secs(60)).unwrap();
        let path = store.blobs.path_for("k").unwrap();
        std::fs::remove_file(&path).unwrap();

        let value = store.get("k").unwrap();
        assert_eq!(value, path.to_string_lossy().as_bytes());
    }

    #[test]
    fn test_zero_ttl_lives_until_sweep() {
        let tmp = TempDir::new().unwrap();
        let store = SimpleFs::provision(&config(&tmp, "")).unwrap();
        store.init().unwrap();

        store.set("k", b"v", Duration::ZERO).unwrap();
        assert!(store.get("k").is_some());
        assert_eq!(store.sweep(), 1);
        assert!(store.get("k").is_none());
        assert_eq!(store.disk_usage(), 0);
    }

    #[test]
    fn test_recovery_adopts_only_decodable_blobs() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp, "zstd");
        cfg.recover_on_init = true;
        {
            let store = SimpleFs::provision(&cfg).unwrap();
            store.init().unwrap();
            store.set("ours", b"payload", Duration::from_secs(60)).unwrap();
        }
        std::fs::write(tmp.path().join("theirs"), b"plain text").unwrap();

        let store = SimpleFs::provision(&cfg).unwrap();
        store.init().unwrap();
        assert_eq!(store.list_keys(), vec!["ours".to_string()]);
        assert_eq!(store.get("ours").unwrap(), b"payload");

        store.reset().unwrap();
        assert!(tmp.path().join("theirs").exists());
        assert!(!tmp.path().join("ours").exists());
        assert_eq!(store.disk_usage(), 10);
    }
}
