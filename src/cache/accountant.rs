//! Running total of bytes held on disk.
//!
//! The accountant subscribes to the index: insertions of blob-backed entries
//! add the file's size, evictions subtract the size recorded at insertion and
//! delete the file. Mapping records are inert. All size mutations go through
//! one mutex, and the total is only readable from outside.
//!
//! Writers hold [`ByteAccountant::lock_files`] while moving a blob into place
//! and indexing it. Evictions delete under the same lock and keep the file
//! when its key was indexed again in the meantime, so a file and its live
//! entry never come apart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, error};

use crate::cache::index::{EntryValue, EvictionReason, IndexObserver, TtlIndex};
use crate::cache::mapping::is_mapping_key;
use crate::disk::blob::{BlobStore, StoredBlob};

#[derive(Debug, Default)]
struct Ledger {
    total: u64,
    /// Size accounted for each tracked file.
    files: HashMap<PathBuf, u64>,
}

impl Ledger {
    fn record(&mut self, path: &Path, size: u64) -> u64 {
        let previous = self.files.insert(path.to_path_buf(), size).unwrap_or(0);
        self.total = self.total.saturating_sub(previous) + size;
        self.total
    }

    fn release(&mut self, path: &Path) -> Option<u64> {
        let size = self.files.remove(path)?;
        self.total = self.total.saturating_sub(size);
        Some(size)
    }
}

/// Tracks on-disk bytes and deletes files of evicted entries.
#[derive(Debug)]
pub struct ByteAccountant {
    ledger: Mutex<Ledger>,
    blobs: Arc<BlobStore>,
    /// Serializes blob commits against evicted-file deletion.
    files: ReentrantMutex<()>,
    index: OnceLock<Weak<TtlIndex>>,
}

impl ByteAccountant {
    pub fn new(blobs: Arc<BlobStore>) -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            blobs,
            files: ReentrantMutex::new(()),
            index: OnceLock::new(),
        }
    }

    /// Subscribe to `index`. Later calls are ignored.
    pub fn attach(self: &Arc<Self>, index: &Arc<TtlIndex>) {
        if self.index.set(Arc::downgrade(index)).is_ok() {
            index.subscribe(self.clone());
        }
    }

    /// Hold while committing a blob and indexing it.
    pub fn lock_files(&self) -> ReentrantMutexGuard<'_, ()> {
        self.files.lock()
    }

    /// Bytes currently accounted on disk.
    pub fn total(&self) -> u64 {
        self.ledger.lock().total
    }

    /// Number of files being tracked.
    pub fn tracked_files(&self) -> usize {
        self.ledger.lock().files.len()
    }

    /// Account for files that already exist on disk at startup.
    pub fn seed(&self, blobs: &[StoredBlob]) -> u64 {
        let mut ledger = self.ledger.lock();
        for blob in blobs {
            ledger.record(&blob.path, blob.size);
            debug!(
                path = %blob.path.display(),
                size = blob.size,
                total = ledger.total,
                "Seeded size from existing file"
            );
        }
        ledger.total
    }

    fn record_file(&self, key: &str, path: &Path) {
        let size = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                error!(key, path = %path.display(), error = %e, "Cannot stat inserted file");
                return;
            }
        };

        let total = self.ledger.lock().record(path, size);
        debug!(key, size, total, "Actual size increased");
    }

    fn release_file(&self, reason: EvictionReason, key: &str, value: &EntryValue, path: &Path) {
        let _files = self.files.lock();

        let reindexed = self
            .index
            .get()
            .and_then(Weak::upgrade)
            .is_some_and(|index| index.holds(key, value));
        if reindexed {
            debug!(key, reason = %reason, "Key was indexed again, keeping its file");
            return;
        }

        let mut ledger = self.ledger.lock();
        let size = match ledger.release(path) {
            Some(size) => size,
            None => match std::fs::metadata(path) {
                Ok(meta) => {
                    ledger.total = ledger.total.saturating_sub(meta.len());
                    meta.len()
                }
                Err(e) => {
                    debug!(key, path = %path.display(), error = %e, "Evicted file already gone");
                    return;
                }
            },
        };
        let total = ledger.total;

        if let Err(e) = self.blobs.delete(path) {
            error!(key, path = %path.display(), error = %e, "Cannot delete evicted file");
        }
        drop(ledger);

        debug!(key, size, total, reason = %reason, "Actual size decreased");
    }
}

impl IndexObserver for ByteAccountant {
    fn on_insert(&self, key: &str, value: &EntryValue) {
        if is_mapping_key(key) {
            return;
        }
        if let EntryValue::File(path) = value {
            self.record_file(key, path);
        }
    }

    fn on_evict(&self, reason: EvictionReason, key: &str, value: &EntryValue) {
        if is_mapping_key(key) {
            return;
        }
        if let EntryValue::File(path) = value {
            self.release_file(reason, key, value, path);
        }
    }
}
