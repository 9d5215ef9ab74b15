//! Flat-file blob storage.
//!
//! Every blob lives directly under the root directory, named by
//! percent-escaping its cache key. Writes go to a temp file first and are
//! renamed into place so readers never observe a partially written blob.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix of in-flight write files. Escaped key names never start with a dot.
const TEMP_PREFIX: &str = ".tmp-";

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Blob file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Cache key cannot be stored as a file name: {0:?}")]
    InvalidKey(String),
}

impl BlobError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == ErrorKind::NotFound {
            return BlobError::FileNotFound(path.to_path_buf());
        }
        BlobError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A blob file found on disk.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// A blob written to a temp file but not yet moved into place.
///
/// Dropping it without committing removes the temp file.
#[derive(Debug)]
pub struct StagedBlob {
    temp: Option<PathBuf>,
    path: PathBuf,
    size: u64,
}

impl StagedBlob {
    /// Where the blob will live once committed.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedBlob {
    fn drop(&mut self) {
        if let Some(temp) = self.temp.take() {
            let _ = fs::remove_file(temp);
        }
    }
}

#[derive(Debug, Default)]
pub struct BlobStats {
    pub total_writes: AtomicU64,
    pub total_reads: AtomicU64,
    pub total_deletes: AtomicU64,
    pub total_bytes_written: AtomicU64,
    pub total_bytes_read: AtomicU64,
}

/// Reads and writes blob files under one root directory.
#[derive(Debug)]
pub struct BlobStore {
    root: PathBuf,
    stats: BlobStats,
}

impl BlobStore {
    /// Open the store, creating the root directory (and parents) if absent.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| BlobError::io(&root, e))?;
        debug!(root = %root.display(), "Blob directory ready");

        Ok(Self {
            root,
            stats: BlobStats::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a cache key to its file path.
    ///
    /// Slashes, colons and every other reserved byte are escaped, so the
    /// result is always a single file name inside the root.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        Ok(self.root.join(escape_key(key)?))
    }

    /// Recover the cache key a blob file was written for.
    pub fn key_for(&self, path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        if name.starts_with('.') {
            return None;
        }
        urlencoding::decode(name).ok().map(|key| key.into_owned())
    }

    /// Write a blob for `key`, replacing any previous content.
    pub fn write(&self, key: &str, data: &[u8]) -> Result<PathBuf, BlobError> {
        let staged = self.stage(key, data)?;
        self.commit(staged)
    }

    /// Write `data` to a temp file. Nothing is visible under `key` until
    /// [`BlobStore::commit`].
    pub fn stage(&self, key: &str, data: &[u8]) -> Result<StagedBlob, BlobError> {
        let path = self.path_for(key)?;
        let temp = self.root.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
        fs::write(&temp, data).map_err(|e| BlobError::io(&temp, e))?;

        Ok(StagedBlob {
            temp: Some(temp),
            path,
            size: data.len() as u64,
        })
    }

    /// Move a staged blob into place, replacing any previous content.
    pub fn commit(&self, mut staged: StagedBlob) -> Result<PathBuf, BlobError> {
        let Some(temp) = staged.temp.take() else {
            return Ok(staged.path.clone());
        };
        if let Err(e) = fs::rename(&temp, &staged.path) {
            let _ = fs::remove_file(&temp);
            return Err(BlobError::io(&staged.path, e));
        }

        debug!(path = %staged.path.display(), size = staged.size, "Wrote blob");

        self.stats.total_writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_written
            .fetch_add(staged.size, Ordering::Relaxed);

        Ok(staged.path.clone())
    }

    pub fn read(&self, path: &Path) -> Result<Vec<u8>, BlobError> {
        let data = fs::read(path).map_err(|e| BlobError::io(path, e))?;

        self.stats.total_reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_read
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        Ok(data)
    }

    pub fn delete(&self, path: &Path) -> Result<(), BlobError> {
        fs::remove_file(path).map_err(|e| BlobError::io(path, e))?;
        self.stats.total_deletes.fetch_add(1, Ordering::Relaxed);
        debug!(path = %path.display(), "Deleted blob file");
        Ok(())
    }

    /// List every blob file in the root, skipping directories and temp files.
    pub fn scan(&self) -> Result<Vec<StoredBlob>, BlobError> {
        let mut blobs = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| BlobError::io(&self.root, e))?;

        for entry in entries {
            let entry = entry.map_err(|e| BlobError::io(&self.root, e))?;
            let path = entry.path();
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot stat blob file");
                    continue;
                }
            };
            if !meta.is_file() || is_temp_file(&path) {
                continue;
            }
            blobs.push(StoredBlob {
                path,
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        Ok(blobs)
    }

    /// Remove temp files left behind by interrupted writes.
    pub fn remove_temp_files(&self) -> Result<usize, BlobError> {
        let mut removed = 0;
        let entries = fs::read_dir(&self.root).map_err(|e| BlobError::io(&self.root, e))?;

        for entry in entries.flatten() {
            let path = entry.path();
            if is_temp_file(&path) && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, "Removed leftover temp files");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> &BlobStats {
        &self.stats
    }
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(TEMP_PREFIX))
}

/// Percent-escape a key into a flat, traversal-free file name.
fn escape_key(key: &str) -> Result<String, BlobError> {
    if key.is_empty() {
        return Err(BlobError::InvalidKey(key.to_string()));
    }

    let escaped = urlencoding::encode(key);
    // `.` is left alone by the encoder; escape a leading one so names like
    // `.`, `..` or `.tmp-*` cannot be produced.
    match escaped.strip_prefix('.') {
        Some(rest) => Ok(format!("%2E{rest}")),
        None => Ok(escaped.into_owned()),
    }
}
