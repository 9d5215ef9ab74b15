//! Capacity-bounded TTL index.
//!
//! Maps cache keys to values (a blob path, or inline bytes for metadata) with a
//! per-entry deadline and a recency order. Removals of any kind are reported to
//! the registered [`IndexObserver`]s, which is how physical files and byte
//! accounting follow the index.
//!
//! Observers are called synchronously on the thread that caused the change,
//! exactly once per transition, after the index lock has been released, so an
//! observer may safely call back into the index.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tracing::{debug, trace};

/// What an index entry points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryValue {
    /// A blob file owned by this entry.
    File(PathBuf),
    /// Bytes held in memory (mapping records).
    Inline(Bytes),
}

impl EntryValue {
    pub fn as_path(&self) -> Option<&PathBuf> {
        match self {
            EntryValue::File(path) => Some(path),
            EntryValue::Inline(_) => None,
        }
    }

    /// The raw bytes of the value: the path string for files.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            EntryValue::File(path) => path.to_string_lossy().into_owned().into_bytes(),
            EntryValue::Inline(bytes) => bytes.to_vec(),
        }
    }
}

/// How long an entry lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    After(Duration),
    Never,
    /// Readable right away, removed by the next sweep.
    NextSweep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    At(Instant),
    Never,
    NextSweep,
}

impl Deadline {
    fn from_expiry(expiry: Expiry, now: Instant) -> Self {
        match expiry {
            Expiry::After(ttl) => Deadline::At(now + ttl),
            Expiry::Never => Deadline::Never,
            Expiry::NextSweep => Deadline::NextSweep,
        }
    }

    fn lapsed(&self, now: Instant) -> bool {
        matches!(self, Deadline::At(at) if *at <= now)
    }
}

/// Why an entry left the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    Expired,
    Deleted,
    CapacityReached,
    Reclaimed,
    Replaced,
    Reset,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Expired => "expired",
            EvictionReason::Deleted => "deleted",
            EvictionReason::CapacityReached => "capacity",
            EvictionReason::Reclaimed => "reclaimed",
            EvictionReason::Replaced => "replaced",
            EvictionReason::Reset => "reset",
        }
    }
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives index state transitions.
///
/// Implementations must not block for long: they run inline with the
/// operation that triggered them.
pub trait IndexObserver: Send + Sync {
    fn on_insert(&self, key: &str, value: &EntryValue);

    fn on_evict(&self, reason: EvictionReason, key: &str, value: &EntryValue);
}

#[derive(Debug)]
struct Slot {
    value: EntryValue,
    deadline: Deadline,
    tick: u64,
}

#[derive(Debug, Default)]
struct IndexInner {
    entries: HashMap<String, Slot>,
    /// Recency order: lowest tick is the least recently used entry.
    recency: BTreeMap<u64, String>,
    next_tick: u64,
}

impl IndexInner {
    fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn touch(&mut self, key: &str) {
        let tick = self.bump();
        if let Some(slot) = self.entries.get_mut(key) {
            self.recency.remove(&slot.tick);
            slot.tick = tick;
            self.recency.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.entries.remove(key)?;
        self.recency.remove(&slot.tick);
        Some(slot)
    }

    fn oldest_key(&self) -> Option<String> {
        self.recency.values().next().cloned()
    }

    fn snapshot(&self, now: Instant, newest_first: bool) -> Vec<(String, EntryValue)> {
        let live = |key: &String| {
            self.entries
                .get(key)
                .filter(|slot| !slot.deadline.lapsed(now))
                .map(|slot| (key.clone(), slot.value.clone()))
        };
        if newest_first {
            self.recency.values().rev().filter_map(live).collect()
        } else {
            self.recency.values().filter_map(live).collect()
        }
    }
}

type Removed = Vec<(EvictionReason, String, EntryValue)>;

/// In-memory key index with TTL expiry and an LRU capacity bound.
pub struct TtlIndex {
    inner: Mutex<IndexInner>,
    observers: RwLock<Vec<Arc<dyn IndexObserver>>>,
    capacity: usize,
}

impl TtlIndex {
    /// Create an index holding at most `capacity` entries (0 = unbounded).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(IndexInner::default()),
            observers: RwLock::new(Vec::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self, observer: Arc<dyn IndexObserver>) {
        self.observers.write().push(observer);
    }

    /// Look up a live entry, marking it most recently used.
    pub fn get(&self, key: &str) -> Option<EntryValue> {
        let now = Instant::now();
        let expired = {
            let mut inner = self.inner.lock();
            let found = inner
                .entries
                .get(key)
                .map(|slot| (slot.deadline.lapsed(now), slot.value.clone()));
            match found {
                None => return None,
                Some((false, value)) => {
                    inner.touch(key);
                    return Some(value);
                }
                Some((true, _)) => inner.remove(key),
            }
        };

        if let Some(slot) = expired {
            trace!(key, "Entry expired on access");
            self.notify_evicted(vec![(EvictionReason::Expired, key.to_string(), slot.value)]);
        }
        None
    }

    /// Whether `key` currently maps to `value`, expired or not. Does not
    /// touch recency.
    pub fn holds(&self, key: &str, value: &EntryValue) -> bool {
        self.inner
            .lock()
            .entries
            .get(key)
            .is_some_and(|slot| slot.value == *value)
    }

    /// Insert or replace an entry.
    pub fn set(&self, key: &str, value: EntryValue, expiry: Expiry) {
        let now = Instant::now();
        let mut removed: Removed = Vec::new();
        {
            let mut inner = self.inner.lock();
            let tick = inner.bump();

            if let Some(old) = inner.remove(key) {
                if old.value != value {
                    removed.push((EvictionReason::Replaced, key.to_string(), old.value));
                }
            } else if self.capacity > 0 {
                while inner.entries.len() >= self.capacity {
                    let Some(victim) = inner.oldest_key() else { break };
                    if let Some(slot) = inner.remove(&victim) {
                        removed.push((EvictionReason::CapacityReached, victim, slot.value));
                    }
                }
            }

            inner.entries.insert(
                key.to_string(),
                Slot {
                    value: value.clone(),
                    deadline: Deadline::from_expiry(expiry, now),
                    tick,
                },
            );
            inner.recency.insert(tick, key.to_string());
        }

        self.notify_evicted(removed);
        for observer in self.observers.read().iter() {
            observer.on_insert(key, &value);
        }
    }

    /// Remove an entry, reporting it as explicitly deleted.
    pub fn delete(&self, key: &str) -> bool {
        self.evict(key, EvictionReason::Deleted)
    }

    /// Remove an entry for the given reason.
    pub fn evict(&self, key: &str, reason: EvictionReason) -> bool {
        let removed = self.inner.lock().remove(key);
        match removed {
            Some(slot) => {
                self.notify_evicted(vec![(reason, key.to_string(), slot.value)]);
                true
            }
            None => false,
        }
    }

    /// Delete every key matching `pattern`. An invalid pattern deletes nothing.
    pub fn delete_many(&self, pattern: &str) -> usize {
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => {
                debug!(pattern, error = %e, "Ignoring invalid key pattern");
                return 0;
            }
        };
        self.delete_matching(&re)
    }

    pub fn delete_matching(&self, re: &Regex) -> usize {
        let mut deleted = 0;
        self.range(|key, _| {
            if re.is_match(key) && self.delete(key) {
                deleted += 1;
            }
            true
        });
        deleted
    }

    /// Visit live entries from most to least recently used.
    ///
    /// Iteration stops when `visitor` returns `false`. The visitor sees a
    /// snapshot and may modify the index.
    pub fn range<F>(&self, mut visitor: F)
    where
        F: FnMut(&str, &EntryValue) -> bool,
    {
        let snapshot = self.inner.lock().snapshot(Instant::now(), true);
        for (key, value) in &snapshot {
            if !visitor(key, value) {
                break;
            }
        }
    }

    /// Visit live entries from least to most recently used.
    pub fn range_backwards<F>(&self, mut visitor: F)
    where
        F: FnMut(&str, &EntryValue) -> bool,
    {
        let snapshot = self.inner.lock().snapshot(Instant::now(), false);
        for (key, value) in &snapshot {
            if !visitor(key, value) {
                break;
            }
        }
    }

    /// Keys of every live entry, most recently used first.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        self.range(|key, _| {
            keys.push(key.to_string());
            true
        });
        keys
    }

    /// Number of entries, including lapsed ones not yet swept.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove lapsed and sweep-bound entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let removed: Removed = {
            let mut inner = self.inner.lock();
            let due: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, slot)| {
                    slot.deadline == Deadline::NextSweep || slot.deadline.lapsed(now)
                })
                .map(|(key, _)| key.clone())
                .collect();

            due.into_iter()
                .filter_map(|key| {
                    inner
                        .remove(&key)
                        .map(|slot| (EvictionReason::Expired, key, slot.value))
                })
                .collect()
        };

        let count = removed.len();
        if count > 0 {
            trace!(count, "Swept expired entries");
        }
        self.notify_evicted(removed);
        count
    }

    /// Remove every entry for the given reason.
    pub fn clear(&self, reason: EvictionReason) -> usize {
        let removed: Removed = {
            let mut inner = self.inner.lock();
            inner.recency.clear();
            inner
                .entries
                .drain()
                .map(|(key, slot)| (reason, key, slot.value))
                .collect()
        };

        let count = removed.len();
        self.notify_evicted(removed);
        count
    }

    fn notify_evicted(&self, removed: Removed) {
        if removed.is_empty() {
            return;
        }
        let observers = self.observers.read();
        for (reason, key, value) in &removed {
            for observer in observers.iter() {
                observer.on_evict(*reason, key, value);
            }
        }
    }
}

impl fmt::Debug for TtlIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlIndex")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
