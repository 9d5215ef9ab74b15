//! Prometheus metrics for the store.
//!
//! Eviction counts are fed by an index observer, so every removal path
//! (expiry, delete, capacity, reclamation, reset) is counted in one place.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::cache::index::{EntryValue, EvictionReason, IndexObserver};
use crate::cache::mapping::is_mapping_key;

/// Counters and gauges exported at `/metrics`.
#[derive(Clone)]
pub struct StoreMetrics {
    registry: Registry,
    pub hits: IntCounter,
    pub misses: IntCounter,
    pub writes: IntCounter,
    pub write_failures: IntCounter,
    pub evictions: IntCounterVec,
    pub entries: IntGauge,
    pub bytes_on_disk: IntGauge,
}

impl StoreMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("simplefs".to_string()), None)?;

        let hits = IntCounter::new("cache_hits_total", "Lookups answered from the store")?;
        let misses = IntCounter::new("cache_misses_total", "Lookups that found nothing")?;
        let writes = IntCounter::new("cache_writes_total", "Data entries inserted into the index")?;
        let write_failures = IntCounter::new("cache_write_failures_total", "Rejected or failed writes")?;
        let evictions = IntCounterVec::new(
            Opts::new("cache_evictions_total", "Entries removed from the index"),
            &["reason"],
        )?;
        let entries = IntGauge::new("cache_entries", "Entries in the index")?;
        let bytes_on_disk = IntGauge::new("cache_bytes_on_disk", "Bytes accounted on disk")?;

        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(misses.clone()))?;
        registry.register(Box::new(writes.clone()))?;
        registry.register(Box::new(write_failures.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(entries.clone()))?;
        registry.register(Box::new(bytes_on_disk.clone()))?;

        Ok(Self {
            registry,
            hits,
            misses,
            writes,
            write_failures,
            evictions,
            entries,
            bytes_on_disk,
        })
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl IndexObserver for StoreMetrics {
    fn on_insert(&self, key: &str, _value: &EntryValue) {
        if !is_mapping_key(key) {
            self.writes.inc();
        }
    }

    fn on_evict(&self, reason: EvictionReason, _key: &str, _value: &EntryValue) {
        self.evictions.with_label_values(&[reason.as_str()]).inc();
    }
}
