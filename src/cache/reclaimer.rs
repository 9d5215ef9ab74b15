//! Disk quota reclamation: frees space before a blob write.
//!
//! Greedy and incremental. While the incoming payload would push the
//! directory over budget, the least recently used blob-backed entry is
//! evicted and the check repeats. Evictions go through the index, so the
//! accountant deletes the file and shrinks the total before the next check.

use tracing::{debug, info, warn};

use crate::cache::accountant::ByteAccountant;
use crate::cache::index::{EntryValue, EvictionReason, TtlIndex};
use crate::config::DirectorySize;

/// Outcome of one reclamation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reclaimed {
    pub evicted: usize,
    pub freed_bytes: u64,
    /// Whether the budget holds for the incoming payload afterwards.
    pub satisfied: bool,
}

/// Enforces the directory size budget.
#[derive(Debug, Clone, Copy)]
pub struct QuotaReclaimer {
    budget: DirectorySize,
}

impl QuotaReclaimer {
    pub fn new(budget: DirectorySize) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> DirectorySize {
        self.budget
    }

    /// Whether storing `incoming` more bytes on top of `used` breaks the budget.
    pub fn exceeds(&self, used: u64, incoming: u64) -> bool {
        match self.budget {
            DirectorySize::Unbounded => false,
            DirectorySize::Bytes(limit) => used.saturating_add(incoming) > limit,
        }
    }

    /// Evict coldest entries until `incoming` bytes fit.
    ///
    /// Stops early once no blob-backed entry is left; a payload larger than
    /// the whole budget therefore drains the index but is not rejected.
    pub fn reclaim(&self, index: &TtlIndex, accountant: &ByteAccountant, incoming: u64) -> Reclaimed {
        let mut outcome = Reclaimed::default();
        let before = accountant.total();

        loop {
            let used = accountant.total();
            if !self.exceeds(used, incoming) {
                outcome.satisfied = true;
                break;
            }

            let Some(victim) = coldest_file_entry(index) else {
                warn!(
                    used,
                    incoming,
                    budget = ?self.budget,
                    "Nothing left to reclaim, payload exceeds directory budget"
                );
                break;
            };

            if index.evict(&victim, EvictionReason::Reclaimed) {
                outcome.evicted += 1;
                debug!(key = %victim, used, incoming, "Reclaimed entry for space");
            }
        }

        outcome.freed_bytes = before.saturating_sub(accountant.total());
        if outcome.evicted > 0 {
            info!(
                evicted = outcome.evicted,
                freed_bytes = outcome.freed_bytes,
                "Reclamation round complete"
            );
        }
        outcome
    }
}

fn coldest_file_entry(index: &TtlIndex) -> Option<String> {
    let mut victim = None;
    index.range_backwards(|key, value| {
        if matches!(value, EntryValue::File(_)) {
            victim = Some(key.to_string());
            return false;
        }
        true
    });
    victim
}
