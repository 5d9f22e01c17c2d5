//! Memory manager trait and cache statistics.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use wxflow_core::CacheResult;

use super::owner_key::OwnerScopedKey;

/// A reference-counted store of computed items under a memory ceiling.
///
/// Implementations are shared between sources, worker tasks and consumers and
/// must be thread-safe. No operation panics: failures are logged by the
/// implementation and signalled through the return value.
pub trait MemoryManager<T: ?Sized>: Send + Sync {
    /// Human-readable name used in log output ("NWP", "GPU", ...).
    fn identifier(&self) -> &str;

    /// Insert `item` under `key` holding `reservations` claims.
    ///
    /// Fails with `KeyCollision` if `key` is occupied (the existing entry stays
    /// authoritative) or `EvictionFailure` if the ceiling cannot be met even
    /// after evicting every released entry.
    fn store(&self, key: OwnerScopedKey, item: Arc<T>, reservations: u32) -> CacheResult<()>;

    /// [`store`](Self::store) with a single reservation for the caller.
    /// `false` means the caller must drop the item.
    fn try_store(&self, key: OwnerScopedKey, item: Arc<T>) -> bool {
        self.store(key, item, 1).is_ok()
    }

    /// Add a claim on an existing entry, reviving it if it was released.
    fn reserve(&self, key: &OwnerScopedKey) -> bool;

    /// Take a reference on an entry, consuming a reservation if one is held.
    fn acquire(&self, key: &OwnerScopedKey) -> Option<Arc<T>>;

    /// Give back a reference taken with [`acquire`](Self::acquire).
    fn release(&self, key: &OwnerScopedKey);

    /// Drop a claim that will never be acquired.
    fn cancel_reservation(&self, key: &OwnerScopedKey);

    /// Whether an entry (active or released) exists. Does not revive.
    fn contains(&self, key: &OwnerScopedKey) -> bool;

    /// Destroy every released entry.
    fn clear(&self);

    fn stats(&self) -> CacheStats;
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups (reserve/acquire) that found an entry.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries destroyed to make room for new ones.
    pub evictions: u64,
    /// Entries with references or reservations.
    pub active_entries: u64,
    /// Entries waiting in the released queue.
    pub released_entries: u64,
    pub usage_kb: u64,
    pub limit_kb: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Fraction of the ceiling in use.
    pub fn fill_ratio(&self) -> f64 {
        if self.limit_kb == 0 {
            0.0
        } else {
            self.usage_kb as f64 / self.limit_kb as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_cache_stats_fill_ratio() {
        let stats = CacheStats {
            usage_kb: 256,
            limit_kb: 1024,
            ..Default::default()
        };
        assert!((stats.fill_ratio() - 0.25).abs() < 0.001);
        assert_eq!(CacheStats::default().fill_ratio(), 0.0);
    }
}
