//! LRU reference-counted resource cache.
//!
//! One instance manages CPU-side items ("system memory"), another GPU-side
//! items ("video memory"); both share this implementation and differ only in
//! their ceiling.
//!
//! Eviction is least-recently-released-first and only ever touches entries
//! that have neither references nor reservations. It runs when a store needs
//! room, never in the background.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use wxflow_core::{CacheError, CacheResult, MemorySized};

use super::handle::ResourceHandle;
use super::owner_key::OwnerScopedKey;
use super::traits::{CacheStats, MemoryManager};

const KB_PER_MIB: f64 = 1024.0;

struct CacheEntry<T: ?Sized> {
    item: Arc<T>,
    ref_count: u32,
    reservations: u32,
    size_kb: u64,
}

impl<T: ?Sized> CacheEntry<T> {
    fn is_evictable(&self) -> bool {
        self.ref_count == 0 && self.reservations == 0
    }
}

/// Evictable keys in release order.
///
/// Revived entries leave the middle of the queue, so keys are indexed by
/// their release sequence number instead of being searched for.
#[derive(Default)]
struct ReleaseQueue {
    next_seq: u64,
    order: BTreeMap<u64, OwnerScopedKey>,
    seq_of: HashMap<OwnerScopedKey, u64>,
}

impl ReleaseQueue {
    /// Queue `key` as most recently released.
    fn push_back(&mut self, key: OwnerScopedKey) {
        self.remove(&key);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.seq_of.insert(key.clone(), seq);
        self.order.insert(seq, key);
    }

    fn pop_front(&mut self) -> Option<OwnerScopedKey> {
        let (_, key) = self.order.pop_first()?;
        self.seq_of.remove(&key);
        Some(key)
    }

    fn remove(&mut self, key: &OwnerScopedKey) -> bool {
        match self.seq_of.remove(key) {
            Some(seq) => self.order.remove(&seq).is_some(),
            None => false,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &OwnerScopedKey> {
        self.order.values()
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn take_all(&mut self) -> Vec<OwnerScopedKey> {
        self.seq_of.clear();
        std::mem::take(&mut self.order).into_values().collect()
    }
}

struct CacheState<T: ?Sized> {
    entries: HashMap<OwnerScopedKey, CacheEntry<T>>,
    /// Evictable keys, least recently released at the front.
    released: ReleaseQueue,
    usage_kb: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<T: ?Sized> CacheState<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            released: ReleaseQueue::default(),
            usage_kb: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn unqueue(&mut self, key: &OwnerScopedKey) {
        self.released.remove(key);
    }

    fn destroy(&mut self, key: &OwnerScopedKey) -> Option<CacheEntry<T>> {
        let entry = self.entries.remove(key)?;
        self.usage_kb = self.usage_kb.saturating_sub(entry.size_kb);
        Some(entry)
    }
}

/// State of a cache entry as seen in a [`CacheSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    /// Claimed but not yet acquired.
    Reserved,
    /// At least one reference is held.
    Acquired,
    /// No references or claims; queued for eviction.
    Released,
}

/// Per-entry view in a [`CacheSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub key: String,
    pub size_kb: u64,
    pub ref_count: u32,
    pub reservations: u32,
    pub state: EntryState,
}

/// Point-in-time dump of a cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub identifier: String,
    pub usage_kb: u64,
    pub limit_kb: u64,
    /// All entries sorted by encoded key.
    pub entries: Vec<EntrySnapshot>,
    /// Encoded keys of released entries, next eviction candidate first.
    pub released_order: Vec<String>,
}

/// Reference-counted cache with a least-recently-released eviction queue.
pub struct ResourceCache<T: ?Sized> {
    identifier: String,
    limit_kb: u64,
    state: Mutex<CacheState<T>>,
}

impl<T> ResourceCache<T>
where
    T: ?Sized + MemorySized + Send + Sync + 'static,
{
    pub fn new(identifier: impl Into<String>, limit_kb: u64) -> Self {
        Self {
            identifier: identifier.into(),
            limit_kb,
            state: Mutex::new(CacheState::new()),
        }
    }

    pub fn limit_kb(&self) -> u64 {
        self.limit_kb
    }

    fn lock(&self) -> CacheResult<MutexGuard<'_, CacheState<T>>> {
        self.state.lock().map_err(|_| CacheError::LockPoisoned {
            cache: self.identifier.clone(),
        })
    }

    fn lock_or_log(&self) -> Option<MutexGuard<'_, CacheState<T>>> {
        match self.lock() {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::error!(error = %e, "Cache state unavailable");
                None
            }
        }
    }

    /// Acquire wrapped in a handle that releases on drop.
    pub fn checkout(self: &Arc<Self>, key: &OwnerScopedKey) -> Option<ResourceHandle<T>> {
        let manager: Arc<dyn MemoryManager<T>> = self.clone();
        ResourceHandle::checkout(&manager, key)
    }

    /// Current reference count, or `None` if no entry exists.
    pub fn ref_count(&self, key: &OwnerScopedKey) -> Option<u32> {
        let state = self.lock_or_log()?;
        state.entries.get(key).map(|e| e.ref_count)
    }

    /// Outstanding reservations, or `None` if no entry exists.
    pub fn reservations(&self, key: &OwnerScopedKey) -> Option<u32> {
        let state = self.lock_or_log()?;
        state.entries.get(key).map(|e| e.reservations)
    }

    /// True if the entry exists and may be evicted.
    pub fn is_evictable(&self, key: &OwnerScopedKey) -> bool {
        self.lock_or_log()
            .and_then(|state| state.entries.get(key).map(CacheEntry::is_evictable))
            .unwrap_or(false)
    }

    /// Destroy a released entry. Active entries are left alone.
    pub fn remove_released(&self, key: &OwnerScopedKey) -> bool {
        let Some(mut state) = self.lock_or_log() else {
            return false;
        };
        let evictable = state.entries.get(key).map(CacheEntry::is_evictable);
        match evictable {
            Some(true) => {
                state.unqueue(key);
                state.destroy(key);
                tracing::debug!(cache = %self.identifier, key = %key, "Removed released entry");
                true
            }
            Some(false) => {
                tracing::warn!(
                    cache = %self.identifier,
                    key = %key,
                    "Refusing to remove entry that is still in use"
                );
                false
            }
            None => false,
        }
    }

    pub fn usage_kb(&self) -> u64 {
        self.lock_or_log().map(|s| s.usage_kb).unwrap_or(0)
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let (usage_kb, mut entries, released_order) = match self.lock_or_log() {
            Some(state) => {
                let entries: Vec<EntrySnapshot> = state
                    .entries
                    .iter()
                    .map(|(key, e)| EntrySnapshot {
                        key: key.encode(),
                        size_kb: e.size_kb,
                        ref_count: e.ref_count,
                        reservations: e.reservations,
                        state: if e.ref_count > 0 {
                            EntryState::Acquired
                        } else if e.reservations > 0 {
                            EntryState::Reserved
                        } else {
                            EntryState::Released
                        },
                    })
                    .collect();
                let released = state.released.iter().map(OwnerScopedKey::encode).collect();
                (state.usage_kb, entries, released)
            }
            None => (0, Vec::new(), Vec::new()),
        };
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        CacheSnapshot {
            identifier: self.identifier.clone(),
            usage_kb,
            limit_kb: self.limit_kb,
            entries,
            released_order,
        }
    }

    /// `"<used> / <limit> MiB"`.
    pub fn memory_status(&self) -> String {
        format!(
            "{:.1} / {:.1} MiB",
            self.usage_kb() as f64 / KB_PER_MIB,
            self.limit_kb as f64 / KB_PER_MIB
        )
    }

    /// `"<n> active / <m> released"`.
    pub fn entry_status(&self) -> String {
        let stats = self.stats();
        format!(
            "{} active / {} released",
            stats.active_entries, stats.released_entries
        )
    }

    /// Dump every entry at info level.
    pub fn log_contents(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            cache = %snapshot.identifier,
            usage_kb = snapshot.usage_kb,
            limit_kb = snapshot.limit_kb,
            entries = snapshot.entries.len(),
            "Cache contents"
        );
        for entry in &snapshot.entries {
            tracing::info!(
                cache = %snapshot.identifier,
                key = %entry.key,
                size_kb = entry.size_kb,
                ref_count = entry.ref_count,
                reservations = entry.reservations,
                state = ?entry.state,
                "Cache entry"
            );
        }
    }
}

impl<T> MemoryManager<T> for ResourceCache<T>
where
    T: ?Sized + MemorySized + Send + Sync + 'static,
{
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn store(&self, key: OwnerScopedKey, item: Arc<T>, reservations: u32) -> CacheResult<()> {
        let mut state = self.lock()?;

        if state.entries.contains_key(&key) {
            tracing::warn!(
                cache = %self.identifier,
                key = %key,
                "Key already present, discarding new item"
            );
            return Err(CacheError::KeyCollision {
                cache: self.identifier.clone(),
                key: key.encode(),
            });
        }

        let size_kb = item.memory_size_kb();
        while state.usage_kb + size_kb >= self.limit_kb {
            let Some(victim) = state.released.pop_front() else {
                break;
            };
            if let Some(evicted) = state.destroy(&victim) {
                state.evictions += 1;
                tracing::debug!(
                    cache = %self.identifier,
                    key = %victim,
                    size_kb = evicted.size_kb,
                    "Evicted released entry"
                );
            }
        }

        if state.usage_kb + size_kb >= self.limit_kb {
            tracing::error!(
                cache = %self.identifier,
                key = %key,
                required_kb = size_kb,
                usage_kb = state.usage_kb,
                limit_kb = self.limit_kb,
                "Memory limit exceeded, cannot store item"
            );
            return Err(CacheError::EvictionFailure {
                cache: self.identifier.clone(),
                required_kb: size_kb,
                usage_kb: state.usage_kb,
                limit_kb: self.limit_kb,
            });
        }

        state.usage_kb += size_kb;
        if reservations == 0 {
            state.released.push_back(key.clone());
        }
        tracing::debug!(
            cache = %self.identifier,
            key = %key,
            size_kb,
            reservations,
            usage_kb = state.usage_kb,
            "Stored item"
        );
        state.entries.insert(
            key,
            CacheEntry {
                item,
                ref_count: 0,
                reservations,
                size_kb,
            },
        );
        Ok(())
    }

    fn reserve(&self, key: &OwnerScopedKey) -> bool {
        let Some(mut state) = self.lock_or_log() else {
            return false;
        };
        let revive = match state.entries.get_mut(key) {
            Some(entry) => {
                let revive = entry.is_evictable();
                entry.reservations += 1;
                revive
            }
            None => {
                state.misses += 1;
                return false;
            }
        };
        if revive {
            state.unqueue(key);
        }
        state.hits += 1;
        true
    }

    fn acquire(&self, key: &OwnerScopedKey) -> Option<Arc<T>> {
        let mut state = self.lock_or_log()?;
        let (item, revive) = match state.entries.get_mut(key) {
            Some(entry) => {
                let revive = entry.is_evictable();
                if entry.reservations > 0 {
                    entry.reservations -= 1;
                }
                entry.ref_count += 1;
                (Arc::clone(&entry.item), revive)
            }
            None => {
                state.misses += 1;
                let err = CacheError::NotAvailable {
                    cache: self.identifier.clone(),
                    key: key.encode(),
                };
                tracing::warn!(error = %err, "Acquire on missing entry");
                return None;
            }
        };
        if revive {
            state.unqueue(key);
        }
        state.hits += 1;
        Some(item)
    }

    fn release(&self, key: &OwnerScopedKey) {
        let Some(mut state) = self.lock_or_log() else {
            return;
        };
        let now_evictable = match state.entries.get_mut(key) {
            Some(entry) if entry.ref_count > 0 => {
                entry.ref_count -= 1;
                entry.is_evictable()
            }
            _ => {
                let err = CacheError::OverRelease {
                    cache: self.identifier.clone(),
                    key: key.encode(),
                };
                tracing::error!(error = %err, "Release without matching acquire");
                return;
            }
        };
        if now_evictable {
            state.released.push_back(key.clone());
        }
    }

    fn cancel_reservation(&self, key: &OwnerScopedKey) {
        let Some(mut state) = self.lock_or_log() else {
            return;
        };
        let now_evictable = match state.entries.get_mut(key) {
            Some(entry) if entry.reservations > 0 => {
                entry.reservations -= 1;
                entry.is_evictable()
            }
            _ => {
                tracing::warn!(
                    cache = %self.identifier,
                    key = %key,
                    "Cancelling a reservation that is not held"
                );
                return;
            }
        };
        if now_evictable {
            state.released.push_back(key.clone());
        }
    }

    fn contains(&self, key: &OwnerScopedKey) -> bool {
        self.lock_or_log()
            .map(|state| state.entries.contains_key(key))
            .unwrap_or(false)
    }

    fn clear(&self) {
        let Some(mut state) = self.lock_or_log() else {
            return;
        };
        let released: Vec<OwnerScopedKey> = state.released.take_all();
        for key in &released {
            state.destroy(key);
        }
        tracing::debug!(
            cache = %self.identifier,
            removed = released.len(),
            usage_kb = state.usage_kb,
            "Cleared released entries"
        );
    }

    fn stats(&self) -> CacheStats {
        let Some(state) = self.lock_or_log() else {
            return CacheStats {
                limit_kb: self.limit_kb,
                ..Default::default()
            };
        };
        let released = state.released.len() as u64;
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            active_entries: state.entries.len() as u64 - released,
            released_entries: released,
            usage_kb: state.usage_kb,
            limit_kb: self.limit_kb,
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for ResourceCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("identifier", &self.identifier)
            .field("limit_kb", &self.limit_kb)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use wxflow_core::{RequestBuilder, RequestKey, SourceId};

    /// Fixed-size item for cache tests.
    #[derive(Debug, PartialEq)]
    pub(crate) struct Blob {
        pub id: u32,
        pub size_kb: u64,
    }

    impl MemorySized for Blob {
        fn memory_size_kb(&self) -> u64 {
            self.size_kb
        }
    }

    pub(crate) fn key(owner: SourceId, member: u32) -> OwnerScopedKey {
        let request: RequestKey = RequestBuilder::new()
            .with("VARIABLE", "T")
            .with("MEMBER", member.to_string())
            .build();
        OwnerScopedKey::new(owner, request)
    }

    fn blob(id: u32, size_kb: u64) -> Arc<Blob> {
        Arc::new(Blob { id, size_kb })
    }

    #[test]
    fn test_store_then_acquire_consumes_reservation() {
        let cache = ResourceCache::new("NWP", 100);
        let k = key(SourceId::new(), 0);
        assert!(cache.try_store(k.clone(), blob(1, 10)));
        assert_eq!(cache.reservations(&k), Some(1));
        assert_eq!(cache.ref_count(&k), Some(0));
        assert!(!cache.is_evictable(&k));

        let item = cache.acquire(&k).unwrap();
        assert_eq!(item.id, 1);
        assert_eq!(cache.reservations(&k), Some(0));
        assert_eq!(cache.ref_count(&k), Some(1));
    }

    #[test]
    fn test_key_collision_keeps_existing_item() {
        let cache = ResourceCache::new("NWP", 100);
        let k = key(SourceId::new(), 0);
        cache.store(k.clone(), blob(1, 10), 1).unwrap();
        let err = cache.store(k.clone(), blob(2, 10), 1).unwrap_err();
        assert!(matches!(err, CacheError::KeyCollision { .. }));
        assert_eq!(cache.acquire(&k).unwrap().id, 1);
        assert_eq!(cache.usage_kb(), 10);
    }

    #[test]
    fn test_acquire_missing_returns_none() {
        let cache: ResourceCache<Blob> = ResourceCache::new("NWP", 100);
        assert!(cache.acquire(&key(SourceId::new(), 0)).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_release_to_zero_makes_evictable_but_queryable() {
        let cache = ResourceCache::new("NWP", 100);
        let k = key(SourceId::new(), 0);
        cache.try_store(k.clone(), blob(1, 10));
        cache.acquire(&k).unwrap();
        cache.release(&k);
        assert!(cache.is_evictable(&k));
        assert!(cache.contains(&k));
        assert_eq!(cache.stats().released_entries, 1);

        // Revived on acquire.
        assert_eq!(cache.acquire(&k).unwrap().id, 1);
        assert!(!cache.is_evictable(&k));
        assert_eq!(cache.stats().released_entries, 0);
    }

    #[test]
    fn test_over_release_is_clamped() {
        let cache = ResourceCache::new("NWP", 100);
        let k = key(SourceId::new(), 0);
        cache.try_store(k.clone(), blob(1, 10));
        cache.acquire(&k).unwrap();
        cache.release(&k);
        cache.release(&k);
        assert_eq!(cache.ref_count(&k), Some(0));
        assert_eq!(cache.stats().released_entries, 1);

        // Unknown key.
        cache.release(&key(SourceId::new(), 9));
    }

    #[test]
    fn test_eviction_least_recently_released_first() {
        let cache = ResourceCache::new("NWP", 30);
        let owner = SourceId::new();
        let (a, b, c) = (key(owner, 0), key(owner, 1), key(owner, 2));
        for (i, k) in [&a, &b].into_iter().enumerate() {
            cache.try_store(k.clone(), blob(i as u32, 10));
            cache.acquire(k).unwrap();
        }
        // Release b before a: b is evicted first.
        cache.release(&b);
        cache.release(&a);

        assert!(cache.try_store(c.clone(), blob(2, 10)));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&a));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_eviction_skips_active_entries() {
        let cache = ResourceCache::new("NWP", 25);
        let owner = SourceId::new();
        let (a, b) = (key(owner, 0), key(owner, 1));
        cache.try_store(a.clone(), blob(0, 10));
        cache.acquire(&a).unwrap();

        let err = cache.store(b.clone(), blob(1, 20), 1).unwrap_err();
        assert_eq!(
            err,
            CacheError::EvictionFailure {
                cache: "NWP".to_string(),
                required_kb: 20,
                usage_kb: 10,
                limit_kb: 25,
            }
        );
        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
    }

    #[test]
    fn test_item_filling_exactly_to_limit_is_rejected() {
        let cache = ResourceCache::new("GPU", 10);
        assert!(!cache.try_store(key(SourceId::new(), 0), blob(0, 10)));
        assert!(cache.try_store(key(SourceId::new(), 0), blob(0, 9)));
    }

    #[test]
    fn test_reserve_revives_released_entry() {
        let cache = ResourceCache::new("NWP", 100);
        let k = key(SourceId::new(), 0);
        cache.store(k.clone(), blob(0, 10), 0).unwrap();
        assert!(cache.is_evictable(&k));

        assert!(cache.reserve(&k));
        assert!(!cache.is_evictable(&k));
        assert!(cache.snapshot().released_order.is_empty());

        cache.cancel_reservation(&k);
        assert!(cache.is_evictable(&k));
        assert!(!cache.reserve(&key(SourceId::new(), 0)));
    }

    #[test]
    fn test_revive_from_middle_keeps_release_order() {
        let cache = ResourceCache::new("NWP", 100);
        let owner = SourceId::new();
        let (a, b, c) = (key(owner, 0), key(owner, 1), key(owner, 2));
        for (i, k) in [&a, &b, &c].into_iter().enumerate() {
            cache.store(k.clone(), blob(i as u32, 10), 0).unwrap();
        }

        assert!(cache.reserve(&b));
        assert_eq!(cache.snapshot().released_order, vec![a.encode(), c.encode()]);

        cache.cancel_reservation(&b);
        assert_eq!(
            cache.snapshot().released_order,
            vec![a.encode(), c.encode(), b.encode()]
        );
    }

    #[test]
    fn test_remove_released_and_clear() {
        let cache = ResourceCache::new("NWP", 100);
        let owner = SourceId::new();
        let (a, b, c) = (key(owner, 0), key(owner, 1), key(owner, 2));
        cache.store(a.clone(), blob(0, 10), 0).unwrap();
        cache.store(b.clone(), blob(1, 10), 0).unwrap();
        cache.store(c.clone(), blob(2, 10), 1).unwrap();

        assert!(cache.remove_released(&a));
        assert!(!cache.remove_released(&a));
        assert!(!cache.remove_released(&c));

        cache.clear();
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
        assert_eq!(cache.usage_kb(), 10);
    }

    #[test]
    fn test_two_consumers_share_one_entry() {
        let cache = Arc::new(ResourceCache::new("NWP", 100));
        let k = key(SourceId::new(), 0);
        assert!(cache.try_store(k.clone(), blob(7, 10)));

        let first = cache.checkout(&k).unwrap();
        assert_eq!(cache.ref_count(&k), Some(1));
        assert!(cache.reserve(&k));
        let second = cache.checkout(&k).unwrap();
        assert_eq!(cache.ref_count(&k), Some(2));
        assert!(Arc::ptr_eq(first.item(), second.item()));

        drop(first);
        drop(second);
        assert_eq!(cache.ref_count(&k), Some(0));
        assert!(cache.is_evictable(&k));
        assert!(cache.acquire(&k).is_some());
    }

    #[test]
    fn test_status_text() {
        let cache = ResourceCache::new("NWP", 2048);
        let owner = SourceId::new();
        cache.store(key(owner, 0), blob(0, 512), 1).unwrap();
        cache.store(key(owner, 1), blob(1, 512), 0).unwrap();
        assert_eq!(cache.memory_status(), "1.0 / 2.0 MiB");
        assert_eq!(cache.entry_status(), "1 active / 1 released");
    }

    #[test]
    fn test_snapshot_states_and_serialization() {
        let cache = ResourceCache::new("NWP", 100);
        let owner = SourceId::new();
        let (a, b) = (key(owner, 0), key(owner, 1));
        cache.store(a.clone(), blob(0, 10), 1).unwrap();
        cache.store(b.clone(), blob(1, 10), 0).unwrap();
        cache.log_contents();

        let snapshot = cache.snapshot();
        let state_of = |k: &OwnerScopedKey| {
            snapshot
                .entries
                .iter()
                .find(|e| e.key == k.encode())
                .map(|e| e.state)
        };
        assert_eq!(state_of(&a), Some(EntryState::Reserved));
        assert_eq!(state_of(&b), Some(EntryState::Released));
        assert_eq!(snapshot.released_order, vec![b.encode()]);

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"identifier\":\"NWP\""));
    }
}
