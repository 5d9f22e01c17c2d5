//! RAII handle over an acquired cache entry.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use wxflow_core::RequestKey;

use super::owner_key::OwnerScopedKey;
use super::traits::MemoryManager;

/// A reference on a cache entry that is released when the handle drops.
pub struct ResourceHandle<T: ?Sized> {
    manager: Arc<dyn MemoryManager<T>>,
    key: OwnerScopedKey,
    item: Arc<T>,
}

impl<T: ?Sized> ResourceHandle<T> {
    /// Acquire `key` on `manager`. `None` if the entry is not available.
    pub fn checkout(manager: &Arc<dyn MemoryManager<T>>, key: &OwnerScopedKey) -> Option<Self> {
        let item = manager.acquire(key)?;
        Some(Self {
            manager: Arc::clone(manager),
            key: key.clone(),
            item,
        })
    }

    pub fn key(&self) -> &OwnerScopedKey {
        &self.key
    }

    /// The (reduced) request the entry was stored under.
    pub fn request(&self) -> &RequestKey {
        self.key.request()
    }

    pub fn item(&self) -> &Arc<T> {
        &self.item
    }

    /// Identifier of the cache holding the entry.
    pub fn cache(&self) -> &str {
        self.manager.identifier()
    }
}

impl<T: ?Sized> Deref for ResourceHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T: ?Sized> Drop for ResourceHandle<T> {
    fn drop(&mut self) {
        self.manager.release(&self.key);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for ResourceHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("cache", &self.manager.identifier())
            .field("key", &self.key.encode())
            .field("item", &self.item)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::lru::tests::{key, Blob};
    use super::super::lru::ResourceCache;
    use super::*;
    use wxflow_core::SourceId;

    #[test]
    fn test_handle_releases_on_drop() {
        let cache = Arc::new(ResourceCache::new("NWP", 100));
        let k = key(SourceId::new(), 0);
        cache.try_store(k.clone(), Arc::new(Blob { id: 3, size_kb: 4 }));

        let manager: Arc<dyn MemoryManager<Blob>> = cache.clone();
        let handle = ResourceHandle::checkout(&manager, &k).unwrap();
        assert_eq!(handle.id, 3);
        assert_eq!(handle.request(), k.request());
        assert_eq!(handle.cache(), "NWP");
        assert_eq!(cache.ref_count(&k), Some(1));

        drop(handle);
        assert_eq!(cache.ref_count(&k), Some(0));
        assert!(cache.is_evictable(&k));
    }

    #[test]
    fn test_checkout_missing_is_none() {
        let cache: Arc<ResourceCache<Blob>> = Arc::new(ResourceCache::new("NWP", 100));
        assert!(cache.checkout(&key(SourceId::new(), 0)).is_none());
    }

    #[test]
    fn test_unsized_items() {
        use wxflow_core::{DataItem, LineValues};

        let cache: Arc<ResourceCache<dyn DataItem>> = Arc::new(ResourceCache::new("NWP", 100));
        let k = key(SourceId::new(), 0);
        let item: Arc<dyn DataItem> = Arc::new(LineValues {
            values: vec![1.0, 2.0],
            thickness: None,
        });
        assert!(cache.try_store(k.clone(), item));
        let handle = cache.checkout(&k).unwrap();
        assert_eq!(handle.as_line_values().map(|v| v.values.len()), Some(2));
    }
}
