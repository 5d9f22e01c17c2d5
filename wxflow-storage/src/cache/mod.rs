//! Reference-counted resource caches.
//!
//! # Entry Lifecycle
//!
//! A computed item enters the cache through [`MemoryManager::store`] together
//! with the number of claimants waiting for it. Each claimant later turns its
//! reservation into a reference with [`MemoryManager::acquire`] and gives it
//! back with [`MemoryManager::release`]. An entry without references and
//! without reservations is *released*: it stays queryable and can be revived,
//! but it is the first to go when a later store needs room.
//!
//! # Example
//!
//! ```ignore
//! let cache = Arc::new(ResourceCache::<dyn DataItem>::new("NWP", 1024 * 1024));
//! cache.try_store(key.clone(), grid);
//! let handle = cache.checkout(&key).expect("stored above");
//! // ... render ...
//! drop(handle); // releases the reference
//! ```

pub mod handle;
pub mod lru;
pub mod owner_key;
pub mod traits;

pub use handle::ResourceHandle;
pub use lru::{CacheSnapshot, EntrySnapshot, EntryState, ResourceCache};
pub use owner_key::OwnerScopedKey;
pub use traits::{CacheStats, MemoryManager};
