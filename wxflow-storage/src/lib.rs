//! wxflow Storage - Resource Caches
//!
//! Memory-managed caches for computed data items. Entries are keyed by the
//! producing source and its reduced request, reference counted, and evicted
//! least-recently-released-first once a configured memory ceiling is reached.

pub mod cache;

pub use cache::*;
