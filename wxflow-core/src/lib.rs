//! wxflow Core - Request Keys and Data Items
//!
//! Data types shared by the cache and pipeline crates: canonical request
//! keys, the data item trait with its tagged variants, source identifiers,
//! the error taxonomy and configuration. This crate contains no scheduling
//! or caching behaviour.

pub mod config;
pub mod error;
pub mod fields;
pub mod identity;
pub mod item;
pub mod request;

pub use config::*;
pub use error::*;
pub use identity::*;
pub use item::*;
pub use request::*;
