//! Network-boundary response cache.
//!
//! Separate from the entity store: this layer caches whole HTTP responses
//! at the edge of the process, classified by URL shape and served by one
//! of three strategies (cache-first, network-first,
//! stale-while-revalidate) with per-class TTL and count bounds.

mod class;
mod layer;
mod storage;
mod strategy;

pub use class::{should_intercept, ResourceClass};
pub use layer::{CacheSizes, ControlHandle, ControlMessage, EdgeCache, Intercepted};
pub use storage::{CachedResponse, EdgeResponse, EdgeStorage};
