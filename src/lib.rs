//! Offline-first synchronization and caching engine.
//!
//! Keeps a client application working when the network is absent or
//! degraded:
//!
//! - a persistent SQLite mirror of server entities plus a durable
//!   mutation queue with retry/replay semantics ([`store`], [`engine`])
//! - a connectivity monitor that distinguishes "the device has a
//!   network" from "the API origin is actually reachable"
//!   ([`connectivity`])
//! - a credential refresh manager that deduplicates concurrent refresh
//!   attempts ([`auth`]) and a fetch gateway that transparently retries
//!   a 401 once after refreshing ([`gateway`])
//! - an edge response cache applying per-class strategies with TTL and
//!   count-bounded eviction ([`edge`])
//!
//! [`engine::SyncEngine`] is the front door for entity reads and writes;
//! [`edge::EdgeCache`] intercepts at the network boundary.

pub mod auth;
pub mod config;
pub mod connectivity;
pub mod edge;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod store;

pub use config::Config;
pub use engine::{ReplaySummary, SyncEngine};
pub use error::Fault;

use tracing_subscriber::EnvFilter;

/// Install the default stderr subscriber, filtered by `RUST_LOG`.
/// Host binaries call this once at startup; embedding applications that
/// bring their own subscriber skip it.
pub fn init_logging() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_writer(std::io::stderr)
    .init();
}
