//! Durable local storage: the entity mirror, the mutation queue and the
//! settings store, all backed by one versioned SQLite database.

mod db;
mod entities;
pub mod entity;
mod queue;
mod settings;

pub use db::{Database, SCHEMA_VERSION};
pub use entities::{EntityStore, StoreStats};
pub use entity::{is_temp_id, temp_id, Entity, EntityKind, Gem, Krawl, Location, SyncMeta, User};
pub use queue::{MutationQueue, QueueAction, QueueItem};
pub use settings::{Settings, CURRENT_USER_KEY};
