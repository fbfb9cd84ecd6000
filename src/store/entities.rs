//! Persistent mirror of server entities.
//!
//! Every row carries the serialized entity plus denormalized columns for
//! the secondary lookups (owner, status, synced). `put` represents
//! confirmed-from-server state and always stamps `_synced = 1`; locally
//! dirty records go through `stage_local`, which stamps `_synced = 0`.

use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use std::sync::Arc;
use tracing::debug;

use super::db::Database;
use super::entity::{Entity, EntityKind, SyncMeta};

#[derive(Clone)]
pub struct EntityStore {
  db: Arc<Database>,
}

/// Per-store row counts, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
  pub gems: i64,
  pub krawls: i64,
  pub users: i64,
  pub queue: i64,
}

impl EntityStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Store a confirmed-from-server entity, stamping `_synced = 1`.
  pub fn put<T: Entity>(&self, entity: &T) -> Result<()> {
    let mut entity = entity.clone();
    *entity.sync_meta_mut() = SyncMeta::confirmed();
    self.write_row(&entity)
  }

  /// Store a batch atomically - either every entity lands or none do, so
  /// listings are never half-updated.
  pub fn put_many<T: Entity>(&self, entities: &[T]) -> Result<()> {
    let conn = self.db.conn()?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for entity in entities {
      let mut entity = entity.clone();
      *entity.sync_meta_mut() = SyncMeta::confirmed();
      if let Err(e) = Self::insert(&conn, &entity) {
        let _ = conn.execute("ROLLBACK", []);
        return Err(e);
      }
    }

    conn
      .execute("COMMIT", [])
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    debug!(kind = %T::kind(), count = entities.len(), "stored entity batch");
    Ok(())
  }

  /// Store a locally-created or locally-modified entity, stamping
  /// `_synced = 0`. The caller is responsible for the matching mutation
  /// queue entry.
  pub fn stage_local<T: Entity>(&self, entity: &T) -> Result<()> {
    let mut entity = entity.clone();
    *entity.sync_meta_mut() = SyncMeta::pending();
    self.write_row(&entity)
  }

  fn write_row<T: Entity>(&self, entity: &T) -> Result<()> {
    let conn = self.db.conn()?;
    Self::insert(&conn, entity)
  }

  fn insert<T: Entity>(conn: &rusqlite::Connection, entity: &T) -> Result<()> {
    let data =
      serde_json::to_vec(entity).map_err(|e| eyre!("Failed to serialize entity: {}", e))?;
    let meta = entity.sync_meta();

    conn
      .execute(
        "INSERT OR REPLACE INTO entities
           (entity_type, entity_id, data, owner_id, status, synced, last_synced)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          T::kind().as_str(),
          entity.id(),
          data,
          entity.owner_id(),
          entity.status(),
          meta.synced,
          meta.last_synced,
        ],
      )
      .map_err(|e| eyre!("Failed to store entity: {}", e))?;

    Ok(())
  }

  pub fn get<T: Entity>(&self, id: &str) -> Result<Option<T>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare("SELECT data FROM entities WHERE entity_type = ? AND entity_id = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let data: Option<Vec<u8>> = stmt
      .query_row(params![T::kind().as_str(), id], |row| row.get(0))
      .ok();

    match data {
      Some(data) => {
        let entity: T = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize entity: {}", e))?;
        Ok(Some(entity))
      }
      None => Ok(None),
    }
  }

  pub fn get_all<T: Entity>(&self) -> Result<Vec<T>> {
    self.select::<T>("SELECT data FROM entities WHERE entity_type = ?", &[&T::kind().as_str()])
  }

  /// Secondary lookup by owning user.
  pub fn by_owner<T: Entity>(&self, owner_id: &str) -> Result<Vec<T>> {
    self.select::<T>(
      "SELECT data FROM entities WHERE entity_type = ? AND owner_id = ?",
      &[&T::kind().as_str(), &owner_id],
    )
  }

  /// Secondary lookup by domain status.
  pub fn by_status<T: Entity>(&self, status: &str) -> Result<Vec<T>> {
    self.select::<T>(
      "SELECT data FROM entities WHERE entity_type = ? AND status = ?",
      &[&T::kind().as_str(), &status],
    )
  }

  /// Records still awaiting replay (`_synced = 0`).
  pub fn unsynced<T: Entity>(&self) -> Result<Vec<T>> {
    self.select::<T>(
      "SELECT data FROM entities WHERE entity_type = ? AND synced = 0",
      &[&T::kind().as_str()],
    )
  }

  fn select<T: Entity>(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<T>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let entities: Vec<T> = stmt
      .query_map(args, |row| {
        let data: Vec<u8> = row.get(0)?;
        Ok(data)
      })
      .map_err(|e| eyre!("Failed to query entities: {}", e))?
      .filter_map(|r| r.ok())
      .filter_map(|data| serde_json::from_slice(&data).ok())
      .collect();

    Ok(entities)
  }

  /// Case-insensitive substring search over the entity's searchable text.
  pub fn search<T: Entity>(&self, query: &str) -> Result<Vec<T>> {
    let needle = query.to_lowercase();
    let all = self.get_all::<T>()?;
    Ok(
      all
        .into_iter()
        .filter(|e| e.searchable_text().to_lowercase().contains(&needle))
        .collect(),
    )
  }

  pub fn delete<T: Entity>(&self, id: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "DELETE FROM entities WHERE entity_type = ? AND entity_id = ?",
        params![T::kind().as_str(), id],
      )
      .map_err(|e| eyre!("Failed to delete entity: {}", e))?;
    Ok(())
  }

  pub fn count<T: Entity>(&self) -> Result<i64> {
    self.count_kind(T::kind())
  }

  fn count_kind(&self, kind: EntityKind) -> Result<i64> {
    let conn = self.db.conn()?;
    conn
      .query_row(
        "SELECT COUNT(*) FROM entities WHERE entity_type = ?",
        params![kind.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entities: {}", e))
  }

  /// Store a server response of unknown concrete type under its kind tag.
  /// Returns the stored entity's id. Used by queue replay, where items are
  /// kind-tagged rather than statically typed.
  pub fn put_value(&self, kind: EntityKind, value: &serde_json::Value) -> Result<String> {
    match kind {
      EntityKind::Gem => {
        let gem: super::entity::Gem = serde_json::from_value(value.clone())
          .map_err(|e| eyre!("Failed to deserialize gem: {}", e))?;
        self.put(&gem)?;
        Ok(gem.gem_id)
      }
      EntityKind::Krawl => {
        let krawl: super::entity::Krawl = serde_json::from_value(value.clone())
          .map_err(|e| eyre!("Failed to deserialize krawl: {}", e))?;
        self.put(&krawl)?;
        Ok(krawl.krawl_id)
      }
      EntityKind::User => {
        let user: super::entity::User = serde_json::from_value(value.clone())
          .map_err(|e| eyre!("Failed to deserialize user: {}", e))?;
        self.put(&user)?;
        Ok(user.user_id)
      }
    }
  }

  /// Flip a row to confirmed without replacing its contents. Used by queue
  /// replay when the server acknowledges a mutation with a bodiless
  /// response, so there is no fresh entity to `put`.
  pub fn mark_synced(&self, kind: EntityKind, id: &str) -> Result<()> {
    let conn = self.db.conn()?;

    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT data FROM entities WHERE entity_type = ? AND entity_id = ?",
        params![kind.as_str(), id],
        |row| row.get(0),
      )
      .ok();

    let Some(data) = data else { return Ok(()) };

    let mut value: serde_json::Value = serde_json::from_slice(&data)
      .map_err(|e| eyre!("Failed to deserialize entity: {}", e))?;
    let meta = SyncMeta::confirmed();
    if let Some(obj) = value.as_object_mut() {
      obj.insert("_synced".into(), serde_json::json!(meta.synced));
      obj.insert("_lastSynced".into(), serde_json::json!(meta.last_synced));
    }
    let data =
      serde_json::to_vec(&value).map_err(|e| eyre!("Failed to serialize entity: {}", e))?;

    conn
      .execute(
        "UPDATE entities SET data = ?, synced = ?, last_synced = ?
         WHERE entity_type = ? AND entity_id = ?",
        params![data, meta.synced, meta.last_synced, kind.as_str(), id],
      )
      .map_err(|e| eyre!("Failed to mark entity synced: {}", e))?;

    Ok(())
  }

  /// Delete a row by kind tag, without knowing the concrete type.
  pub fn delete_by_kind(&self, kind: EntityKind, id: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "DELETE FROM entities WHERE entity_type = ? AND entity_id = ?",
        params![kind.as_str(), id],
      )
      .map_err(|e| eyre!("Failed to delete entity: {}", e))?;
    Ok(())
  }

  /// Wipe every mirrored entity. Used by logout.
  pub fn clear_all(&self) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute("DELETE FROM entities", [])
      .map_err(|e| eyre!("Failed to clear entities: {}", e))?;
    Ok(())
  }

  pub fn stats(&self) -> Result<StoreStats> {
    let gems = self.count_kind(EntityKind::Gem)?;
    let krawls = self.count_kind(EntityKind::Krawl)?;
    let users = self.count_kind(EntityKind::User)?;

    let conn = self.db.conn()?;
    let queue: i64 = conn
      .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queue: {}", e))?;

    Ok(StoreStats {
      gems,
      krawls,
      users,
      queue,
    })
  }
}
