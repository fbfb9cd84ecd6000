//! Durable queue of pending local mutations awaiting replay.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use std::sync::Arc;
use tracing::debug;

use super::db::Database;
use super::entity::EntityKind;

/// The write being replayed against the remote API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction {
  Create,
  Update,
  Delete,
}

impl QueueAction {
  pub fn as_str(&self) -> &'static str {
    match self {
      QueueAction::Create => "CREATE",
      QueueAction::Update => "UPDATE",
      QueueAction::Delete => "DELETE",
    }
  }

  fn parse(s: &str) -> Option<Self> {
    match s {
      "CREATE" => Some(QueueAction::Create),
      "UPDATE" => Some(QueueAction::Update),
      "DELETE" => Some(QueueAction::Delete),
      _ => None,
    }
  }
}

/// One staged mutation. `synced` flips to 1 exactly once, on successful
/// replay; `retries` only ever increments.
#[derive(Debug, Clone)]
pub struct QueueItem {
  pub id: i64,
  pub action: QueueAction,
  pub kind: EntityKind,
  pub entity_id: String,
  pub payload: serde_json::Value,
  pub timestamp: String,
  pub retries: i64,
  pub synced: i64,
}

#[derive(Clone)]
pub struct MutationQueue {
  db: Arc<Database>,
}

impl MutationQueue {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Stage a mutation for later replay. Returns the queue id.
  pub fn enqueue(
    &self,
    action: QueueAction,
    kind: EntityKind,
    entity_id: &str,
    payload: &serde_json::Value,
  ) -> Result<i64> {
    let conn = self.db.conn()?;
    let data =
      serde_json::to_vec(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    conn
      .execute(
        "INSERT INTO sync_queue (action, entity_type, entity_id, payload, timestamp, retries, synced)
         VALUES (?, ?, ?, ?, ?, 0, 0)",
        params![
          action.as_str(),
          kind.as_str(),
          entity_id,
          data,
          Utc::now().to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation: {}", e))?;

    let id = conn.last_insert_rowid();
    debug!(id, action = action.as_str(), kind = %kind, entity_id, "queued mutation");
    Ok(id)
  }

  /// All open items, in insertion order.
  pub fn pending(&self) -> Result<Vec<QueueItem>> {
    self.select(
      "SELECT id, action, entity_type, entity_id, payload, timestamp, retries, synced
       FROM sync_queue WHERE synced = 0 ORDER BY id",
    )
  }

  /// Every item, completed ones included. Completed items linger until
  /// the sweep runs.
  pub fn all(&self) -> Result<Vec<QueueItem>> {
    self.select(
      "SELECT id, action, entity_type, entity_id, payload, timestamp, retries, synced
       FROM sync_queue ORDER BY id",
    )
  }

  fn select(&self, sql: &str) -> Result<Vec<QueueItem>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let items: Vec<QueueItem> = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, Vec<u8>>(4)?,
          row.get::<_, String>(5)?,
          row.get::<_, i64>(6)?,
          row.get::<_, i64>(7)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query queue: {}", e))?
      .filter_map(|r| r.ok())
      .filter_map(
        |(id, action, kind, entity_id, payload, timestamp, retries, synced)| {
          Some(QueueItem {
            id,
            action: QueueAction::parse(&action)?,
            kind: EntityKind::parse(&kind)?,
            entity_id,
            payload: serde_json::from_slice(&payload).ok()?,
            timestamp,
            retries,
            synced,
          })
        },
      )
      .collect();

    Ok(items)
  }

  pub fn pending_count(&self) -> Result<i64> {
    let conn = self.db.conn()?;
    conn
      .query_row("SELECT COUNT(*) FROM sync_queue WHERE synced = 0", [], |row| {
        row.get(0)
      })
      .map_err(|e| eyre!("Failed to count queue: {}", e))
  }

  /// Mark an item as replayed. Completed items are eligible for the sweep.
  pub fn mark_done(&self, id: i64) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute("UPDATE sync_queue SET synced = 1 WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to mark queue item done: {}", e))?;
    debug!(id, "queue item completed");
    Ok(())
  }

  pub fn increment_retry(&self, id: i64) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "UPDATE sync_queue SET retries = retries + 1 WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to increment retry count: {}", e))?;
    Ok(())
  }

  /// Garbage-collect completed items.
  pub fn sweep_completed(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    let swept = conn
      .execute("DELETE FROM sync_queue WHERE synced = 1", [])
      .map_err(|e| eyre!("Failed to sweep queue: {}", e))?;
    if swept > 0 {
      debug!(swept, "swept completed queue items");
    }
    Ok(swept)
  }

  /// Remove a single item outright. The escape hatch for a permanently
  /// failing mutation that would otherwise retry forever.
  pub fn remove(&self, id: i64) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute("DELETE FROM sync_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove queue item: {}", e))?;
    Ok(())
  }

  /// Wipe the queue. Used by logout.
  pub fn clear_all(&self) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute("DELETE FROM sync_queue", [])
      .map_err(|e| eyre!("Failed to clear queue: {}", e))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn queue() -> MutationQueue {
    MutationQueue::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  #[test]
  fn test_enqueue_and_pending_order() {
    let queue = queue();
    queue
      .enqueue(QueueAction::Create, EntityKind::Gem, "temp-1", &serde_json::json!({"name": "a"}))
      .unwrap();
    queue
      .enqueue(QueueAction::Update, EntityKind::Krawl, "k1", &serde_json::json!({"title": "b"}))
      .unwrap();

    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].entity_id, "temp-1");
    assert_eq!(pending[0].action, QueueAction::Create);
    assert_eq!(pending[1].kind, EntityKind::Krawl);
    assert!(pending[0].id < pending[1].id);
  }

  #[test]
  fn test_mark_done_removes_from_pending() {
    let queue = queue();
    let id = queue
      .enqueue(QueueAction::Create, EntityKind::Gem, "temp-1", &serde_json::json!({}))
      .unwrap();

    queue.mark_done(id).unwrap();
    assert!(queue.pending().unwrap().is_empty());
    assert_eq!(queue.pending_count().unwrap(), 0);
  }

  #[test]
  fn test_retry_only_increments() {
    let queue = queue();
    let id = queue
      .enqueue(QueueAction::Delete, EntityKind::Gem, "g1", &serde_json::json!({}))
      .unwrap();

    queue.increment_retry(id).unwrap();
    queue.increment_retry(id).unwrap();

    let pending = queue.pending().unwrap();
    assert_eq!(pending[0].retries, 2);
    assert_eq!(pending[0].synced, 0);
  }

  #[test]
  fn test_sweep_only_removes_completed() {
    let queue = queue();
    let done = queue
      .enqueue(QueueAction::Create, EntityKind::Gem, "temp-1", &serde_json::json!({}))
      .unwrap();
    queue
      .enqueue(QueueAction::Create, EntityKind::Gem, "temp-2", &serde_json::json!({}))
      .unwrap();

    queue.mark_done(done).unwrap();
    assert_eq!(queue.sweep_completed().unwrap(), 1);
    assert_eq!(queue.pending().unwrap().len(), 1);
  }

  #[test]
  fn test_remove_drops_poison_item() {
    let queue = queue();
    let id = queue
      .enqueue(QueueAction::Update, EntityKind::Gem, "g1", &serde_json::json!({}))
      .unwrap();
    queue.remove(id).unwrap();
    assert!(queue.pending().unwrap().is_empty());
  }
}
