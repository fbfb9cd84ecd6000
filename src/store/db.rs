//! SQLite connection handling and versioned, additive migrations.

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// Current schema version, stamped into `PRAGMA user_version`.
///
/// Migrations are additive only (new tables and indexes); there is no
/// destructive migration path. Every step is idempotent so concurrent
/// opens from multiple processes cannot corrupt the schema.
pub const SCHEMA_VERSION: i32 = 2;

/// v1: entity mirror, mutation queue, settings
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    data BLOB NOT NULL,
    owner_id TEXT,
    status TEXT,
    synced INTEGER NOT NULL DEFAULT 1,
    last_synced TEXT,
    PRIMARY KEY (entity_type, entity_id)
);

CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    payload BLOB NOT NULL,
    timestamp TEXT NOT NULL,
    retries INTEGER NOT NULL DEFAULT 0,
    synced INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// v2: secondary indexes for owner/status/synced lookups
const SCHEMA_V2: &str = r#"
CREATE INDEX IF NOT EXISTS idx_entities_owner ON entities(entity_type, owner_id);
CREATE INDEX IF NOT EXISTS idx_entities_status ON entities(entity_type, status);
CREATE INDEX IF NOT EXISTS idx_entities_synced ON entities(entity_type, synced);
CREATE INDEX IF NOT EXISTS idx_sync_queue_synced ON sync_queue(synced);
CREATE INDEX IF NOT EXISTS idx_sync_queue_timestamp ON sync_queue(timestamp);
"#;

const MIGRATIONS: &[(i32, &str)] = &[(1, SCHEMA_V1), (2, SCHEMA_V2)];

/// Shared handle to the local database.
///
/// All entity, queue and settings access goes through this one connection;
/// SQLite's own transactional guarantees are what make it safe to share
/// across processes.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the database at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// In-memory database, used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("krawl").join("sync.db"))
  }

  /// Apply every migration above the stored `user_version`.
  ///
  /// A concurrent open from another process can hold the write lock past
  /// the busy timeout; that is a blocked upgrade, reported and survived -
  /// the steps are idempotent and whoever holds the lock applies them.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn()?;

    let current: i32 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

    if current >= SCHEMA_VERSION {
      return Ok(());
    }
    debug!(from = current, to = SCHEMA_VERSION, "migrating database schema");

    for (version, sql) in MIGRATIONS {
      if *version <= current {
        continue;
      }
      match conn.execute_batch(sql) {
        Ok(()) => {}
        Err(rusqlite::Error::SqliteFailure(e, _))
          if e.code == rusqlite::ErrorCode::DatabaseBusy =>
        {
          warn!(version, "database upgrade blocked by another process");
          return Ok(());
        }
        Err(e) => return Err(eyre!("Failed to run migration v{}: {}", version, e)),
      }
    }

    conn
      .pragma_update(None, "user_version", SCHEMA_VERSION)
      .map_err(|e| eyre!("Failed to stamp schema version: {}", e))?;

    Ok(())
  }

  /// Lock the underlying connection.
  pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_migrations_stamp_version() {
    let db = Database::open_in_memory().unwrap();
    let conn = db.conn().unwrap();
    let version: i32 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .unwrap();
    assert_eq!(version, SCHEMA_VERSION);
  }

  #[test]
  fn test_migrations_are_idempotent() {
    let db = Database::open_in_memory().unwrap();
    // Re-running on an up-to-date schema is a no-op
    db.run_migrations().unwrap();
    db.run_migrations().unwrap();
  }

  #[test]
  fn test_expected_tables_exist() {
    let db = Database::open_in_memory().unwrap();
    let conn = db.conn().unwrap();
    for table in ["entities", "sync_queue", "settings"] {
      let count: i64 = conn
        .query_row(
          "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
          [table],
          |row| row.get(0),
        )
        .unwrap();
      assert_eq!(count, 1, "missing table {table}");
    }
  }
}
