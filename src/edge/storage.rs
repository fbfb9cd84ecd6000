//! Durable response cache backing the edge layer.
//!
//! Responses live in one SQLite table keyed by `(cache_name, url)`, where
//! the cache name carries both the resource class and the generation tag.
//! Rowids give insertion order, which is what eviction and the FIFO bound
//! work from; re-inserting a URL refreshes its position.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// A response as the edge cache serves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl EdgeResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// A stored response plus the metadata freshness checks need.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: EdgeResponse,
  /// Strategy that stored this entry
  pub strategy: &'static str,
  pub fetched_on: DateTime<Utc>,
}

impl CachedResponse {
  pub fn new(response: EdgeResponse, strategy: &'static str) -> Self {
    Self {
      response,
      strategy,
      fetched_on: Utc::now(),
    }
  }

  pub fn is_fresh(&self, max_age: Duration) -> bool {
    let age = Utc::now().signed_duration_since(self.fetched_on);
    age < chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX)
  }
}

const EDGE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS edge_cache (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cache_name TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    strategy TEXT NOT NULL,
    fetched_on TEXT NOT NULL,
    UNIQUE (cache_name, url)
);

CREATE INDEX IF NOT EXISTS idx_edge_cache_name ON edge_cache(cache_name);
"#;

pub struct EdgeStorage {
  conn: Mutex<Connection>,
}

impl EdgeStorage {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;
    Self::init(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::init(conn)
  }

  fn init(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(EDGE_SCHEMA)
      .map_err(|e| eyre!("Failed to create cache schema: {}", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Cache lock poisoned: {}", e))
  }

  /// Store a response and enforce the cache's item bound, evicting the
  /// oldest entries first.
  pub fn put(
    &self,
    cache_name: &str,
    url: &str,
    entry: &CachedResponse,
    max_items: usize,
  ) -> Result<()> {
    let conn = self.conn()?;

    // DELETE before INSERT so a refreshed URL takes a new rowid and moves
    // to the back of the eviction order
    conn
      .execute(
        "DELETE FROM edge_cache WHERE cache_name = ? AND url = ?",
        params![cache_name, url],
      )
      .map_err(|e| eyre!("Failed to replace cache entry: {}", e))?;

    conn
      .execute(
        "INSERT INTO edge_cache (cache_name, url, status, content_type, body, strategy, fetched_on)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          cache_name,
          url,
          entry.response.status,
          entry.response.content_type,
          entry.response.body,
          entry.strategy,
          entry.fetched_on.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    let evicted = conn
      .execute(
        "DELETE FROM edge_cache WHERE cache_name = ?1 AND id NOT IN
           (SELECT id FROM edge_cache WHERE cache_name = ?1 ORDER BY id DESC LIMIT ?2)",
        params![cache_name, max_items as i64],
      )
      .map_err(|e| eyre!("Failed to enforce cache bound: {}", e))?;
    if evicted > 0 {
      debug!(cache_name, evicted, "evicted oldest cache entries");
    }

    Ok(())
  }

  pub fn get(&self, cache_name: &str, url: &str) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT status, content_type, body, strategy, fetched_on
         FROM edge_cache WHERE cache_name = ? AND url = ?",
      )
      .map_err(|e| eyre!("Failed to prepare cache query: {}", e))?;

    let row: Option<(u16, Option<String>, Vec<u8>, String, String)> = stmt
      .query_row(params![cache_name, url], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
        ))
      })
      .ok();

    let Some((status, content_type, body, strategy, fetched_on)) = row else {
      return Ok(None);
    };

    let fetched_on = DateTime::parse_from_rfc3339(&fetched_on)
      .map(|dt| dt.with_timezone(&Utc))
      .map_err(|e| eyre!("Failed to parse fetched_on '{}': {}", fetched_on, e))?;

    Ok(Some(CachedResponse {
      response: EdgeResponse {
        status,
        content_type,
        body,
      },
      strategy: strategy_tag(&strategy).unwrap_or_else(|| {
        warn!(url, tag = %strategy, "unrecognized strategy tag on cached row");
        STRATEGY_SWR
      }),
      fetched_on,
    }))
  }

  pub fn count(&self, cache_name: &str) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM edge_cache WHERE cache_name = ?",
        params![cache_name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;
    Ok(count as usize)
  }

  /// Cached URLs in insertion order, oldest first.
  pub fn urls(&self, cache_name: &str) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT url FROM edge_cache WHERE cache_name = ? ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare cache query: {}", e))?;

    let urls = stmt
      .query_map(params![cache_name], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache urls: {}", e))?
      .filter_map(|r| r.ok())
      .collect();
    Ok(urls)
  }

  pub fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT cache_name FROM edge_cache ORDER BY cache_name")
      .map_err(|e| eyre!("Failed to prepare cache query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache names: {}", e))?
      .filter_map(|r| r.ok())
      .collect();
    Ok(names)
  }

  pub fn delete_cache(&self, cache_name: &str) -> Result<usize> {
    let conn = self.conn()?;
    conn
      .execute("DELETE FROM edge_cache WHERE cache_name = ?", params![cache_name])
      .map_err(|e| eyre!("Failed to delete cache: {}", e))
  }

  /// Drop every generation except the named ones. Runs on activation,
  /// after the version tag changes.
  pub fn retain_generations(&self, keep: &[String]) -> Result<usize> {
    let stale: Vec<String> = self
      .cache_names()?
      .into_iter()
      .filter(|name| !keep.contains(name))
      .collect();

    let mut deleted = 0;
    for name in stale {
      deleted += self.delete_cache(&name)?;
      debug!(cache_name = %name, "deleted old cache generation");
    }
    Ok(deleted)
  }

  /// Delete entries older than `max_age`.
  pub fn sweep_expired(&self, cache_name: &str, max_age: Duration) -> Result<usize> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare("SELECT id, fetched_on FROM edge_cache WHERE cache_name = ?")
      .map_err(|e| eyre!("Failed to prepare cache query: {}", e))?;

    let rows: Vec<(i64, String)> = stmt
      .query_map(params![cache_name], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to scan cache entries: {}", e))?
      .filter_map(|r| r.ok())
      .collect();
    drop(stmt);

    let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    let now = Utc::now();
    let mut swept = 0;

    for (id, fetched_on) in rows {
      let expired = DateTime::parse_from_rfc3339(&fetched_on)
        .map(|dt| now.signed_duration_since(dt.with_timezone(&Utc)) >= max_age)
        // Unparseable timestamps count as expired
        .unwrap_or(true);
      if expired {
        conn
          .execute("DELETE FROM edge_cache WHERE id = ?", params![id])
          .map_err(|e| eyre!("Failed to delete expired entry: {}", e))?;
        swept += 1;
      }
    }

    if swept > 0 {
      debug!(cache_name, swept, "swept expired cache entries");
    }
    Ok(swept)
  }

  /// Wipe everything, every generation included.
  pub fn clear_all(&self) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute("DELETE FROM edge_cache", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
    Ok(())
  }
}

pub(crate) const STRATEGY_CACHE_FIRST: &str = "cache-first";
pub(crate) const STRATEGY_NETWORK_FIRST: &str = "network-first";
pub(crate) const STRATEGY_SWR: &str = "swr";

fn strategy_tag(s: &str) -> Option<&'static str> {
  match s {
    STRATEGY_CACHE_FIRST => Some(STRATEGY_CACHE_FIRST),
    STRATEGY_NETWORK_FIRST => Some(STRATEGY_NETWORK_FIRST),
    STRATEGY_SWR => Some(STRATEGY_SWR),
    _ => None,
  }
}
