//! Key/value settings store (current user id, feature toggles, etc).

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

use super::db::Database;

pub const CURRENT_USER_KEY: &str = "currentUserId";

#[derive(Clone)]
pub struct Settings {
  db: Arc<Database>,
}

impl Settings {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    let conn = self.db.conn()?;
    let data =
      serde_json::to_string(value).map_err(|e| eyre!("Failed to serialize setting: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?, ?, ?)",
        params![key, data, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to store setting: {}", e))?;

    Ok(())
  }

  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare("SELECT value FROM settings WHERE key = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let raw: Option<String> = stmt.query_row(params![key], |row| row.get(0)).ok();

    match raw {
      Some(raw) => {
        let value =
          serde_json::from_str(&raw).map_err(|e| eyre!("Failed to parse setting: {}", e))?;
        Ok(Some(value))
      }
      None => Ok(None),
    }
  }

  pub fn delete(&self, key: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute("DELETE FROM settings WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete setting: {}", e))?;
    Ok(())
  }

  /// Id of the locally signed-in user, if any.
  pub fn current_user_id(&self) -> Result<Option<String>> {
    self.get(CURRENT_USER_KEY)
  }

  pub fn set_current_user_id(&self, user_id: &str) -> Result<()> {
    self.set(CURRENT_USER_KEY, &user_id)
  }

  pub fn clear_current_user(&self) -> Result<()> {
    self.delete(CURRENT_USER_KEY)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn settings() -> Settings {
    Settings::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  #[test]
  fn test_set_get_delete_roundtrip() {
    let settings = settings();
    settings.set("mapStyle", &"dark").unwrap();
    assert_eq!(settings.get::<String>("mapStyle").unwrap().unwrap(), "dark");

    settings.delete("mapStyle").unwrap();
    assert!(settings.get::<String>("mapStyle").unwrap().is_none());
  }

  #[test]
  fn test_current_user_tracking() {
    let settings = settings();
    assert!(settings.current_user_id().unwrap().is_none());

    settings.set_current_user_id("u1").unwrap();
    assert_eq!(settings.current_user_id().unwrap().unwrap(), "u1");

    settings.clear_current_user().unwrap();
    assert!(settings.current_user_id().unwrap().is_none());
  }
}
