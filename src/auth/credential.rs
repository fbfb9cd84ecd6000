//! Credential shape and two-scope storage.
//!
//! Exactly one copy of the credential is authoritative at a time, held in
//! either the durable scope (a file, survives restarts - "remember me") or
//! the session scope (in-memory, dies with the process). Never both.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
  pub id: String,
  pub email: String,
  pub username: String,
}

/// The bearer credential attached to outbound requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
  pub token: String,
  pub user: AuthUser,
}

pub struct CredentialStore {
  /// Durable scope backing file
  path: PathBuf,
  /// Session scope
  session: Mutex<Option<Credential>>,
}

impl CredentialStore {
  pub fn new(path: Option<PathBuf>) -> Result<Self> {
    let path = match path {
      Some(p) => p,
      None => Self::default_path()?,
    };
    Ok(Self {
      path,
      session: Mutex::new(None),
    })
  }

  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;
    Ok(data_dir.join("krawl").join("auth.json"))
  }

  /// The authoritative credential: durable scope first, then session.
  pub fn load(&self) -> Option<Credential> {
    if let Some(cred) = self.load_durable() {
      return Some(cred);
    }
    self.session.lock().ok()?.clone()
  }

  pub fn token(&self) -> Option<String> {
    self.load().map(|c| c.token)
  }

  fn load_durable(&self) -> Option<Credential> {
    let raw = std::fs::read_to_string(&self.path).ok()?;
    match serde_json::from_str(&raw) {
      Ok(cred) => Some(cred),
      Err(e) => {
        warn!("Stored credential is unreadable, ignoring: {}", e);
        None
      }
    }
  }

  /// Store a credential in exactly one scope, clearing the other.
  pub fn set(&self, credential: Credential, remember: bool) -> Result<()> {
    if remember {
      if let Some(parent) = self.path.parent() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create credential directory: {}", e))?;
      }
      let payload = serde_json::to_string(&credential)
        .map_err(|e| eyre!("Failed to serialize credential: {}", e))?;
      std::fs::write(&self.path, payload)
        .map_err(|e| eyre!("Failed to write credential file: {}", e))?;

      if let Ok(mut session) = self.session.lock() {
        *session = None;
      }
    } else {
      let mut session = self
        .session
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      *session = Some(credential);
      drop(session);

      self.remove_durable();
    }
    Ok(())
  }

  /// Replace only the token, preserving the user and whichever scope is
  /// currently authoritative. Refresh never changes scope.
  pub fn update_token(&self, token: &str) -> Result<()> {
    if let Some(mut cred) = self.load_durable() {
      cred.token = token.to_string();
      return self.set(cred, true);
    }

    let mut session = self
      .session
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if let Some(cred) = session.as_mut() {
      cred.token = token.to_string();
    }
    Ok(())
  }

  /// Clear both scopes (logout, irrecoverable refresh failure).
  pub fn clear(&self) {
    self.remove_durable();
    if let Ok(mut session) = self.session.lock() {
      *session = None;
    }
  }

  fn remove_durable(&self) {
    if self.path.exists() {
      if let Err(e) = std::fs::remove_file(&self.path) {
        warn!("Failed to remove credential file: {}", e);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn user() -> AuthUser {
    AuthUser {
      id: "u1".to_string(),
      email: "u1@example.com".to_string(),
      username: "u1".to_string(),
    }
  }

  fn store() -> (CredentialStore, tempdir::TempDirGuard) {
    let guard = tempdir::guard();
    let store = CredentialStore::new(Some(guard.path.join("auth.json"))).unwrap();
    (store, guard)
  }

  // Minimal scoped temp dir so tests do not touch the real data dir.
  mod tempdir {
    use std::path::PathBuf;

    pub struct TempDirGuard {
      pub path: PathBuf,
    }

    impl Drop for TempDirGuard {
      fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
      }
    }

    pub fn guard() -> TempDirGuard {
      let path = std::env::temp_dir().join(format!(
        "krawl-sync-test-{}-{:?}",
        std::process::id(),
        std::thread::current().id()
      ));
      std::fs::create_dir_all(&path).unwrap();
      TempDirGuard { path }
    }
  }

  #[test]
  fn test_session_scope_only() {
    let (store, _guard) = store();
    let cred = Credential {
      token: "tok".to_string(),
      user: user(),
    };
    store.set(cred.clone(), false).unwrap();

    assert_eq!(store.load(), Some(cred));
    assert!(!store.path.exists());
  }

  #[test]
  fn test_durable_scope_clears_session() {
    let (store, _guard) = store();
    store
      .set(
        Credential {
          token: "session-tok".to_string(),
          user: user(),
        },
        false,
      )
      .unwrap();
    store
      .set(
        Credential {
          token: "durable-tok".to_string(),
          user: user(),
        },
        true,
      )
      .unwrap();

    assert!(store.path.exists());
    assert_eq!(store.token(), Some("durable-tok".to_string()));
    assert!(store.session.lock().unwrap().is_none());
  }

  #[test]
  fn test_update_token_preserves_scope() {
    let (store, _guard) = store();
    store
      .set(
        Credential {
          token: "old".to_string(),
          user: user(),
        },
        true,
      )
      .unwrap();

    store.update_token("new").unwrap();
    assert_eq!(store.token(), Some("new".to_string()));
    assert!(store.path.exists());
  }

  #[test]
  fn test_clear_wipes_both_scopes() {
    let (store, _guard) = store();
    store
      .set(
        Credential {
          token: "tok".to_string(),
          user: user(),
        },
        true,
      )
      .unwrap();

    store.clear();
    assert!(store.load().is_none());
    assert!(!store.path.exists());
  }
}
