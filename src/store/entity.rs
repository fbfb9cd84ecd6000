//! Server-shaped entity records plus the engine-owned sync metadata.

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// The closed set of entity kinds the engine mirrors locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
  Gem,
  Krawl,
  User,
}

impl EntityKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      EntityKind::Gem => "gem",
      EntityKind::Krawl => "krawl",
      EntityKind::User => "user",
    }
  }

  /// Remote collection path, e.g. "/gems".
  pub fn collection_path(&self) -> &'static str {
    match self {
      EntityKind::Gem => "/gems",
      EntityKind::Krawl => "/krawls",
      EntityKind::User => "/users",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "gem" => Some(EntityKind::Gem),
      "krawl" => Some(EntityKind::Krawl),
      "user" => Some(EntityKind::User),
      _ => None,
    }
  }
}

impl std::fmt::Display for EntityKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Engine-owned sync state carried on every cached entity.
///
/// `synced == 0` means locally modified and pending replay; such a record
/// must have an open item in the mutation queue (or be a not-yet-submitted
/// creation). `synced == 1` means confirmed to match the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMeta {
  #[serde(rename = "_synced", default = "synced_default")]
  pub synced: i64,
  #[serde(rename = "_lastSynced", default, skip_serializing_if = "Option::is_none")]
  pub last_synced: Option<String>,
}

fn synced_default() -> i64 {
  1
}

impl SyncMeta {
  pub fn confirmed() -> Self {
    Self {
      synced: 1,
      last_synced: Some(Utc::now().to_rfc3339()),
    }
  }

  pub fn pending() -> Self {
    Self {
      synced: 0,
      last_synced: None,
    }
  }
}

/// Trait for records the persistent store can mirror.
///
/// Mirrors what the store needs for keying and secondary indexes; the
/// payload itself travels as serialized JSON.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned {
  fn kind() -> EntityKind;

  /// Primary key (server id, or a `temp-` id for offline creations)
  fn id(&self) -> String;

  /// Replace the primary key. Used when synthesizing a temp-id record for
  /// an offline creation.
  fn set_id(&mut self, id: String);

  /// Secondary index: creating/owning user, when the kind has one
  fn owner_id(&self) -> Option<String>;

  /// Secondary index: domain status field, when the kind has one
  fn status(&self) -> Option<String>;

  fn sync_meta(&self) -> &SyncMeta;

  fn sync_meta_mut(&mut self) -> &mut SyncMeta;

  /// Text the local substring search matches against
  fn searchable_text(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
  pub latitude: f64,
  pub longitude: f64,
}

/// A point of interest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gem {
  pub gem_id: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  pub location: Location,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub founder_id: Option<String>,
  #[serde(default)]
  pub vouch_count: i64,
  #[serde(default)]
  pub average_rating: f64,
  #[serde(default)]
  pub rating_count: i64,
  pub approval_status: String,
  pub lifecycle_status: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tags: Option<Vec<String>>,
  pub created_at: String,
  pub updated_at: String,
  #[serde(flatten)]
  pub sync: SyncMeta,
}

/// A curated route of gems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Krawl {
  pub krawl_id: String,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  pub creator_id: String,
  pub visibility: String,
  #[serde(default)]
  pub average_rating: f64,
  #[serde(default)]
  pub rating_count: i64,
  pub created_at: String,
  pub updated_at: String,
  #[serde(flatten)]
  pub sync: SyncMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
  pub user_id: String,
  pub username: String,
  pub email: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub bio: Option<String>,
  #[serde(default)]
  pub creator_score: i64,
  #[serde(default)]
  pub reputation_tier: String,
  pub created_at: String,
  #[serde(flatten)]
  pub sync: SyncMeta,
}

impl Entity for Gem {
  fn kind() -> EntityKind {
    EntityKind::Gem
  }

  fn id(&self) -> String {
    self.gem_id.clone()
  }

  fn set_id(&mut self, id: String) {
    self.gem_id = id;
  }

  fn owner_id(&self) -> Option<String> {
    self.founder_id.clone()
  }

  fn status(&self) -> Option<String> {
    Some(self.approval_status.clone())
  }

  fn sync_meta(&self) -> &SyncMeta {
    &self.sync
  }

  fn sync_meta_mut(&mut self) -> &mut SyncMeta {
    &mut self.sync
  }

  fn searchable_text(&self) -> String {
    match &self.description {
      Some(d) => format!("{} {}", self.name, d),
      None => self.name.clone(),
    }
  }
}

impl Entity for Krawl {
  fn kind() -> EntityKind {
    EntityKind::Krawl
  }

  fn id(&self) -> String {
    self.krawl_id.clone()
  }

  fn set_id(&mut self, id: String) {
    self.krawl_id = id;
  }

  fn owner_id(&self) -> Option<String> {
    Some(self.creator_id.clone())
  }

  fn status(&self) -> Option<String> {
    Some(self.visibility.clone())
  }

  fn sync_meta(&self) -> &SyncMeta {
    &self.sync
  }

  fn sync_meta_mut(&mut self) -> &mut SyncMeta {
    &mut self.sync
  }

  fn searchable_text(&self) -> String {
    match &self.description {
      Some(d) => format!("{} {}", self.title, d),
      None => self.title.clone(),
    }
  }
}

impl Entity for User {
  fn kind() -> EntityKind {
    EntityKind::User
  }

  fn id(&self) -> String {
    self.user_id.clone()
  }

  fn set_id(&mut self, id: String) {
    self.user_id = id;
  }

  fn owner_id(&self) -> Option<String> {
    None
  }

  fn status(&self) -> Option<String> {
    None
  }

  fn sync_meta(&self) -> &SyncMeta {
    &self.sync
  }

  fn sync_meta_mut(&mut self) -> &mut SyncMeta {
    &mut self.sync
  }

  fn searchable_text(&self) -> String {
    self.username.clone()
  }
}

/// Client-synthesized id for an entity created while offline, pending
/// server assignment of a permanent one.
pub fn temp_id() -> String {
  format!("temp-{}", Utc::now().timestamp_millis())
}

/// True if `id` matches the `temp-<number>` pattern.
pub fn is_temp_id(id: &str) -> bool {
  id
    .strip_prefix("temp-")
    .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_gem() -> Gem {
    Gem {
      gem_id: "g1".to_string(),
      name: "Hidden Courtyard".to_string(),
      description: Some("quiet spot behind the market".to_string()),
      location: Location {
        latitude: 52.52,
        longitude: 13.405,
      },
      founder_id: Some("u1".to_string()),
      vouch_count: 3,
      average_rating: 4.5,
      rating_count: 2,
      approval_status: "approved".to_string(),
      lifecycle_status: "open".to_string(),
      tags: None,
      created_at: "2025-01-01T00:00:00Z".to_string(),
      updated_at: "2025-01-02T00:00:00Z".to_string(),
      sync: SyncMeta::confirmed(),
    }
  }

  #[test]
  fn test_sync_meta_serializes_with_underscore_names() {
    let gem = sample_gem();
    let json = serde_json::to_value(&gem).unwrap();
    assert_eq!(json["_synced"], 1);
    assert!(json["_lastSynced"].is_string());
  }

  #[test]
  fn test_server_payload_without_sync_fields_deserializes() {
    // Server responses never carry the engine-owned fields
    let json = r#"{
      "gem_id": "g2",
      "name": "Rooftop",
      "location": {"latitude": 1.0, "longitude": 2.0},
      "approval_status": "pending",
      "lifecycle_status": "open",
      "created_at": "2025-01-01T00:00:00Z",
      "updated_at": "2025-01-01T00:00:00Z"
    }"#;
    let gem: Gem = serde_json::from_str(json).unwrap();
    assert_eq!(gem.sync.synced, 1);
    assert!(gem.sync.last_synced.is_none());
  }

  #[test]
  fn test_temp_id_pattern() {
    let id = temp_id();
    assert!(is_temp_id(&id));
    assert!(is_temp_id("temp-1735000000000"));
    assert!(!is_temp_id("temp-"));
    assert!(!is_temp_id("temp-abc"));
    assert!(!is_temp_id("g1"));
  }

  #[test]
  fn test_entity_kind_roundtrip() {
    for kind in [EntityKind::Gem, EntityKind::Krawl, EntityKind::User] {
      assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
    }
    assert_eq!(EntityKind::parse("rating"), None);
  }
}
