//! Offline-first orchestrator tying the store, queue, gateway and
//! connectivity monitor together.
//!
//! Reads are cache-first: a non-empty store answers immediately while a
//! background revalidation refreshes it. Writes are remote-first: a
//! connectivity fault downgrades the write to an optimistic local record
//! plus a queued mutation, replayed once the server is reachable again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::auth::{CredentialStore, RefreshManager};
use crate::connectivity::ConnectivityMonitor;
use crate::error::Fault;
use crate::gateway::FetchGateway;
use crate::store::{
  temp_id, Entity, EntityStore, MutationQueue, QueueAction, QueueItem, Settings,
};

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
  pub processed: usize,
  pub succeeded: usize,
  pub failed: usize,
}

pub struct SyncEngine {
  gateway: Arc<FetchGateway>,
  connectivity: Arc<ConnectivityMonitor>,
  refresh: Arc<RefreshManager>,
  credentials: Arc<CredentialStore>,
  entities: EntityStore,
  queue: MutationQueue,
  settings: Settings,
  replay_interval: Duration,
  // Held for the duration of a replay pass; a concurrent trigger finds it
  // taken and becomes a no-op instead of a second pass.
  replaying: tokio::sync::Mutex<()>,
}

impl SyncEngine {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    gateway: Arc<FetchGateway>,
    connectivity: Arc<ConnectivityMonitor>,
    refresh: Arc<RefreshManager>,
    credentials: Arc<CredentialStore>,
    entities: EntityStore,
    queue: MutationQueue,
    settings: Settings,
    replay_interval: Duration,
  ) -> Arc<Self> {
    Arc::new(Self {
      gateway,
      connectivity,
      refresh,
      credentials,
      entities,
      queue,
      settings,
      replay_interval,
      replaying: tokio::sync::Mutex::new(()),
    })
  }

  pub fn store(&self) -> &EntityStore {
    &self.entities
  }

  pub fn queue(&self) -> &MutationQueue {
    &self.queue
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  pub async fn is_online(&self) -> bool {
    self.connectivity.is_online().await
  }

  pub fn subscribe_connectivity(&self) -> watch::Receiver<bool> {
    self.connectivity.subscribe()
  }

  /// Fetch the full collection of a kind. A non-empty store answers
  /// immediately and a background revalidation runs concurrently; an empty
  /// store awaits the remote inline.
  pub async fn fetch_entity_list<T: Entity + 'static>(self: &Arc<Self>) -> Result<Vec<T>, Fault> {
    let cached = self.entities.get_all::<T>().map_err(Fault::storage)?;
    if !cached.is_empty() {
      self.spawn_revalidate_list::<T>();
      return Ok(cached);
    }

    match self.fetch_list_remote::<T>().await {
      Ok(list) => Ok(list),
      Err(fault) => {
        // The store may have been populated by a racing write or replay
        // between the empty check and the failed fetch
        let retried = self.entities.get_all::<T>().map_err(Fault::storage)?;
        if retried.is_empty() {
          Err(fault)
        } else {
          debug!(kind = %T::kind(), "remote fetch failed, store populated meanwhile");
          Ok(retried)
        }
      }
    }
  }

  /// Fetch a single entity, cache-first with background revalidation.
  pub async fn fetch_entity<T: Entity + 'static>(
    self: &Arc<Self>,
    id: &str,
  ) -> Result<Option<T>, Fault> {
    if let Some(cached) = self.entities.get::<T>(id).map_err(Fault::storage)? {
      self.spawn_revalidate_one::<T>(id.to_string());
      return Ok(Some(cached));
    }

    match self.fetch_one_remote::<T>(id).await {
      Ok(found) => Ok(found),
      Err(fault) => match self.entities.get::<T>(id).map_err(Fault::storage)? {
        Some(cached) => Ok(Some(cached)),
        None => Err(fault),
      },
    }
  }

  async fn fetch_list_remote<T: Entity>(&self) -> Result<Vec<T>, Fault> {
    let list: Vec<T> = self
      .gateway
      .get(T::kind().collection_path())
      .await?
      .unwrap_or_default();
    self.entities.put_many(&list).map_err(Fault::storage)?;
    Ok(list)
  }

  async fn fetch_one_remote<T: Entity>(&self, id: &str) -> Result<Option<T>, Fault> {
    let path = format!("{}/{}", T::kind().collection_path(), id);
    let found: Option<T> = self.gateway.get(&path).await?;
    if let Some(entity) = &found {
      self.entities.put(entity).map_err(Fault::storage)?;
    }
    Ok(found)
  }

  fn spawn_revalidate_list<T: Entity + 'static>(self: &Arc<Self>) {
    let engine = Arc::clone(self);
    tokio::spawn(async move {
      // The caller already has data; a failed revalidation is only noise
      if let Err(fault) = engine.fetch_list_remote::<T>().await {
        debug!(kind = %T::kind(), %fault, "background revalidation failed");
      }
    });
  }

  fn spawn_revalidate_one<T: Entity + 'static>(self: &Arc<Self>, id: String) {
    let engine = Arc::clone(self);
    tokio::spawn(async move {
      if let Err(fault) = engine.fetch_one_remote::<T>(&id).await {
        debug!(kind = %T::kind(), %id, %fault, "background revalidation failed");
      }
    });
  }

  /// Create an entity remote-first. A connectivity fault stages the draft
  /// locally under a temporary id and queues the creation for replay; Api
  /// faults propagate unchanged.
  pub async fn create_entity<T: Entity>(&self, draft: T) -> Result<T, Fault> {
    let payload =
      serde_json::to_value(&draft).map_err(|e| Fault::Parse(e.to_string()))?;

    match self
      .gateway
      .post::<T>(T::kind().collection_path(), &payload)
      .await
    {
      Ok(Some(created)) => {
        self.entities.put(&created).map_err(Fault::storage)?;
        Ok(created)
      }
      Ok(None) => Err(Fault::Parse("create response had no body".to_string())),
      Err(fault) if fault.is_connectivity() => {
        let mut staged = draft;
        staged.set_id(temp_id());
        self.entities.stage_local(&staged).map_err(Fault::storage)?;

        let staged_payload =
          serde_json::to_value(&staged).map_err(|e| Fault::Parse(e.to_string()))?;
        self
          .queue
          .enqueue(QueueAction::Create, T::kind(), &staged.id(), &staged_payload)
          .map_err(Fault::storage)?;

        info!(kind = %T::kind(), id = %staged.id(), "offline, staged creation for replay");
        Ok(staged)
      }
      Err(fault) => Err(fault),
    }
  }

  /// Update an entity remote-first, staging locally on a connectivity
  /// fault.
  pub async fn update_entity<T: Entity>(&self, entity: T) -> Result<T, Fault> {
    let path = format!("{}/{}", T::kind().collection_path(), entity.id());
    let payload =
      serde_json::to_value(&entity).map_err(|e| Fault::Parse(e.to_string()))?;

    match self.gateway.put::<T>(&path, &payload).await {
      Ok(Some(updated)) => {
        self.entities.put(&updated).map_err(Fault::storage)?;
        Ok(updated)
      }
      Ok(None) => {
        // Bodiless acknowledgement; our copy is the confirmed state
        self.entities.put(&entity).map_err(Fault::storage)?;
        Ok(entity)
      }
      Err(fault) if fault.is_connectivity() => {
        self.entities.stage_local(&entity).map_err(Fault::storage)?;
        self
          .queue
          .enqueue(QueueAction::Update, T::kind(), &entity.id(), &payload)
          .map_err(Fault::storage)?;

        info!(kind = %T::kind(), id = %entity.id(), "offline, staged update for replay");
        Ok(entity)
      }
      Err(fault) => Err(fault),
    }
  }

  /// Delete an entity remote-first. The local row goes away either way; a
  /// connectivity fault queues the remote deletion for replay.
  pub async fn delete_entity<T: Entity>(&self, id: &str) -> Result<(), Fault> {
    let path = format!("{}/{}", T::kind().collection_path(), id);

    match self.gateway.delete::<serde_json::Value>(&path).await {
      Ok(_) => {
        self.entities.delete::<T>(id).map_err(Fault::storage)?;
        Ok(())
      }
      Err(fault) if fault.is_connectivity() => {
        self.entities.delete::<T>(id).map_err(Fault::storage)?;
        self
          .queue
          .enqueue(QueueAction::Delete, T::kind(), id, &serde_json::json!({}))
          .map_err(Fault::storage)?;

        info!(kind = %T::kind(), id, "offline, staged deletion for replay");
        Ok(())
      }
      Err(fault) => Err(fault),
    }
  }

  /// Replay pending mutations in insertion order. At most one pass runs at
  /// a time; a concurrent trigger returns an empty summary instead of
  /// starting a second pass. A failure on one item never blocks the next.
  pub async fn process_queue(&self) -> Result<ReplaySummary, Fault> {
    let Ok(_guard) = self.replaying.try_lock() else {
      debug!("replay already in progress, skipping");
      return Ok(ReplaySummary::default());
    };

    if !self.connectivity.is_online().await {
      debug!("offline, skipping replay");
      return Ok(ReplaySummary::default());
    }

    let pending = self.queue.pending().map_err(Fault::storage)?;
    if pending.is_empty() {
      return Ok(ReplaySummary::default());
    }

    info!(count = pending.len(), "replaying queued mutations");
    let mut summary = ReplaySummary::default();

    for item in pending {
      summary.processed += 1;
      match self.replay_item(&item).await {
        Ok(()) => {
          self.queue.mark_done(item.id).map_err(Fault::storage)?;
          summary.succeeded += 1;
        }
        Err(fault) => {
          warn!(
            id = item.id,
            action = item.action.as_str(),
            entity_id = %item.entity_id,
            %fault,
            "replay failed, will retry"
          );
          self.queue.increment_retry(item.id).map_err(Fault::storage)?;
          summary.failed += 1;
        }
      }
    }

    info!(
      succeeded = summary.succeeded,
      failed = summary.failed,
      "replay pass finished"
    );
    Ok(summary)
  }

  async fn replay_item(&self, item: &QueueItem) -> Result<(), Fault> {
    let collection = item.kind.collection_path();

    match item.action {
      QueueAction::Create => {
        let response: Option<serde_json::Value> =
          self.gateway.post(collection, &item.payload).await?;
        match response {
          Some(value) => {
            let new_id = self
              .entities
              .put_value(item.kind, &value)
              .map_err(Fault::storage)?;
            // The server assigned a permanent id; drop the temporary
            // record it supersedes
            if new_id != item.entity_id {
              self
                .entities
                .delete_by_kind(item.kind, &item.entity_id)
                .map_err(Fault::storage)?;
              debug!(
                kind = %item.kind,
                temp = %item.entity_id,
                permanent = %new_id,
                "reconciled temporary id"
              );
            }
          }
          None => self
            .entities
            .mark_synced(item.kind, &item.entity_id)
            .map_err(Fault::storage)?,
        }
      }
      QueueAction::Update => {
        let path = format!("{}/{}", collection, item.entity_id);
        let response: Option<serde_json::Value> =
          self.gateway.put(&path, &item.payload).await?;
        match response {
          Some(value) => {
            self
              .entities
              .put_value(item.kind, &value)
              .map_err(Fault::storage)?;
          }
          None => self
            .entities
            .mark_synced(item.kind, &item.entity_id)
            .map_err(Fault::storage)?,
        }
      }
      QueueAction::Delete => {
        let path = format!("{}/{}", collection, item.entity_id);
        self
          .gateway
          .delete::<serde_json::Value>(&path)
          .await?;
        self
          .entities
          .delete_by_kind(item.kind, &item.entity_id)
          .map_err(Fault::storage)?;
      }
    }

    Ok(())
  }

  /// Drop every trace of the session: mirrored entities, queued
  /// mutations, the current-user setting and both credential scopes.
  pub fn logout(&self) -> Result<(), Fault> {
    self.entities.clear_all().map_err(Fault::storage)?;
    self.queue.clear_all().map_err(Fault::storage)?;
    self.settings.clear_current_user().map_err(Fault::storage)?;
    self.credentials.clear();
    info!("logged out, local state cleared");
    Ok(())
  }

  /// Long-running maintenance: the connectivity probe loop, a
  /// reconnect-triggered replay, and a timer-driven replay pass that also
  /// sweeps completed items and refreshes a near-expiry token.
  pub fn start_background(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = vec![self.connectivity.spawn_background()];

    let engine = Arc::clone(self);
    handles.push(tokio::spawn(async move {
      let mut rx = engine.connectivity.subscribe();
      while rx.changed().await.is_ok() {
        if *rx.borrow() {
          info!("connectivity restored, triggering replay");
          if let Err(fault) = engine.process_queue().await {
            warn!(%fault, "reconnect replay failed");
          }
        }
      }
    }));

    let engine = Arc::clone(self);
    handles.push(tokio::spawn(async move {
      let mut interval = tokio::time::interval(engine.replay_interval);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        interval.tick().await;
        engine.refresh.refresh_if_needed().await;
        if let Err(fault) = engine.process_queue().await {
          warn!(%fault, "timer replay failed");
        }
        if let Err(e) = engine.queue.sweep_completed() {
          warn!("queue sweep failed: {e}");
        }
      }
    }));

    handles
  }
}
