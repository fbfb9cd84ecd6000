//! The edge layer itself: request interception, generation lifecycle and
//! the control channel.
//!
//! Each resource class gets its own versioned cache name
//! (`krawl-<class>-<version>`); bumping the configured version and calling
//! [`EdgeCache::activate`] wipes every older generation, the only full
//! wipe the layer ever performs on its own.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::class::{should_intercept, ResourceClass};
use super::storage::{CachedResponse, EdgeResponse, EdgeStorage, STRATEGY_CACHE_FIRST};
use super::strategy;
use crate::config::EdgeConfig;
use crate::error::Fault;
use crate::gateway::Method;

/// App-shell paths precached on install, the offline fallback included.
const SHELL_PATHS: &[&str] = &["/", "/explore", "/krawls", "/add", "/profile", "/offline"];

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// What the interceptor decided about a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intercepted {
  /// Not ours; the caller performs the request itself.
  Bypass,
  Served(EdgeResponse),
}

/// Per-class entry counts, the `GetCacheSize` reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheSizes {
  pub statics: usize,
  pub api: usize,
  pub dynamic: usize,
  pub images: usize,
}

impl CacheSizes {
  pub fn total(&self) -> usize {
    self.statics + self.api + self.dynamic + self.images
  }
}

/// Commands accepted over the control channel.
#[derive(Debug)]
pub enum ControlMessage {
  /// Promote the current generation immediately (runs activation).
  SkipWaiting,
  /// Wipe every cache, all generations. Replies whether the wipe landed.
  ClearCache { reply: oneshot::Sender<bool> },
  /// Wipe only the current API cache.
  ClearApiCache { reply: oneshot::Sender<bool> },
  GetCacheSize { reply: oneshot::Sender<CacheSizes> },
}

pub struct EdgeCache {
  storage: Arc<EdgeStorage>,
  version: String,
  offline_page: String,
  fetch_timeout: Duration,
  excluded_hosts: Vec<String>,
}

impl EdgeCache {
  pub fn new(storage: Arc<EdgeStorage>, config: &EdgeConfig) -> Arc<Self> {
    Arc::new(Self {
      storage,
      version: config.cache_version.clone(),
      offline_page: config.offline_page.clone(),
      fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
      excluded_hosts: config.excluded_hosts.clone(),
    })
  }

  fn cache_name(&self, class: ResourceClass) -> String {
    format!("krawl-{}-{}", class.as_str(), self.version)
  }

  /// Cache name for the precached app shell.
  fn shell_cache_name(&self) -> String {
    format!("krawl-{}", self.version)
  }

  fn current_generations(&self) -> Vec<String> {
    let mut names: Vec<String> = ResourceClass::ALL
      .iter()
      .map(|class| self.cache_name(*class))
      .collect();
    names.push(self.shell_cache_name());
    names
  }

  /// Route a request through the cache. The fetcher runs under the
  /// configured timeout; a timeout is a network fault, not a hang.
  pub async fn handle<F, Fut>(
    &self,
    method: Method,
    url: &str,
    accepts_html: bool,
    fetcher: F,
  ) -> Result<Intercepted, Fault>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<EdgeResponse, Fault>> + Send + 'static,
  {
    if !should_intercept(method, url, &self.excluded_hosts) {
      return Ok(Intercepted::Bypass);
    }

    let class = ResourceClass::classify(url);
    let cache_name = self.cache_name(class);
    let timeout = self.fetch_timeout;
    let bounded = move || async move {
      match tokio::time::timeout(timeout, fetcher()).await {
        Ok(result) => result,
        Err(_) => Err(Fault::Network("request timed out".to_string())),
      }
    };

    let served = match class {
      ResourceClass::Static | ResourceClass::Image => {
        let result =
          strategy::cache_first(&self.storage, &cache_name, class, url, bounded).await;
        match result {
          Ok(response) => Ok(response),
          Err(fault) if accepts_html => match self.offline_page()? {
            Some(page) => {
              info!(url, "serving offline page for failed navigation");
              Ok(page)
            }
            None => Err(fault),
          },
          Err(fault) => Err(fault),
        }
      }
      ResourceClass::Api => {
        strategy::network_first(&self.storage, &cache_name, class, url, bounded).await
      }
      ResourceClass::Dynamic => {
        let result =
          strategy::stale_while_revalidate(&self.storage, &cache_name, class, url, bounded)
            .await;
        match result {
          Ok(response) => Ok(response),
          Err(fault) if accepts_html => match self.offline_page()? {
            Some(page) => {
              info!(url, "serving offline page for failed navigation");
              Ok(page)
            }
            None => Err(fault),
          },
          Err(fault) => Err(fault),
        }
      }
    }?;

    Ok(Intercepted::Served(served))
  }

  fn offline_page(&self) -> Result<Option<EdgeResponse>, Fault> {
    let entry = self
      .storage
      .get(&self.shell_cache_name(), &self.offline_page)
      .map_err(Fault::storage)?;
    Ok(entry.map(|e| e.response))
  }

  /// Precache the app shell. Each path is fetched independently; one
  /// failure never blocks the rest.
  pub async fn install<F, Fut>(&self, fetch: F) -> Result<usize, Fault>
  where
    F: Fn(&str) -> Fut,
    Fut: Future<Output = Result<EdgeResponse, Fault>>,
  {
    let shell = self.shell_cache_name();
    let mut cached = 0;

    for path in SHELL_PATHS {
      match fetch(path).await {
        Ok(response) if response.is_success() => {
          let entry = CachedResponse::new(response, STRATEGY_CACHE_FIRST);
          self
            .storage
            .put(&shell, path, &entry, SHELL_PATHS.len())
            .map_err(Fault::storage)?;
          cached += 1;
        }
        Ok(response) => warn!(path, status = response.status, "shell precache rejected"),
        Err(fault) => warn!(path, %fault, "shell precache failed"),
      }
    }

    info!(cached, "install complete");
    Ok(cached)
  }

  /// New-generation activation: delete every cache not carrying the
  /// current version tag and sweep expired entries from those that do.
  pub fn activate(&self) -> Result<(), Fault> {
    let keep = self.current_generations();
    let deleted = self
      .storage
      .retain_generations(&keep)
      .map_err(Fault::storage)?;

    for class in ResourceClass::ALL {
      self
        .storage
        .sweep_expired(&self.cache_name(class), class.max_age())
        .map_err(Fault::storage)?;
    }

    info!(version = %self.version, deleted, "activation complete");
    Ok(())
  }

  /// Expired-entry cleanup for the current generation, the timer-tick
  /// subset of activation. Nothing in this crate schedules the tick:
  /// the host decides the cadence (the platform owns periodic
  /// background work) and calls this from its own timer, the way it
  /// would register a periodic-sync handler.
  pub fn sweep_expired(&self) -> Result<usize, Fault> {
    let mut swept = 0;
    for class in ResourceClass::ALL {
      swept += self
        .storage
        .sweep_expired(&self.cache_name(class), class.max_age())
        .map_err(Fault::storage)?;
    }
    Ok(swept)
  }

  pub fn cache_sizes(&self) -> Result<CacheSizes, Fault> {
    Ok(CacheSizes {
      statics: self.class_count(ResourceClass::Static)?,
      api: self.class_count(ResourceClass::Api)?,
      dynamic: self.class_count(ResourceClass::Dynamic)?,
      images: self.class_count(ResourceClass::Image)?,
    })
  }

  fn class_count(&self, class: ResourceClass) -> Result<usize, Fault> {
    self
      .storage
      .count(&self.cache_name(class))
      .map_err(Fault::storage)
  }

  /// Start the control loop and hand back its client handle.
  pub fn spawn_control(self: &Arc<Self>) -> ControlHandle {
    let (tx, mut rx) = mpsc::channel::<ControlMessage>(16);
    let layer = Arc::clone(self);

    let task = tokio::spawn(async move {
      while let Some(message) = rx.recv().await {
        match message {
          ControlMessage::SkipWaiting => {
            debug!("skip-waiting received");
            if let Err(fault) = layer.activate() {
              warn!(%fault, "activation failed");
            }
          }
          ControlMessage::ClearCache { reply } => {
            let ok = layer.storage.clear_all().is_ok();
            let _ = reply.send(ok);
          }
          ControlMessage::ClearApiCache { reply } => {
            let ok = layer
              .storage
              .delete_cache(&layer.cache_name(ResourceClass::Api))
              .is_ok();
            let _ = reply.send(ok);
          }
          ControlMessage::GetCacheSize { reply } => {
            let sizes = layer.cache_sizes().unwrap_or_default();
            let _ = reply.send(sizes);
          }
        }
      }
    });

    ControlHandle { tx, task }
  }
}

/// Caller-side handle for the control channel. Every request-reply
/// message is bounded by a five second timeout.
pub struct ControlHandle {
  tx: mpsc::Sender<ControlMessage>,
  task: tokio::task::JoinHandle<()>,
}

impl ControlHandle {
  pub async fn skip_waiting(&self) -> Result<(), Fault> {
    self
      .tx
      .send(ControlMessage::SkipWaiting)
      .await
      .map_err(|_| Fault::Storage("control channel closed".to_string()))
  }

  pub async fn clear_cache(&self) -> Result<bool, Fault> {
    self
      .request(|reply| ControlMessage::ClearCache { reply })
      .await
  }

  pub async fn clear_api_cache(&self) -> Result<bool, Fault> {
    self
      .request(|reply| ControlMessage::ClearApiCache { reply })
      .await
  }

  pub async fn cache_size(&self) -> Result<CacheSizes, Fault> {
    self
      .request(|reply| ControlMessage::GetCacheSize { reply })
      .await
  }

  async fn request<T>(
    &self,
    message: impl FnOnce(oneshot::Sender<T>) -> ControlMessage,
  ) -> Result<T, Fault> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self
      .tx
      .send(message(reply_tx))
      .await
      .map_err(|_| Fault::Storage("control channel closed".to_string()))?;

    match tokio::time::timeout(REPLY_TIMEOUT, reply_rx).await {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(_)) => Err(Fault::Storage("control reply dropped".to_string())),
      Err(_) => Err(Fault::Storage("control reply timed out".to_string())),
    }
  }

  pub fn shutdown(self) {
    drop(self.tx);
    self.task.abort();
  }
}
