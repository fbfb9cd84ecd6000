//! The three caching strategies.
//!
//! Each takes the fetch itself as a closure, so the strategy logic owns
//! nothing about transport and tests can script the network. Only 2xx
//! responses are ever cached.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use super::class::ResourceClass;
use super::storage::{
  CachedResponse, EdgeResponse, EdgeStorage, STRATEGY_CACHE_FIRST, STRATEGY_NETWORK_FIRST,
  STRATEGY_SWR,
};
use crate::error::Fault;

fn store(
  storage: &EdgeStorage,
  cache_name: &str,
  class: ResourceClass,
  url: &str,
  response: &EdgeResponse,
  strategy: &'static str,
) {
  let entry = CachedResponse::new(response.clone(), strategy);
  if let Err(e) = storage.put(cache_name, url, &entry, class.max_items()) {
    // A failed cache write never fails the request
    warn!(cache_name, url, "failed to cache response: {e}");
  }
}

/// Cache-first: a fresh cached entry short-circuits the network entirely.
/// A miss or stale entry fetches; fetch failure falls back to the stale
/// entry when one exists.
pub(super) async fn cache_first<F, Fut>(
  storage: &EdgeStorage,
  cache_name: &str,
  class: ResourceClass,
  url: &str,
  fetcher: F,
) -> Result<EdgeResponse, Fault>
where
  F: FnOnce() -> Fut,
  Fut: Future<Output = Result<EdgeResponse, Fault>>,
{
  let cached = storage.get(cache_name, url).map_err(Fault::storage)?;

  if let Some(entry) = &cached {
    if entry.is_fresh(class.max_age()) {
      debug!(url, "cache hit (fresh)");
      return Ok(entry.response.clone());
    }
  }

  match fetcher().await {
    Ok(response) if response.is_success() => {
      store(storage, cache_name, class, url, &response, STRATEGY_CACHE_FIRST);
      Ok(response)
    }
    Ok(response) => match cached {
      Some(entry) => {
        debug!(url, status = response.status, "serving stale cache over bad response");
        Ok(entry.response)
      }
      None => Ok(response),
    },
    Err(fault) => match cached {
      Some(entry) => {
        debug!(url, %fault, "serving stale cache, network failed");
        Ok(entry.response)
      }
      None => Err(fault),
    },
  }
}

/// Network-first: the network answers when it can; cache is the fallback,
/// stale entries included. Only total cache absence is a hard failure.
pub(super) async fn network_first<F, Fut>(
  storage: &EdgeStorage,
  cache_name: &str,
  class: ResourceClass,
  url: &str,
  fetcher: F,
) -> Result<EdgeResponse, Fault>
where
  F: FnOnce() -> Fut,
  Fut: Future<Output = Result<EdgeResponse, Fault>>,
{
  let fault = match fetcher().await {
    Ok(response) if response.is_success() => {
      store(storage, cache_name, class, url, &response, STRATEGY_NETWORK_FIRST);
      return Ok(response);
    }
    Ok(response) => Fault::api(
      response.status,
      Fault::fallback_message(response.status),
    ),
    Err(fault) => fault,
  };

  match storage.get(cache_name, url).map_err(Fault::storage)? {
    Some(entry) => {
      let stale = if entry.is_fresh(class.max_age()) { "fresh" } else { "stale" };
      debug!(url, stale, %fault, "network failed, serving cache");
      Ok(entry.response)
    }
    None => Err(fault),
  }
}

/// Stale-while-revalidate: any cached entry answers immediately while the
/// fetch runs in the background to refresh the cache for next time. With
/// no cache, the in-flight fetch itself is the answer.
pub(super) async fn stale_while_revalidate<F, Fut>(
  storage: &Arc<EdgeStorage>,
  cache_name: &str,
  class: ResourceClass,
  url: &str,
  fetcher: F,
) -> Result<EdgeResponse, Fault>
where
  F: FnOnce() -> Fut,
  Fut: Future<Output = Result<EdgeResponse, Fault>> + Send + 'static,
{
  let cached = storage.get(cache_name, url).map_err(Fault::storage)?;

  if let Some(entry) = cached {
    let storage = Arc::clone(storage);
    let cache_name = cache_name.to_string();
    let url = url.to_string();
    let future = fetcher();
    tokio::spawn(async move {
      match future.await {
        Ok(response) if response.is_success() => {
          store(&storage, &cache_name, class, &url, &response, STRATEGY_SWR);
          debug!(%url, "background revalidation stored fresh response");
        }
        Ok(response) => debug!(%url, status = response.status, "background revalidation rejected"),
        Err(fault) => debug!(%url, %fault, "background revalidation failed"),
      }
    });
    return Ok(entry.response);
  }

  let response = fetcher().await?;
  if response.is_success() {
    store(storage, cache_name, class, url, &response, STRATEGY_SWR);
  }
  Ok(response)
}
