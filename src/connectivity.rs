//! Actual-reachability detection.
//!
//! Device-reported online state is only a hint; the truth is whether the
//! API origin answers a probe. Any response at all - including a non-2xx -
//! counts as reachable; only transport failure or timeout counts as not.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Where the last check ended up. `network` can be true while `server` is
/// false ("my server is down, but I have a network"); the engine still
/// reports offline in that case since no request can proceed without the
/// API origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reachability {
  pub server: bool,
  pub network: bool,
}

impl Reachability {
  pub fn online(&self) -> bool {
    self.server
  }
}

/// One probe against one URL. Kept behind a trait so monitor logic is
/// testable without a server.
#[async_trait]
pub trait Prober: Send + Sync {
  /// True if any response came back, false on transport failure or timeout.
  async fn probe(&self, url: &str) -> bool;
}

/// HEAD request with a short timeout. The status code is deliberately
/// ignored - a 404 or 405 still proves the origin is reachable.
pub struct HttpProber {
  client: reqwest::Client,
}

impl HttpProber {
  pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Prober for HttpProber {
  async fn probe(&self, url: &str) -> bool {
    match self.client.head(url).send().await {
      Ok(response) => {
        debug!(url, status = response.status().as_u16(), "probe answered");
        true
      }
      Err(e) => {
        debug!(url, "probe failed: {}", e);
        false
      }
    }
  }
}

/// Singleton service owning the cached reachability state.
///
/// Construct once per process and share; the result cache keeps bursts of
/// `is_online` calls from each re-probing.
pub struct ConnectivityMonitor {
  prober: Arc<dyn Prober>,
  primary_url: String,
  fallback_url: String,
  cache_window: Duration,
  check_interval: Duration,
  cached: Mutex<Option<(Instant, Reachability)>>,
  tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
  pub fn new(config: &Config, prober: Arc<dyn Prober>) -> Arc<Self> {
    // Optimistically online until the first probe says otherwise
    let (tx, _) = watch::channel(true);

    let base = config.api.base_url.trim_end_matches('/');
    let origin = origin_of(base).unwrap_or_else(|| base.to_string());

    Arc::new(Self {
      prober,
      primary_url: config.health_url(),
      fallback_url: format!("{}{}", origin, config.connectivity.fallback_path),
      cache_window: Duration::from_secs(config.connectivity.cache_window_secs),
      check_interval: Duration::from_secs(config.connectivity.check_interval_secs),
      cached: Mutex::new(None),
      tx,
    })
  }

  /// Current reachability, reusing a recent probe result when one exists.
  pub async fn is_online(&self) -> bool {
    if let Some(reach) = self.cached_result() {
      return reach.online();
    }
    self.check_now().await.online()
  }

  fn cached_result(&self) -> Option<Reachability> {
    let cached = match self.cached.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    match *cached {
      Some((at, reach)) if at.elapsed() < self.cache_window => Some(reach),
      _ => None,
    }
  }

  /// Probe immediately, bypassing the cache. Device online/offline events
  /// should call this - they are hints that something changed, not truth.
  pub async fn check_now(&self) -> Reachability {
    let server = self.prober.probe(&self.primary_url).await;

    let reach = if server {
      Reachability {
        server: true,
        network: true,
      }
    } else {
      // Primary origin unreachable; the fallback only tells us whether we
      // have a network at all
      let network = self.prober.probe(&self.fallback_url).await;
      if network {
        warn!("API origin unreachable but network is up");
      }
      Reachability {
        server: false,
        network,
      }
    };

    match self.cached.lock() {
      Ok(mut guard) => *guard = Some((Instant::now(), reach)),
      Err(poisoned) => *poisoned.into_inner() = Some((Instant::now(), reach)),
    }

    let flipped = self.tx.send_if_modified(|online| {
      if *online != reach.online() {
        *online = reach.online();
        true
      } else {
        false
      }
    });
    if flipped {
      info!(online = reach.online(), "connectivity changed");
    }

    reach
  }

  /// Watch channel carrying the online boolean; use `changed()` to react
  /// to up/down transitions.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Background re-check loop (every `check_interval`). Runs until the
  /// monitor is dropped.
  pub fn spawn_background(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
    let monitor = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(monitor.check_interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        monitor.check_now().await;
      }
    })
  }
}

/// Scheme + authority of a URL, without the path.
fn origin_of(url: &str) -> Option<String> {
  let parsed = url::Url::parse(url).ok()?;
  let host = parsed.host_str()?;
  match parsed.port() {
    Some(port) => Some(format!("{}://{}:{}", parsed.scheme(), host, port)),
    None => Some(format!("{}://{}", parsed.scheme(), host)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct FakeProber {
    primary_up: Mutex<bool>,
    fallback_up: Mutex<bool>,
    calls: AtomicUsize,
  }

  impl FakeProber {
    fn new(primary_up: bool, fallback_up: bool) -> Arc<Self> {
      Arc::new(Self {
        primary_up: Mutex::new(primary_up),
        fallback_up: Mutex::new(fallback_up),
        calls: AtomicUsize::new(0),
      })
    }

    fn set_primary(&self, up: bool) {
      *self.primary_up.lock().unwrap() = up;
    }
  }

  #[async_trait]
  impl Prober for FakeProber {
    async fn probe(&self, url: &str) -> bool {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if url.contains("/health") {
        *self.primary_up.lock().unwrap()
      } else {
        *self.fallback_up.lock().unwrap()
      }
    }
  }

  fn monitor(prober: Arc<FakeProber>) -> Arc<ConnectivityMonitor> {
    let config = Config::with_base_url("http://localhost:8080/api");
    ConnectivityMonitor::new(&config, prober)
  }

  #[test]
  fn test_probe_urls() {
    let monitor = monitor(FakeProber::new(true, true));
    assert_eq!(monitor.primary_url, "http://localhost:8080/api/health");
    assert_eq!(monitor.fallback_url, "http://localhost:8080/manifest.json");
  }

  #[tokio::test]
  async fn test_burst_of_calls_probes_once() {
    let prober = FakeProber::new(true, true);
    let monitor = monitor(Arc::clone(&prober));

    for _ in 0..10 {
      assert!(monitor.is_online().await);
    }
    assert_eq!(prober.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_server_down_reports_offline_even_with_network() {
    let prober = FakeProber::new(false, true);
    let monitor = monitor(Arc::clone(&prober));

    let reach = monitor.check_now().await;
    assert!(!reach.online());
    assert!(reach.network);
    // Primary then fallback
    assert_eq!(prober.calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_no_network_at_all() {
    let monitor = monitor(FakeProber::new(false, false));
    let reach = monitor.check_now().await;
    assert!(!reach.online());
    assert!(!reach.network);
  }

  #[tokio::test]
  async fn test_subscribe_sees_transition() {
    let prober = FakeProber::new(false, false);
    let monitor = monitor(Arc::clone(&prober));
    let mut rx = monitor.subscribe();

    monitor.check_now().await;
    rx.changed().await.unwrap();
    assert!(!*rx.borrow_and_update());

    prober.set_primary(true);
    monitor.check_now().await;
    rx.changed().await.unwrap();
    assert!(*rx.borrow_and_update());
  }

  #[tokio::test]
  async fn test_check_now_bypasses_cache() {
    let prober = FakeProber::new(true, true);
    let monitor = monitor(Arc::clone(&prober));

    assert!(monitor.is_online().await);
    // A device event hints that something changed; re-check immediately
    prober.set_primary(false);
    assert!(!monitor.check_now().await.online());
  }
}
