//! Proactive, deduplicated credential refresh.
//!
//! The one hard invariant here: at most one refresh exchange is in flight
//! process-wide. Concurrent callers clone and await the same shared future
//! instead of issuing duplicate exchanges - two racing refreshes persisting
//! different tokens would corrupt the stored credential.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::Fault;

use super::credential::CredentialStore;

/// Extract the expiry claim from a JWT without verifying the signature.
/// Verification is the server's job; the client only schedules refreshes.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
  let payload = token.split('.').nth(1)?;
  let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
  let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
  let exp = claims.get("exp")?.as_i64()?;
  Utc.timestamp_opt(exp, 0).single()
}

/// True when the token expires within `threshold`. An undecodable token is
/// treated as already expired.
pub fn is_expiring_soon(token: &str, threshold: Duration) -> bool {
  match token_expiry(token) {
    Some(expiry) => {
      let remaining = expiry - Utc::now();
      remaining < chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero())
    }
    None => true,
  }
}

/// What a successful refresh exchange returns.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshResponse {
  pub token: String,
}

/// The actual network exchange, kept behind a trait so the dedup logic is
/// testable without a server.
#[async_trait]
pub trait TokenExchange: Send + Sync {
  async fn exchange(&self) -> Result<RefreshResponse, Fault>;
}

/// POSTs to the refresh endpoint. The refresh credential itself travels as
/// an HttpOnly cookie, so the client only needs the cookie store enabled.
pub struct HttpTokenExchange {
  client: reqwest::Client,
  url: String,
}

impl HttpTokenExchange {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self, Fault> {
    let client = reqwest::Client::builder()
      .cookie_store(true)
      .timeout(timeout)
      .build()
      .map_err(|e| Fault::Network(e.to_string()))?;

    Ok(Self {
      client,
      url: format!("{}/auth/refresh", base_url.trim_end_matches('/')),
    })
  }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
  async fn exchange(&self) -> Result<RefreshResponse, Fault> {
    let response = self.client.post(&self.url).send().await?;

    let status = response.status();
    if !status.is_success() {
      return Err(Fault::api(status.as_u16(), Fault::fallback_message(status.as_u16())));
    }

    response
      .json::<RefreshResponse>()
      .await
      .map_err(|e| Fault::Parse(e.to_string()))
  }
}

type SharedRefresh = Shared<BoxFuture<'static, Option<String>>>;

/// Owns the current credential's lifecycle: expiry detection, deduplicated
/// refresh, persistence into the authoritative scope.
pub struct RefreshManager {
  credentials: Arc<CredentialStore>,
  exchange: Arc<dyn TokenExchange>,
  threshold: Duration,
  inflight: Arc<Mutex<Option<SharedRefresh>>>,
}

impl RefreshManager {
  pub fn new(
    credentials: Arc<CredentialStore>,
    exchange: Arc<dyn TokenExchange>,
    threshold: Duration,
  ) -> Self {
    Self {
      credentials,
      exchange,
      threshold,
      inflight: Arc::new(Mutex::new(None)),
    }
  }

  pub fn token(&self) -> Option<String> {
    self.credentials.token()
  }

  /// Refresh proactively when the current token is expiring soon.
  /// Designed to be called periodically; a no-op when there is no token or
  /// plenty of time left.
  pub async fn refresh_if_needed(&self) {
    let Some(token) = self.credentials.token() else {
      return;
    };
    if is_expiring_soon(&token, self.threshold) {
      debug!("token expiring soon, refreshing proactively");
      self.force_refresh().await;
    }
  }

  /// Run (or join) a refresh exchange. Returns the new token, or `None` on
  /// failure - in which case all credential state has been cleared, since a
  /// stale refresh credential will not become valid by retrying.
  pub async fn force_refresh(&self) -> Option<String> {
    let fut = {
      let mut slot = lock_inflight(&self.inflight);
      if let Some(fut) = slot.as_ref() {
        // Join the exchange already in flight
        fut.clone()
      } else {
        let exchange = Arc::clone(&self.exchange);
        let credentials = Arc::clone(&self.credentials);
        let inflight = Arc::clone(&self.inflight);

        let fut: SharedRefresh = async move {
          let outcome = match exchange.exchange().await {
            Ok(response) => {
              if let Err(e) = credentials.update_token(&response.token) {
                warn!("Failed to persist refreshed token: {:#}", e);
              }
              debug!("token refreshed");
              Some(response.token)
            }
            Err(e) => {
              warn!("Token refresh failed, clearing credentials: {}", e);
              credentials.clear();
              None
            }
          };
          *lock_inflight(&inflight) = None;
          outcome
        }
        .boxed()
        .shared();

        *slot = Some(fut.clone());
        fut
      }
    };

    fut.await
  }
}

fn lock_inflight(
  inflight: &Mutex<Option<SharedRefresh>>,
) -> std::sync::MutexGuard<'_, Option<SharedRefresh>> {
  match inflight.lock() {
    Ok(guard) => guard,
    Err(poisoned) => poisoned.into_inner(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::auth::credential::{AuthUser, Credential};
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn fake_jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(b"{\"alg\":\"HS256\"}");
    let payload = URL_SAFE_NO_PAD.encode(serde_json::json!({ "exp": exp }).to_string());
    format!("{header}.{payload}.sig")
  }

  #[test]
  fn test_expiring_soon_threshold() {
    let soon = fake_jwt((Utc::now() + chrono::Duration::minutes(3)).timestamp());
    let later = fake_jwt((Utc::now() + chrono::Duration::hours(2)).timestamp());

    assert!(is_expiring_soon(&soon, Duration::from_secs(300)));
    assert!(!is_expiring_soon(&later, Duration::from_secs(300)));
  }

  #[test]
  fn test_undecodable_token_counts_as_expired() {
    assert!(is_expiring_soon("not-a-jwt", Duration::from_secs(300)));
    assert!(is_expiring_soon("a.%%%.c", Duration::from_secs(300)));
    assert!(token_expiry("a.b").is_none());
  }

  struct CountingExchange {
    calls: AtomicUsize,
    fail: bool,
  }

  #[async_trait]
  impl TokenExchange for CountingExchange {
    async fn exchange(&self) -> Result<RefreshResponse, Fault> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      // Hold the exchange open long enough for callers to pile up
      tokio::time::sleep(Duration::from_millis(50)).await;
      if self.fail {
        Err(Fault::api(401, "Invalid credentials"))
      } else {
        Ok(RefreshResponse {
          token: "fresh-token".to_string(),
        })
      }
    }
  }

  fn manager(fail: bool) -> (Arc<RefreshManager>, Arc<CountingExchange>, Arc<CredentialStore>) {
    let dir = std::env::temp_dir().join(format!(
      "krawl-refresh-test-{}-{:?}",
      std::process::id(),
      std::thread::current().id()
    ));
    let credentials =
      Arc::new(CredentialStore::new(Some(dir.join("auth.json"))).unwrap());
    credentials
      .set(
        Credential {
          token: fake_jwt((Utc::now() + chrono::Duration::minutes(3)).timestamp()),
          user: AuthUser {
            id: "u1".to_string(),
            email: "u1@example.com".to_string(),
            username: "u1".to_string(),
          },
        },
        false,
      )
      .unwrap();

    let exchange = Arc::new(CountingExchange {
      calls: AtomicUsize::new(0),
      fail,
    });
    let manager = Arc::new(RefreshManager::new(
      Arc::clone(&credentials),
      exchange.clone() as Arc<dyn TokenExchange>,
      Duration::from_secs(300),
    ));
    (manager, exchange, credentials)
  }

  #[tokio::test]
  async fn test_concurrent_refreshes_share_one_exchange() {
    let (manager, exchange, _credentials) = manager(false);

    let mut handles = Vec::new();
    for _ in 0..5 {
      let manager = Arc::clone(&manager);
      handles.push(tokio::spawn(async move { manager.force_refresh().await }));
    }

    for handle in handles {
      assert_eq!(handle.await.unwrap(), Some("fresh-token".to_string()));
    }
    assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_two_expiry_triggers_in_same_tick_dedupe() {
    let (manager, exchange, _credentials) = manager(false);

    // Both components notice the 3-minute expiry inside the same tick
    let first = manager.refresh_if_needed();
    let second = manager.refresh_if_needed();
    tokio::join!(first, second);

    assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_refresh_persists_new_token_and_allows_later_refresh() {
    let (manager, exchange, credentials) = manager(false);

    manager.force_refresh().await;
    assert_eq!(credentials.token(), Some("fresh-token".to_string()));

    // The in-flight slot was cleared, so a later refresh runs a new exchange
    manager.force_refresh().await;
    assert_eq!(exchange.calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_refresh_failure_clears_credentials() {
    let (manager, _exchange, credentials) = manager(true);

    assert_eq!(manager.force_refresh().await, None);
    assert!(credentials.load().is_none());
    assert!(manager.token().is_none());
  }

  #[tokio::test]
  async fn test_fresh_token_skips_exchange() {
    let (manager, exchange, credentials) = manager(false);
    credentials
      .update_token(&fake_jwt((Utc::now() + chrono::Duration::hours(6)).timestamp()))
      .unwrap();

    manager.refresh_if_needed().await;
    assert_eq!(exchange.calls.load(Ordering::SeqCst), 0);
  }
}
