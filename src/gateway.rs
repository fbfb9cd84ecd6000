//! Single entry point for all outbound API calls.
//!
//! Every request consults the connectivity monitor first (no attempt is
//! made while offline), attaches the current bearer credential, and has
//! its outcome classified into the [`Fault`] taxonomy. A 401 triggers one
//! deduplicated refresh and one retry; the refresh endpoint itself is
//! excluded to prevent recursion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::auth::{CredentialStore, RefreshManager};
use crate::connectivity::ConnectivityMonitor;
use crate::error::Fault;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  fn as_reqwest(&self) -> reqwest::Method {
    match self {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

impl std::fmt::Display for Method {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
    };
    f.write_str(s)
  }
}

/// An outbound request, after the gateway has attached everything.
#[derive(Debug, Clone)]
pub struct RawRequest {
  pub method: Method,
  pub url: String,
  pub bearer: Option<String>,
  pub body: Option<serde_json::Value>,
}

/// A response as the transport saw it. `Err` from the transport always
/// means a transport-level failure; non-2xx statuses come back as `Ok`.
#[derive(Debug, Clone)]
pub struct RawResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: String,
}

impl RawResponse {
  fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  fn has_json_body(&self) -> bool {
    self
      .content_type
      .as_deref()
      .is_some_and(|ct| ct.contains("application/json"))
  }
}

/// The wire itself, behind a trait so request classification and the
/// 401-retry protocol are testable without a server.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn execute(&self, request: RawRequest) -> Result<RawResponse, Fault>;
}

pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(timeout: Duration) -> Result<Self, Fault> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| Fault::Network(e.to_string()))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn execute(&self, request: RawRequest) -> Result<RawResponse, Fault> {
    let mut builder = self.client.request(request.method.as_reqwest(), &request.url);

    if let Some(token) = &request.bearer {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response.text().await?;

    Ok(RawResponse {
      status,
      content_type,
      body,
    })
  }
}

/// Structured error body the server may attach to a non-2xx response.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
  message: Option<String>,
  error: Option<String>,
  errors: Option<HashMap<String, Vec<String>>>,
}

/// Parse a successful response body. Empty, non-JSON and malformed bodies
/// all degrade to `None` rather than erroring.
fn parse_body<T: DeserializeOwned>(response: &RawResponse) -> Option<T> {
  if response.status == 204 || !response.has_json_body() {
    return None;
  }
  if response.body.trim().is_empty() {
    return None;
  }
  match serde_json::from_str(&response.body) {
    Ok(value) => Some(value),
    Err(e) => {
      warn!("Failed to parse response body, treating as empty: {}", e);
      None
    }
  }
}

/// Classify a non-2xx response into an Api fault, preferring the server's
/// structured error body over the per-status fallback message.
fn fault_from_response(response: &RawResponse) -> Fault {
  let parsed: Option<ApiErrorBody> = if response.has_json_body() {
    serde_json::from_str(&response.body).ok()
  } else {
    None
  };

  let (message, errors) = match parsed {
    Some(body) => {
      let message = body
        .message
        .or(body.error)
        .unwrap_or_else(|| Fault::fallback_message(response.status).to_string());
      (message, body.errors)
    }
    None => (Fault::fallback_message(response.status).to_string(), None),
  };

  Fault::Api {
    status: response.status,
    message,
    errors,
  }
}

pub struct FetchGateway {
  transport: Arc<dyn Transport>,
  connectivity: Arc<ConnectivityMonitor>,
  refresh: Arc<RefreshManager>,
  credentials: Arc<CredentialStore>,
  base_url: String,
}

impl FetchGateway {
  pub fn new(
    transport: Arc<dyn Transport>,
    connectivity: Arc<ConnectivityMonitor>,
    refresh: Arc<RefreshManager>,
    credentials: Arc<CredentialStore>,
    base_url: impl Into<String>,
  ) -> Self {
    let base_url = base_url.into();
    Self {
      transport,
      connectivity,
      refresh,
      credentials,
      base_url: base_url.trim_end_matches('/').to_string(),
    }
  }

  pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, Fault> {
    self.request(Method::Get, path, None).await
  }

  pub async fn post<T: DeserializeOwned>(
    &self,
    path: &str,
    body: &serde_json::Value,
  ) -> Result<Option<T>, Fault> {
    self.request(Method::Post, path, Some(body.clone())).await
  }

  pub async fn put<T: DeserializeOwned>(
    &self,
    path: &str,
    body: &serde_json::Value,
  ) -> Result<Option<T>, Fault> {
    self.request(Method::Put, path, Some(body.clone())).await
  }

  pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, Fault> {
    self.request(Method::Delete, path, None).await
  }

  pub async fn request<T: DeserializeOwned>(
    &self,
    method: Method,
    path: &str,
    body: Option<serde_json::Value>,
  ) -> Result<Option<T>, Fault> {
    if !self.connectivity.is_online().await {
      debug!(%method, path, "skipping request, offline");
      return Err(Fault::Offline);
    }

    let request = RawRequest {
      method,
      url: format!("{}{}", self.base_url, path),
      bearer: self.refresh.token(),
      body,
    };

    let response = self.transport.execute(request.clone()).await?;

    // One refresh-and-retry on 401, never for the refresh endpoint itself
    if response.status == 401 && !path.starts_with("/auth/refresh") {
      return self.retry_after_refresh(request, &response).await;
    }

    Self::finish(&response)
  }

  async fn retry_after_refresh<T: DeserializeOwned>(
    &self,
    request: RawRequest,
    original: &RawResponse,
  ) -> Result<Option<T>, Fault> {
    let Some(new_token) = self.refresh.force_refresh().await else {
      // Refresh failed; the manager already cleared credential state.
      // Surface the original 401.
      return Err(fault_from_response(original));
    };

    debug!(url = %request.url, "retrying after token refresh");
    let retried = RawRequest {
      bearer: Some(new_token),
      ..request
    };
    let response = self.transport.execute(retried).await?;

    if response.status == 401 {
      // The fresh token was rejected too: an authentication failure, not
      // something a further retry can fix
      warn!("request rejected after refresh, clearing credentials");
      self.credentials.clear();
    }

    Self::finish(&response)
  }

  fn finish<T: DeserializeOwned>(response: &RawResponse) -> Result<Option<T>, Fault> {
    if response.is_success() {
      Ok(parse_body(response))
    } else {
      Err(fault_from_response(response))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::auth::{AuthUser, Credential, RefreshResponse, TokenExchange};
  use crate::config::Config;
  use crate::connectivity::Prober;
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  struct StaticProber(bool);

  #[async_trait]
  impl Prober for StaticProber {
    async fn probe(&self, _url: &str) -> bool {
      self.0
    }
  }

  struct MockTransport {
    responses: Mutex<VecDeque<Result<RawResponse, Fault>>>,
    requests: Mutex<Vec<RawRequest>>,
  }

  impl MockTransport {
    fn new(responses: Vec<Result<RawResponse, Fault>>) -> Arc<Self> {
      Arc::new(Self {
        responses: Mutex::new(responses.into()),
        requests: Mutex::new(Vec::new()),
      })
    }

    fn seen(&self) -> Vec<RawRequest> {
      self.requests.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl Transport for MockTransport {
    async fn execute(&self, request: RawRequest) -> Result<RawResponse, Fault> {
      self.requests.lock().unwrap().push(request);
      self
        .responses
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Err(Fault::Network("no scripted response".into())))
    }
  }

  struct MockExchange {
    token: Option<&'static str>,
    calls: AtomicUsize,
  }

  #[async_trait]
  impl TokenExchange for MockExchange {
    async fn exchange(&self) -> Result<RefreshResponse, Fault> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      match self.token {
        Some(token) => Ok(RefreshResponse {
          token: token.to_string(),
        }),
        None => Err(Fault::api(401, "Invalid credentials")),
      }
    }
  }

  fn json_response(status: u16, body: &str) -> RawResponse {
    RawResponse {
      status,
      content_type: Some("application/json".to_string()),
      body: body.to_string(),
    }
  }

  fn gateway(
    online: bool,
    transport: Arc<MockTransport>,
    refresh_token: Option<&'static str>,
  ) -> (FetchGateway, Arc<CredentialStore>, Arc<MockExchange>) {
    let config = Config::with_base_url("http://localhost:8080/api");
    let connectivity = ConnectivityMonitor::new(&config, Arc::new(StaticProber(online)));

    let dir = std::env::temp_dir().join(format!(
      "krawl-gateway-test-{}-{:?}",
      std::process::id(),
      std::thread::current().id()
    ));
    let credentials = Arc::new(CredentialStore::new(Some(dir.join("auth.json"))).unwrap());
    credentials
      .set(
        Credential {
          token: "current-token".to_string(),
          user: AuthUser {
            id: "u1".to_string(),
            email: "u1@example.com".to_string(),
            username: "u1".to_string(),
          },
        },
        false,
      )
      .unwrap();

    let exchange = Arc::new(MockExchange {
      token: refresh_token,
      calls: AtomicUsize::new(0),
    });
    let refresh = Arc::new(RefreshManager::new(
      Arc::clone(&credentials),
      exchange.clone() as Arc<dyn TokenExchange>,
      Duration::from_secs(300),
    ));

    let gateway = FetchGateway::new(
      transport,
      connectivity,
      refresh,
      Arc::clone(&credentials),
      "http://localhost:8080/api",
    );
    (gateway, credentials, exchange)
  }

  #[tokio::test]
  async fn test_offline_short_circuits_without_touching_transport() {
    let transport = MockTransport::new(vec![]);
    let (gateway, _, _) = gateway(false, Arc::clone(&transport), None);

    let result: Result<Option<serde_json::Value>, _> = gateway.get("/gems").await;
    assert!(matches!(result, Err(Fault::Offline)));
    assert!(transport.seen().is_empty());
  }

  #[tokio::test]
  async fn test_bearer_attached_and_body_parsed() {
    let transport = MockTransport::new(vec![Ok(json_response(200, r#"[{"id":"g1"}]"#))]);
    let (gateway, _, _) = gateway(true, Arc::clone(&transport), None);

    let result: Option<serde_json::Value> = gateway.get("/gems").await.unwrap();
    assert_eq!(result.unwrap()[0]["id"], "g1");

    let seen = transport.seen();
    assert_eq!(seen[0].url, "http://localhost:8080/api/gems");
    assert_eq!(seen[0].bearer.as_deref(), Some("current-token"));
  }

  #[tokio::test]
  async fn test_empty_and_non_json_bodies_are_none() {
    for response in [
      json_response(204, ""),
      json_response(200, "   "),
      RawResponse {
        status: 200,
        content_type: Some("text/plain".to_string()),
        body: "ok".to_string(),
      },
      json_response(200, "{not json"),
    ] {
      let transport = MockTransport::new(vec![Ok(response)]);
      let (gateway, _, _) = gateway(true, transport, None);
      let result: Option<serde_json::Value> = gateway.get("/gems").await.unwrap();
      assert!(result.is_none());
    }
  }

  #[tokio::test]
  async fn test_api_fault_carries_structured_errors() {
    let transport = MockTransport::new(vec![Ok(json_response(
      400,
      r#"{"message":"Validation failed","errors":{"name":["required"]}}"#,
    ))]);
    let (gateway, _, _) = gateway(true, transport, None);

    let err = gateway.get::<serde_json::Value>("/gems").await.unwrap_err();
    match err {
      Fault::Api {
        status,
        message,
        errors,
      } => {
        assert_eq!(status, 400);
        assert_eq!(message, "Validation failed");
        assert_eq!(errors.unwrap()["name"], vec!["required".to_string()]);
      }
      other => panic!("expected Api fault, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_api_fault_falls_back_per_status() {
    let transport = MockTransport::new(vec![Ok(RawResponse {
      status: 404,
      content_type: None,
      body: String::new(),
    })]);
    let (gateway, _, _) = gateway(true, transport, None);

    let err = gateway.get::<serde_json::Value>("/gems").await.unwrap_err();
    assert!(matches!(
      err,
      Fault::Api { status: 404, ref message, .. } if message == "Resource not found"
    ));
  }

  #[tokio::test]
  async fn test_401_refreshes_and_retries_once() {
    let transport = MockTransport::new(vec![
      Ok(json_response(401, "")),
      Ok(json_response(200, r#"{"id":"g1"}"#)),
    ]);
    let (gateway, _, exchange) = gateway(true, Arc::clone(&transport), Some("new-token"));

    let result: Option<serde_json::Value> = gateway.get("/gems/g1").await.unwrap();
    assert_eq!(result.unwrap()["id"], "g1");
    assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);

    let seen = transport.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].bearer.as_deref(), Some("current-token"));
    assert_eq!(seen[1].bearer.as_deref(), Some("new-token"));
  }

  #[tokio::test]
  async fn test_401_with_failed_refresh_surfaces_original() {
    let transport = MockTransport::new(vec![Ok(json_response(401, ""))]);
    let (gateway, credentials, _) = gateway(true, Arc::clone(&transport), None);

    let err = gateway.get::<serde_json::Value>("/gems").await.unwrap_err();
    assert_eq!(err.status(), Some(401));
    // Refresh failure cleared local credential state
    assert!(credentials.load().is_none());
    assert_eq!(transport.seen().len(), 1);
  }

  #[tokio::test]
  async fn test_401_after_retry_clears_credentials() {
    let transport = MockTransport::new(vec![
      Ok(json_response(401, "")),
      Ok(json_response(401, "")),
    ]);
    let (gateway, credentials, _) = gateway(true, transport, Some("new-token"));

    let err = gateway.get::<serde_json::Value>("/gems").await.unwrap_err();
    assert_eq!(err.status(), Some(401));
    assert!(credentials.load().is_none());
  }

  #[tokio::test]
  async fn test_refresh_endpoint_never_recurses() {
    let transport = MockTransport::new(vec![Ok(json_response(401, ""))]);
    let (gateway, _, exchange) = gateway(true, Arc::clone(&transport), Some("new-token"));

    let err = gateway
      .post::<serde_json::Value>("/auth/refresh", &serde_json::json!({}))
      .await
      .unwrap_err();
    assert_eq!(err.status(), Some(401));
    assert_eq!(exchange.calls.load(Ordering::SeqCst), 0);
    assert_eq!(transport.seen().len(), 1);
  }

  #[tokio::test]
  async fn test_transport_failure_is_network_fault() {
    let transport = MockTransport::new(vec![Err(Fault::Network("connection reset".into()))]);
    let (gateway, _, _) = gateway(true, transport, None);

    let err = gateway.get::<serde_json::Value>("/gems").await.unwrap_err();
    assert!(matches!(err, Fault::Network(_)));
  }
}
