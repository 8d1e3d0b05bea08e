//! Authenticated JSON reads against domain endpoints.
//!
//! This is a pure I/O boundary: one request, one classified result. Retries
//! belong to the background sync policy, not here.

use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Longest slice of a non-JSON error body kept in an error message.
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("Invalid request URL: {0}")]
  InvalidUrl(String),
  #[error("HTTP request failed: {0}")]
  Transport(#[from] reqwest::Error),
  #[error("Remote returned status {status}: {message}")]
  Status { status: u16, message: String },
  #[error("Malformed JSON response: {0}")]
  Malformed(#[source] serde_json::Error),
}

impl FetchError {
  /// Whether another attempt could plausibly succeed.
  pub fn is_transient(&self) -> bool {
    match self {
      Self::InvalidUrl(_) => false,
      Self::Transport(_) | Self::Malformed(_) => true,
      Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
    }
  }

  /// HTTP status for `Status` errors.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Status { status, .. } => Some(*status),
      _ => None,
    }
  }
}

/// Bearer token shared by every cache of a signed-in session.
///
/// Cloning shares the slot, so `set` on login and `clear` on logout are seen
/// by all holders.
#[derive(Clone, Default)]
pub struct SessionToken {
  inner: Arc<RwLock<Option<String>>>,
}

impl SessionToken {
  pub fn new(value: impl Into<String>) -> Self {
    let token = Self::default();
    token.set(value);
    token
  }

  pub fn set(&self, token: impl Into<String>) {
    if let Ok(mut slot) = self.inner.write() {
      *slot = Some(token.into());
    }
  }

  pub fn clear(&self) {
    if let Ok(mut slot) = self.inner.write() {
      *slot = None;
    }
  }

  pub fn get(&self) -> Option<String> {
    self.inner.read().ok().and_then(|slot| slot.clone())
  }
}

impl std::fmt::Debug for SessionToken {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = if self.get().is_some() {
      "[REDACTED]"
    } else {
      "<unset>"
    };
    f.debug_struct("SessionToken").field("token", &state).finish()
  }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
  /// Sent as `Authorization: Bearer <token>` when present
  pub bearer_token: Option<String>,
  /// Extra query parameters appended to the URL
  pub query: Vec<(String, String)>,
}

impl FetchOptions {
  pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
    self.bearer_token = token;
    self
  }

  pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.query.push((name.into(), value.into()));
    self
  }

  /// Apply the query parameters to `url`.
  pub fn request_url(&self, url: &Url) -> Url {
    let mut url = url.clone();
    if !self.query.is_empty() {
      let mut pairs = url.query_pairs_mut();
      for (name, value) in &self.query {
        pairs.append_pair(name, value);
      }
    }
    url
  }
}

/// Performs authenticated JSON reads.
pub trait RemoteFetcher: Send + Sync + 'static {
  /// GET `url` and parse the body as JSON.
  ///
  /// Non-2xx responses become `FetchError::Status`, unparseable bodies
  /// become `FetchError::Malformed`.
  fn fetch_json(
    &self,
    url: &Url,
    options: &FetchOptions,
  ) -> impl Future<Output = Result<Value, FetchError>> + Send;
}

/// `RemoteFetcher` backed by a reqwest client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self { client })
  }
}

impl RemoteFetcher for HttpFetcher {
  async fn fetch_json(&self, url: &Url, options: &FetchOptions) -> Result<Value, FetchError> {
    let mut request = self
      .client
      .get(options.request_url(url))
      .header(ACCEPT, "application/json");
    if let Some(token) = &options.bearer_token {
      request = request.bearer_auth(token);
    }

    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
      return Err(FetchError::Status {
        status: status.as_u16(),
        message: extract_message(status, &body),
      });
    }

    serde_json::from_str(&body).map_err(FetchError::Malformed)
  }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
  message: Option<String>,
  error: Option<String>,
}

/// Best-effort human message from an error response body.
fn extract_message(status: StatusCode, body: &str) -> String {
  if let Ok(payload) = serde_json::from_str::<ErrorBody>(body) {
    if let Some(message) = payload.message.or(payload.error) {
      let message = message.trim();
      if !message.is_empty() {
        return message.to_string();
      }
    }
  }

  let trimmed = body.trim();
  if trimmed.is_empty() {
    return status
      .canonical_reason()
      .map(String::from)
      .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
  }

  match trimmed.char_indices().nth(MAX_ERROR_BODY) {
    Some((cut, _)) => format!("{}...", &trimmed[..cut]),
    None => trimmed.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  /// Serve a single canned HTTP response and hand back the raw request.
  async fn serve_once(
    status_line: &'static str,
    body: &'static str,
  ) -> (Url, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut buf = vec![0u8; 4096];
      let n = socket.read(&mut buf).await.unwrap();
      let request = String::from_utf8_lossy(&buf[..n]).to_string();

      let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_line,
        body.len(),
        body
      );
      socket.write_all(response.as_bytes()).await.unwrap();
      socket.shutdown().await.ok();
      request
    });

    let url = Url::parse(&format!("http://{}/api/notifications", addr)).unwrap();
    (url, handle)
  }

  fn fetcher() -> HttpFetcher {
    HttpFetcher::new(Duration::from_secs(5)).unwrap()
  }

  #[tokio::test]
  async fn test_fetch_sends_auth_and_query() {
    let (url, server) = serve_once("200 OK", r#"[{"id":"n1"}]"#).await;
    let options = FetchOptions::default()
      .with_bearer_token(Some("tok123".to_string()))
      .with_query("since", "2024-01-01T00:00:00+00:00");

    let value = fetcher().fetch_json(&url, &options).await.unwrap();
    assert_eq!(value, serde_json::json!([{ "id": "n1" }]));

    let request = server.await.unwrap();
    assert!(request.starts_with("GET /api/notifications?since=2024-01-01T00%3A00%3A00%2B00%3A00 "));
    assert!(request
      .to_lowercase()
      .contains("authorization: bearer tok123"));
  }

  #[tokio::test]
  async fn test_non_success_status_is_classified() {
    let (url, server) = serve_once("401 Unauthorized", r#"{"message":"Token expired"}"#).await;

    let err = fetcher()
      .fetch_json(&url, &FetchOptions::default())
      .await
      .unwrap_err();
    server.await.unwrap();

    assert_eq!(err.status(), Some(401));
    assert!(!err.is_transient());
    assert!(err.to_string().contains("Token expired"));
  }

  #[tokio::test]
  async fn test_invalid_json_is_malformed() {
    let (url, server) = serve_once("200 OK", "<html>oops</html>").await;

    let err = fetcher()
      .fetch_json(&url, &FetchOptions::default())
      .await
      .unwrap_err();
    server.await.unwrap();

    assert!(matches!(err, FetchError::Malformed(_)));
    assert!(err.is_transient());
  }

  #[test]
  fn test_extract_message_variants() {
    assert_eq!(
      extract_message(StatusCode::BAD_REQUEST, r#"{"error":"bad since"}"#),
      "bad since"
    );
    assert_eq!(
      extract_message(StatusCode::BAD_GATEWAY, "  upstream down  "),
      "upstream down"
    );
    assert_eq!(
      extract_message(StatusCode::SERVICE_UNAVAILABLE, ""),
      "Service Unavailable"
    );

    let long = "x".repeat(500);
    let message = extract_message(StatusCode::INTERNAL_SERVER_ERROR, &long);
    assert_eq!(message.len(), MAX_ERROR_BODY + 3);
  }

  #[test]
  fn test_transient_classification() {
    let status = |status| FetchError::Status {
      status,
      message: String::new(),
    };
    assert!(status(503).is_transient());
    assert!(status(429).is_transient());
    assert!(!status(404).is_transient());
    assert!(!FetchError::InvalidUrl("x".to_string()).is_transient());
  }

  #[test]
  fn test_session_token_is_shared_and_redacted() {
    let token = SessionToken::new("secret");
    let shared = token.clone();
    assert_eq!(shared.get().as_deref(), Some("secret"));

    let debug = format!("{token:?}");
    assert!(!debug.contains("secret"));

    shared.clear();
    assert_eq!(token.get(), None);
  }
}
