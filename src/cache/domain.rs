//! Per-domain configuration for the generic cache engine.

use std::time::Duration;
use url::Url;

use crate::remote::FetchError;

/// Placeholder substituted with the owner id in endpoint templates.
pub const OWNER_PLACEHOLDER: &str = "{owner_id}";

/// What distinguishes one domain cache from another: its name (which is
/// also the storage key prefix and event name stem) and where to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSpec {
  name: String,
  endpoint: String,
}

impl DomainSpec {
  /// `endpoint` is an absolute URL template, optionally containing
  /// `{owner_id}`.
  pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      endpoint: endpoint.into(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  /// Persistence key, `<domain>_<ownerId>`.
  pub fn storage_key(&self, owner_id: &str) -> String {
    format!("{}_{}", self.name, owner_id)
  }

  /// Endpoint URL for `owner_id`.
  pub fn url_for(&self, owner_id: &str) -> Result<Url, FetchError> {
    // Owner fills one path segment: everything but unreserved chars is escaped
    let owner = urlencoding::encode(owner_id);
    let raw = self.endpoint.replace(OWNER_PLACEHOLDER, &owner);
    Url::parse(&raw).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", raw, e)))
  }
}

/// Retry policy for background syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
  /// Total attempts, including the first
  pub max_attempts: u32,
  /// Pause between attempts
  pub retry_delay: Duration,
}

impl Default for SyncPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      retry_delay: Duration::from_millis(500),
    }
  }
}
