//! The concrete record domains and the bundle that wires them together.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::cache::{DomainCache, DomainSpec, Readable, Record};
use crate::config::Config;
use crate::notify::ChangeNotifier;
use crate::remote::{HttpFetcher, RemoteFetcher, SessionToken};
use crate::store::{PersistentStore, StoreBackend};

pub const NOTIFICATIONS: &str = "notifications";
pub const MESSAGES: &str = "messages";
pub const FOLLOWERS: &str = "followers";

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  #[serde(alias = "_id")]
  pub id: String,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub is_read: bool,
  /// e.g. "like", "comment", "follow"
  #[serde(default, rename = "type")]
  pub kind: Option<String>,
  #[serde(default)]
  pub message: Option<String>,
  #[serde(default)]
  pub sender_id: Option<String>,
  /// Fields this crate doesn't model, kept for round-tripping
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
  #[serde(alias = "_id")]
  pub id: String,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub sender_id: Option<String>,
  #[serde(default)]
  pub receiver_id: Option<String>,
  #[serde(default)]
  pub text: Option<String>,
  #[serde(default)]
  pub status: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Follower {
  #[serde(alias = "_id")]
  pub id: String,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub user_name: Option<String>,
  #[serde(default)]
  pub profile_picture: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Record for Notification {
  fn id(&self) -> &str {
    &self.id
  }

  fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }
}

impl Readable for Notification {
  fn is_read(&self) -> bool {
    self.is_read
  }

  fn mark_read(&mut self) {
    self.is_read = true;
  }
}

impl Record for Message {
  fn id(&self) -> &str {
    &self.id
  }

  fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }
}

impl Record for Follower {
  fn id(&self) -> &str {
    &self.id
  }

  fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }
}

// ============================================================================
// Cache bundle
// ============================================================================

pub type NotificationCache<S, F> = DomainCache<S, F, Notification>;
pub type MessageCache<S, F> = DomainCache<S, F, Message>;
pub type FollowerCache<S, F> = DomainCache<S, F, Follower>;

/// The three domain caches of a session, sharing one store, one remote,
/// one notifier and one session token.
pub struct Caches<S, F> {
  pub notifications: NotificationCache<S, F>,
  pub messages: MessageCache<S, F>,
  pub followers: FollowerCache<S, F>,
  notifier: ChangeNotifier,
  token: SessionToken,
}

impl<S: PersistentStore, F: RemoteFetcher> Caches<S, F> {
  pub fn new(config: &Config, store: Arc<S>, fetcher: Arc<F>, token: SessionToken) -> Self {
    let notifier = ChangeNotifier::new();
    let build = Builder {
      config,
      store: &store,
      fetcher: &fetcher,
      notifier: &notifier,
      token: &token,
    };

    Self {
      notifications: build.cache(NOTIFICATIONS, &config.endpoints.notifications),
      messages: build.cache(MESSAGES, &config.endpoints.messages),
      followers: build.cache(FOLLOWERS, &config.endpoints.followers),
      notifier,
      token,
    }
  }

  /// Subscribe here to observe every domain.
  pub fn notifier(&self) -> &ChangeNotifier {
    &self.notifier
  }

  pub fn session(&self) -> &SessionToken {
    &self.token
  }

  /// Drop everything cached for `owner_id` (e.g. on logout).
  pub async fn clear_owner(&self, owner_id: &str) -> Result<()> {
    futures::try_join!(
      self.notifications.clear(owner_id),
      self.messages.clear(owner_id),
      self.followers.clear(owner_id),
    )?;
    Ok(())
  }
}

impl Caches<StoreBackend, HttpFetcher> {
  /// Build caches backed by the configured store and an HTTP remote.
  pub fn from_config(config: &Config, token: SessionToken) -> Result<Self> {
    let store = StoreBackend::from_config(&config.storage)?;
    let fetcher = HttpFetcher::new(config.timeout())?;
    Ok(Self::new(config, Arc::new(store), Arc::new(fetcher), token))
  }
}

struct Builder<'a, S, F> {
  config: &'a Config,
  store: &'a Arc<S>,
  fetcher: &'a Arc<F>,
  notifier: &'a ChangeNotifier,
  token: &'a SessionToken,
}

impl<S: PersistentStore, F: RemoteFetcher> Builder<'_, S, F> {
  fn cache<R: Record>(&self, name: &str, path: &str) -> DomainCache<S, F, R> {
    let spec = DomainSpec::new(name, self.config.endpoint_url(path));
    DomainCache::new(
      spec,
      Arc::clone(self.store),
      Arc::clone(self.fetcher),
      self.notifier.clone(),
    )
    .with_session_token(self.token.clone())
    .with_sync_policy(self.config.sync.policy())
  }
}
