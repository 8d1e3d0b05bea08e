//! Persistent key/value storage for cached collections.
//!
//! The cache engine only ever reads and replaces whole values by key, so a
//! backend needs nothing more than `get`/`set`/`delete`. Every `set` is an
//! atomic replace: a failed write leaves the previously stored value intact.

mod memory;
mod sqlite;

use color_eyre::Result;
use std::future::Future;

pub use memory::{MemoryStore, NoopStore};
pub use sqlite::SqliteStore;

/// Async key/value store that survives restarts (for durable backends).
///
/// A missing key is not an error: `get` returns `Ok(None)` and `delete` is a
/// no-op. Errors are reserved for the storage layer itself failing.
pub trait PersistentStore: Send + Sync + 'static {
  /// Read the value stored under `key`.
  fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

  /// Replace the value stored under `key`.
  fn set(&self, key: &str, value: String) -> impl Future<Output = Result<()>> + Send;

  /// Remove `key` and its value.
  fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Backend selected by configuration.
pub enum StoreBackend {
  Sqlite(SqliteStore),
  Noop(NoopStore),
}

impl StoreBackend {
  pub fn from_config(config: &crate::config::StorageConfig) -> Result<Self> {
    if !config.enabled {
      return Ok(Self::Noop(NoopStore));
    }
    let store = match &config.path {
      Some(path) => SqliteStore::open_at(path)?,
      None => SqliteStore::open()?,
    };
    Ok(Self::Sqlite(store))
  }
}

impl PersistentStore for StoreBackend {
  async fn get(&self, key: &str) -> Result<Option<String>> {
    match self {
      Self::Sqlite(store) => store.get(key).await,
      Self::Noop(store) => store.get(key).await,
    }
  }

  async fn set(&self, key: &str, value: String) -> Result<()> {
    match self {
      Self::Sqlite(store) => store.set(key, value).await,
      Self::Noop(store) => store.set(key, value).await,
    }
  }

  async fn delete(&self, key: &str) -> Result<()> {
    match self {
      Self::Sqlite(store) => store.delete(key).await,
      Self::Noop(store) => store.delete(key).await,
    }
  }
}
