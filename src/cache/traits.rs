//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

/// Trait for entities that can be cached.
///
/// Implementors provide a domain-unique id and a creation timestamp, which
/// orders the collection and doubles as the delta-sync cursor.
pub trait Record: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier within the record's domain and owner
  fn id(&self) -> &str;

  /// Creation time, newest first in cached collections
  fn created_at(&self) -> DateTime<Utc>;
}

/// Records carrying a read flag.
pub trait Readable: Record {
  fn is_read(&self) -> bool;

  fn mark_read(&mut self);
}

/// Result from a cache read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  /// Data served from the persisted cache while a refresh runs behind it.
  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }

  /// Data just fetched from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  /// Network unavailable, serving whatever the store holds.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Persisted cache; a background sync was started
  Cache,
  /// Fresh data from network (cold start)
  Network,
  /// Cold start fetch failed, served from store (possibly empty)
  Offline,
}
