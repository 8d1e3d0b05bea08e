//! Per-key coordination for cache writers.
//!
//! Every read-modify-persist sequence on a key runs under that key's async
//! writer lock. Background syncs additionally carry a `SyncTicket` so they
//! can tell, once their fetch returns, whether the entry was cleared or
//! refreshed underneath them and which ids were removed in the meantime.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
struct KeyState {
  writer: Arc<tokio::sync::Mutex<()>>,
  /// Bumped by clear/refresh; syncs from an older generation are dropped
  generation: u64,
  /// Bumped by each removal observed while a sync is in flight
  seq: u64,
  /// id -> seq at removal
  tombstones: HashMap<String, u64>,
  /// start seq -> number of syncs in flight that started there
  in_flight: BTreeMap<u64, usize>,
}

/// Marks an in-flight background sync for one key.
#[derive(Debug)]
pub struct SyncTicket {
  key: String,
  generation: u64,
  started: u64,
}

impl SyncTicket {
  pub fn key(&self) -> &str {
    &self.key
  }
}

/// Registry of per-key writer locks and sync bookkeeping.
#[derive(Default)]
pub struct KeyRegistry {
  keys: Mutex<HashMap<String, KeyState>>,
}

impl KeyRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn keys(&self) -> MutexGuard<'_, HashMap<String, KeyState>> {
    // State is plain bookkeeping, still usable after a panic elsewhere
    self.keys.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn with_state<T>(&self, key: &str, f: impl FnOnce(&mut KeyState) -> T) -> T {
    let mut keys = self.keys();
    f(keys.entry(key.to_string()).or_default())
  }

  /// Like `with_state` but never creates state for an unknown key.
  fn with_existing<T>(&self, key: &str, f: impl FnOnce(&mut KeyState) -> T) -> Option<T> {
    self.keys().get_mut(key).map(f)
  }

  /// Acquire the writer lock for `key`.
  pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
    let writer = self.with_state(key, |state| Arc::clone(&state.writer));
    KeyGuard {
      guard: Some(writer.lock_owned().await),
      registry: self,
      key: key.to_string(),
    }
  }

  /// Forget `key` once nothing references its state.
  ///
  /// No tickets exist while `in_flight` is empty, so resetting the
  /// generation here cannot make a superseded sync look current.
  fn prune(keys: &mut HashMap<String, KeyState>, key: &str) {
    let idle = keys.get(key).is_some_and(|state| {
      state.in_flight.is_empty()
        && state.tombstones.is_empty()
        && Arc::strong_count(&state.writer) == 1
    });
    if idle {
      keys.remove(key);
    }
  }

  #[cfg(test)]
  pub(crate) fn tracked_keys(&self) -> usize {
    self.keys().len()
  }

  /// Register a sync that is about to fetch.
  pub fn begin_sync(&self, key: &str) -> SyncTicket {
    self.with_state(key, |state| {
      *state.in_flight.entry(state.seq).or_default() += 1;
      SyncTicket {
        key: key.to_string(),
        generation: state.generation,
        started: state.seq,
      }
    })
  }

  /// Deregister a sync and drop tombstones no remaining sync needs.
  pub fn finish_sync(&self, ticket: &SyncTicket) {
    self.with_existing(&ticket.key, |state| {
      if let Some(count) = state.in_flight.get_mut(&ticket.started) {
        *count -= 1;
        if *count == 0 {
          state.in_flight.remove(&ticket.started);
        }
      }

      match state.in_flight.keys().next().copied() {
        Some(oldest) => state.tombstones.retain(|_, seq| *seq > oldest),
        None => state.tombstones.clear(),
      }
    });
    Self::prune(&mut self.keys(), &ticket.key);
  }

  /// Whether the entry is still the one the sync started against.
  pub fn is_current(&self, ticket: &SyncTicket) -> bool {
    self
      .with_existing(&ticket.key, |state| state.generation == ticket.generation)
      .unwrap_or(false)
  }

  /// Whether `id` was removed after the sync began.
  pub fn removed_since(&self, ticket: &SyncTicket, id: &str) -> bool {
    self
      .with_existing(&ticket.key, |state| {
        state
          .tombstones
          .get(id)
          .is_some_and(|seq| *seq > ticket.started)
      })
      .unwrap_or(false)
  }

  /// Note a local removal so in-flight syncs don't resurrect it.
  pub fn record_removal(&self, key: &str, id: &str) {
    self.with_existing(key, |state| {
      if !state.in_flight.is_empty() {
        state.seq += 1;
        state.tombstones.insert(id.to_string(), state.seq);
      }
    });
  }

  /// Supersede every in-flight sync for `key`.
  pub fn invalidate(&self, key: &str) {
    self.with_existing(key, |state| {
      state.generation += 1;
      state.tombstones.clear();
    });
    Self::prune(&mut self.keys(), key);
  }
}

/// Writer lock for one key; drops the key's bookkeeping once idle.
pub struct KeyGuard<'a> {
  guard: Option<OwnedMutexGuard<()>>,
  registry: &'a KeyRegistry,
  key: String,
}

impl Drop for KeyGuard<'_> {
  fn drop(&mut self) {
    // Release the writer first so its Arc count reflects other holders only
    self.guard.take();
    KeyRegistry::prune(&mut self.registry.keys(), &self.key);
  }
}
