//! In-process store backends.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;

use super::PersistentStore;

/// Store that keeps everything in a process-local map.
///
/// Nothing survives a restart. Useful for ephemeral sessions and as a fake
/// in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of keys currently stored.
  pub fn len(&self) -> usize {
    self.entries.lock().map(|e| e.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl PersistentStore for MemoryStore {
  async fn get(&self, key: &str) -> Result<Option<String>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  async fn set(&self, key: &str, value: String) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(key.to_string(), value);
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(key);
    Ok(())
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

impl PersistentStore for NoopStore {
  async fn get(&self, _key: &str) -> Result<Option<String>> {
    Ok(None) // Always miss
  }

  async fn set(&self, _key: &str, _value: String) -> Result<()> {
    Ok(()) // Discard
  }

  async fn delete(&self, _key: &str) -> Result<()> {
    Ok(())
  }
}
