//! Cached collection for one (domain, owner) pair.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use std::collections::HashSet;

use super::traits::{Readable, Record};

/// Ordered, id-unique record collection.
///
/// Invariants: no two records share an id, and records are sorted by
/// `created_at` descending (ties keep insertion order).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<R> {
  records: Vec<R>,
}

impl<R> Default for CacheEntry<R> {
  fn default() -> Self {
    Self {
      records: Vec::new(),
    }
  }
}

/// Result of merging a fetch into an entry.
#[derive(Debug, Clone)]
pub struct MergeOutcome<R> {
  pub entry: CacheEntry<R>,
  /// Records whose id was not present before the merge
  pub added: Vec<R>,
  /// Whether `entry` differs from the entry merged into
  pub changed: bool,
}

impl<R: Record> CacheEntry<R> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Build an entry, keeping the first occurrence of each id.
  pub fn from_records(records: impl IntoIterator<Item = R>) -> Self {
    let mut seen = HashSet::new();
    let mut records: Vec<R> = records
      .into_iter()
      .filter(|r| seen.insert(r.id().to_string()))
      .collect();
    sort_newest_first(&mut records);
    Self { records }
  }

  pub fn records(&self) -> &[R] {
    &self.records
  }

  pub fn into_records(self) -> Vec<R> {
    self.records
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  pub fn get(&self, id: &str) -> Option<&R> {
    self.records.iter().find(|r| r.id() == id)
  }

  pub fn contains(&self, id: &str) -> bool {
    self.get(id).is_some()
  }

  /// Delta-sync cursor: newest `created_at` in the entry.
  pub fn cursor(&self) -> Option<DateTime<Utc>> {
    self.records.iter().map(Record::created_at).max()
  }

  /// Merge-by-id with `fresh` winning on conflict.
  pub fn merge(&self, fresh: Vec<R>) -> MergeOutcome<R> {
    let added: Vec<R> = CacheEntry::from_records(fresh.iter().cloned())
      .into_records()
      .into_iter()
      .filter(|r| !self.contains(r.id()))
      .collect();

    let entry = CacheEntry::from_records(fresh.into_iter().chain(self.records.iter().cloned()));
    let changed = entry != *self;

    MergeOutcome {
      entry,
      added,
      changed,
    }
  }

  /// Insert a record unless its id is already present.
  ///
  /// Returns `false` (and leaves the entry untouched) for a duplicate id.
  pub fn insert(&mut self, record: R) -> bool {
    if self.contains(record.id()) {
      return false;
    }
    self.records.insert(0, record);
    sort_newest_first(&mut self.records);
    true
  }

  pub fn remove(&mut self, id: &str) -> Option<R> {
    let pos = self.records.iter().position(|r| r.id() == id)?;
    Some(self.records.remove(pos))
  }

  /// Overlay `patch` fields onto the record with `id`.
  ///
  /// Returns `Ok(false)` when no such record exists. A patch that yields an
  /// invalid record, or changes the id, is rejected and nothing changes.
  pub fn patch(&mut self, id: &str, patch: &Map<String, Value>) -> Result<bool> {
    let Some(pos) = self.records.iter().position(|r| r.id() == id) else {
      return Ok(false);
    };

    let mut value = serde_json::to_value(&self.records[pos])
      .map_err(|e| eyre!("Failed to serialize record {}: {}", id, e))?;
    if let Value::Object(fields) = &mut value {
      for (name, field) in patch {
        fields.insert(name.clone(), field.clone());
      }
    }

    let updated: R = serde_json::from_value(value)
      .map_err(|e| eyre!("Patch produces an invalid record {}: {}", id, e))?;
    if updated.id() != id {
      return Err(eyre!("Patch may not change record id {}", id));
    }

    self.records[pos] = updated;
    sort_newest_first(&mut self.records);
    Ok(true)
  }

  /// Serialize to the persisted form: a JSON array, newest first.
  pub fn to_json(&self) -> Result<String> {
    serde_json::to_string(&self.records).map_err(|e| eyre!("Failed to serialize records: {}", e))
  }

  /// Parse the persisted form, re-establishing the invariants.
  pub fn from_json(json: &str) -> Result<Self> {
    let records: Vec<R> =
      serde_json::from_str(json).map_err(|e| eyre!("Failed to parse cached records: {}", e))?;
    Ok(Self::from_records(records))
  }
}

impl<R: Readable> CacheEntry<R> {
  /// Mark every unread record read, returning how many changed.
  pub fn mark_all_read(&mut self) -> usize {
    let mut changed = 0;
    for record in self.records.iter_mut().filter(|r| !r.is_read()) {
      record.mark_read();
      changed += 1;
    }
    changed
  }
}

/// Stable sort, so equal timestamps keep their relative order.
fn sort_newest_first<R: Record>(records: &mut [R]) {
  records.sort_by_key(|r| std::cmp::Reverse(r.created_at()));
}
