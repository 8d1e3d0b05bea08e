//! Cache layer that orchestrates stale-while-revalidate reads, background
//! delta sync and optimistic local writes for one record domain.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::domain::{DomainSpec, SyncPolicy};
use super::entry::CacheEntry;
use super::keys::{KeyRegistry, SyncTicket};
use super::traits::{CacheResult, Readable, Record};
use crate::notify::{ChangeEvent, ChangeNotifier, EventKind, EventPayload};
use crate::remote::{FetchError, FetchOptions, RemoteFetcher, SessionToken};
use crate::store::PersistentStore;

/// How a background sync ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
  /// Entry rewritten; `added` records were not cached before
  Updated { added: usize },
  /// Remote had nothing the cache didn't already hold
  Unchanged,
  /// Entry was cleared or refreshed while fetching; result dropped
  Discarded,
  /// Fetch or persistence failed; cache left as it was
  Failed,
}

/// Generic per-domain cache engine.
///
/// One instance serves every owner of its domain. Mutations of the same
/// `(domain, owner)` entry are serialized through a per-key async lock, and
/// each one re-reads the persisted entry under that lock before replacing
/// it, so a slow background sync and a fast local write cannot lose each
/// other's changes.
pub struct DomainCache<S, F, R> {
  spec: Arc<DomainSpec>,
  store: Arc<S>,
  fetcher: Arc<F>,
  notifier: ChangeNotifier,
  token: SessionToken,
  policy: SyncPolicy,
  keys: Arc<KeyRegistry>,
  _record: PhantomData<fn() -> R>,
}

impl<S, F, R> DomainCache<S, F, R>
where
  S: PersistentStore,
  F: RemoteFetcher,
  R: Record,
{
  pub fn new(spec: DomainSpec, store: Arc<S>, fetcher: Arc<F>, notifier: ChangeNotifier) -> Self {
    Self {
      spec: Arc::new(spec),
      store,
      fetcher,
      notifier,
      token: SessionToken::default(),
      policy: SyncPolicy::default(),
      keys: Arc::new(KeyRegistry::new()),
      _record: PhantomData,
    }
  }

  /// Use a shared session token for request authorization.
  pub fn with_session_token(mut self, token: SessionToken) -> Self {
    self.token = token;
    self
  }

  /// Set the retry policy for background syncs.
  pub fn with_sync_policy(mut self, policy: SyncPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn spec(&self) -> &DomainSpec {
    &self.spec
  }

  pub fn notifier(&self) -> &ChangeNotifier {
    &self.notifier
  }

  /// All records for `owner_id`, newest first. Never fails.
  pub async fn get_all(&self, owner_id: &str) -> Vec<R> {
    self.load(owner_id).await.data
  }

  /// Like `get_all`, but also reports where the data came from.
  ///
  /// 1. Cached entry present: return it and revalidate in the background
  /// 2. No entry: fetch everything, persist it if non-empty
  /// 3. Fetch failed: serve whatever the store holds (possibly nothing)
  pub async fn load(&self, owner_id: &str) -> CacheResult<Vec<R>> {
    let key = self.spec.storage_key(owner_id);

    if let Some(cached) = self.read_cached(&key).await {
      debug!(key = %key, count = cached.len(), "serving cached entry, revalidating");
      let records = cached.records().to_vec();
      self.spawn_background_sync(owner_id, cached);
      return CacheResult::from_cache(records);
    }

    let ticket = self.keys.begin_sync(&key);
    let result = self.initial_fetch(owner_id, &ticket).await;
    self.keys.finish_sync(&ticket);
    result
  }

  async fn initial_fetch(&self, owner_id: &str, ticket: &SyncTicket) -> CacheResult<Vec<R>> {
    let key = ticket.key();
    let fresh = match self.fetch_records(owner_id, None).await {
      Ok(records) => records,
      Err(e) => {
        warn!(key = %key, error = %e, "initial fetch failed, serving from store");
        let fallback = self.read_cached(key).await.unwrap_or_default();
        return CacheResult::offline(fallback.into_records());
      }
    };

    let _guard = self.keys.lock(key).await;
    // Removals queued ahead of us on the lock have only now left tombstones
    let fresh = self.without_removed(ticket, fresh);

    // A local write may have created the entry while we were fetching
    let entry = match self.read_entry(key).await {
      Ok(Some(current)) => current.merge(fresh).entry,
      Ok(None) => CacheEntry::from_records(fresh),
      Err(e) => {
        warn!(key = %key, error = %e, "replacing unreadable cache entry");
        CacheEntry::from_records(fresh)
      }
    };

    if !self.keys.is_current(ticket) {
      debug!(key = %key, "entry cleared during initial fetch, not persisting");
    } else if !entry.is_empty() {
      if let Err(e) = self.persist(key, &entry).await {
        warn!(key = %key, error = %e, "failed to persist initial fetch");
      }
    }

    CacheResult::from_network(entry.into_records())
  }

  /// Run `background_sync` on the runtime without waiting for it.
  pub fn spawn_background_sync(&self, owner_id: &str, cached: CacheEntry<R>) -> JoinHandle<SyncOutcome> {
    let cache = self.clone();
    let owner_id = owner_id.to_string();
    tokio::spawn(async move { cache.background_sync(&owner_id, &cached).await })
  }

  /// Fetch records newer than `cached` and merge them into the stored entry.
  ///
  /// Best effort: failures are logged and leave the entry untouched. The
  /// merge is applied to the entry as persisted at write time, not to
  /// `cached`, which only supplies the cursor.
  pub async fn background_sync(&self, owner_id: &str, cached: &CacheEntry<R>) -> SyncOutcome {
    let key = self.spec.storage_key(owner_id);
    let ticket = self.keys.begin_sync(&key);
    let outcome = self.run_sync(owner_id, cached.cursor(), &ticket).await;
    self.keys.finish_sync(&ticket);
    outcome
  }

  async fn run_sync(
    &self,
    owner_id: &str,
    since: Option<DateTime<Utc>>,
    ticket: &SyncTicket,
  ) -> SyncOutcome {
    let key = ticket.key();
    let fresh = match self.fetch_with_retry(owner_id, since).await {
      Ok(records) => records,
      Err(e) => {
        warn!(key = %key, error = %e, "background sync failed");
        return SyncOutcome::Failed;
      }
    };

    let guard = self.keys.lock(key).await;

    if !self.keys.is_current(ticket) {
      debug!(key = %key, "sync superseded, discarding result");
      return SyncOutcome::Discarded;
    }

    let current = match self.read_entry(key).await {
      Ok(Some(current)) => current,
      Ok(None) => {
        debug!(key = %key, "entry gone, discarding sync result");
        return SyncOutcome::Discarded;
      }
      Err(e) => {
        warn!(key = %key, error = %e, "failed to read entry for merge");
        return SyncOutcome::Failed;
      }
    };

    let merged = current.merge(self.without_removed(ticket, fresh));
    if !merged.changed {
      debug!(key = %key, "sync found nothing new");
      return SyncOutcome::Unchanged;
    }

    if let Err(e) = self.persist(key, &merged.entry).await {
      warn!(key = %key, error = %e, "failed to persist sync result");
      return SyncOutcome::Failed;
    }
    drop(guard);

    debug!(key = %key, added = merged.added.len(), "sync merged new records");
    if !merged.added.is_empty() {
      self.publish(EventKind::NewRecords, owner_id, records_payload(&merged.added));
    }
    SyncOutcome::Updated {
      added: merged.added.len(),
    }
  }

  /// Optimistically insert a record.
  ///
  /// Returns `Ok(false)` if a record with the same id is already cached.
  pub async fn add_one(&self, owner_id: &str, record: R) -> Result<bool> {
    let key = self.spec.storage_key(owner_id);
    let guard = self.keys.lock(&key).await;

    let mut entry = self.read_entry(&key).await?.unwrap_or_default();
    let payload = records_payload(std::slice::from_ref(&record));
    if !entry.insert(record) {
      return Ok(false);
    }
    self.persist(&key, &entry).await?;
    drop(guard);

    self.publish(EventKind::NewRecords, owner_id, payload);
    Ok(true)
  }

  /// Merge the fields of `patch` (a JSON object) into the record with `id`.
  ///
  /// Returns `Ok(false)` if the record isn't cached; nothing is fetched.
  pub async fn update_one(&self, owner_id: &str, id: &str, patch: &Value) -> Result<bool> {
    let fields = patch
      .as_object()
      .ok_or_else(|| eyre!("Patch for record {} must be a JSON object", id))?;

    let key = self.spec.storage_key(owner_id);
    let _guard = self.keys.lock(&key).await;

    let Some(mut entry) = self.read_entry(&key).await? else {
      return Ok(false);
    };
    if !entry.patch(id, fields)? {
      return Ok(false);
    }
    self.persist(&key, &entry).await?;
    Ok(true)
  }

  /// Remove the record with `id`, if cached.
  pub async fn remove_one(&self, owner_id: &str, id: &str) -> Result<bool> {
    let key = self.spec.storage_key(owner_id);
    let guard = self.keys.lock(&key).await;

    let Some(mut entry) = self.read_entry(&key).await? else {
      return Ok(false);
    };
    if entry.remove(id).is_none() {
      return Ok(false);
    }
    self.persist(&key, &entry).await?;
    self.keys.record_removal(&key, id);
    drop(guard);

    self.publish(
      EventKind::RecordRemoved,
      owner_id,
      EventPayload::RecordId(id.to_string()),
    );
    Ok(true)
  }

  /// Re-fetch the full collection and overwrite the entry.
  ///
  /// Unlike reads, this reports fetch failures; the entry is left untouched
  /// in that case. A `clear` landing mid-fetch also fails the refresh.
  pub async fn refresh_all(&self, owner_id: &str) -> Result<Vec<R>> {
    let key = self.spec.storage_key(owner_id);
    let ticket = self.keys.begin_sync(&key);
    let result = self.run_refresh(owner_id, &ticket).await;
    self.keys.finish_sync(&ticket);
    result
  }

  async fn run_refresh(&self, owner_id: &str, ticket: &SyncTicket) -> Result<Vec<R>> {
    let key = ticket.key();
    let fresh = self
      .fetch_records(owner_id, None)
      .await
      .map_err(|e| eyre!("Failed to refresh {}: {}", key, e))?;

    let guard = self.keys.lock(key).await;
    if !self.keys.is_current(ticket) {
      debug!(key = %key, "entry cleared or refreshed during refresh, not persisting");
      return Err(eyre!("Refresh of {} was superseded", key));
    }
    let fresh = self.without_removed(ticket, fresh);
    self.keys.invalidate(key);

    let previous = self.read_cached(key).await.unwrap_or_default();
    let entry = CacheEntry::from_records(fresh);
    self.persist(key, &entry).await?;
    drop(guard);

    let added: Vec<R> = entry
      .records()
      .iter()
      .filter(|r| !previous.contains(r.id()))
      .cloned()
      .collect();
    if !added.is_empty() {
      self.publish(EventKind::NewRecords, owner_id, records_payload(&added));
    }

    Ok(entry.into_records())
  }

  /// Delete the entry for `owner_id`. In-flight syncs will not restore it.
  pub async fn clear(&self, owner_id: &str) -> Result<()> {
    let key = self.spec.storage_key(owner_id);
    let _guard = self.keys.lock(&key).await;
    self.keys.invalidate(&key);
    self.store.delete(&key).await?;
    debug!(key = %key, "cache entry cleared");
    Ok(())
  }

  async fn fetch_records(
    &self,
    owner_id: &str,
    since: Option<DateTime<Utc>>,
  ) -> Result<Vec<R>, FetchError> {
    let url = self.spec.url_for(owner_id)?;
    let mut options = FetchOptions::default().with_bearer_token(self.token.get());
    if let Some(since) = since {
      options = options.with_query("since", since.to_rfc3339_opts(SecondsFormat::Millis, true));
    }

    let body = self.fetcher.fetch_json(&url, &options).await?;
    serde_json::from_value(body).map_err(FetchError::Malformed)
  }

  async fn fetch_with_retry(
    &self,
    owner_id: &str,
    since: Option<DateTime<Utc>>,
  ) -> Result<Vec<R>, FetchError> {
    let attempts = self.policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
      match self.fetch_records(owner_id, since).await {
        Ok(records) => return Ok(records),
        Err(e) if e.is_transient() && attempt < attempts => {
          debug!(domain = %self.spec.name(), attempt, error = %e, "sync fetch failed, retrying");
          tokio::time::sleep(self.policy.retry_delay).await;
          attempt += 1;
        }
        Err(e) => return Err(e),
      }
    }
  }

  fn without_removed(&self, ticket: &SyncTicket, records: Vec<R>) -> Vec<R> {
    records
      .into_iter()
      .filter(|r| !self.keys.removed_since(ticket, r.id()))
      .collect()
  }

  async fn read_entry(&self, key: &str) -> Result<Option<CacheEntry<R>>> {
    match self.store.get(key).await? {
      Some(json) => CacheEntry::from_json(&json).map(Some),
      None => Ok(None),
    }
  }

  /// `read_entry` for read paths: errors are logged and read as absent.
  async fn read_cached(&self, key: &str) -> Option<CacheEntry<R>> {
    match self.read_entry(key).await {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key = %key, error = %e, "failed to read cache entry");
        None
      }
    }
  }

  async fn persist(&self, key: &str, entry: &CacheEntry<R>) -> Result<()> {
    self.store.set(key, entry.to_json()?).await
  }

  fn publish(&self, kind: EventKind, owner_id: &str, payload: EventPayload) {
    self.notifier.publish(&ChangeEvent {
      kind,
      domain: self.spec.name().to_string(),
      owner_id: owner_id.to_string(),
      payload,
    });
  }
}

impl<S, F, R> DomainCache<S, F, R>
where
  S: PersistentStore,
  F: RemoteFetcher,
  R: Readable,
{
  /// Mark every cached record read. Returns how many changed.
  ///
  /// Persists and announces only when something changed.
  pub async fn mark_all_read(&self, owner_id: &str) -> Result<usize> {
    let key = self.spec.storage_key(owner_id);
    let guard = self.keys.lock(&key).await;

    let Some(mut entry) = self.read_entry(&key).await? else {
      return Ok(0);
    };
    let changed = entry.mark_all_read();
    if changed == 0 {
      return Ok(0);
    }
    self.persist(&key, &entry).await?;
    drop(guard);

    self.publish(EventKind::MarkedRead, owner_id, EventPayload::None);
    Ok(changed)
  }
}

impl<S, F, R> Clone for DomainCache<S, F, R> {
  fn clone(&self) -> Self {
    Self {
      spec: Arc::clone(&self.spec),
      store: Arc::clone(&self.store),
      fetcher: Arc::clone(&self.fetcher),
      notifier: self.notifier.clone(),
      token: self.token.clone(),
      policy: self.policy,
      keys: Arc::clone(&self.keys),
      _record: PhantomData,
    }
  }
}

fn records_payload<R: Record>(records: &[R]) -> EventPayload {
  EventPayload::Records(
    records
      .iter()
      .filter_map(|r| match serde_json::to_value(r) {
        Ok(value) => Some(value),
        Err(e) => {
          warn!(id = %r.id(), error = %e, "failed to serialize record for event");
          None
        }
      })
      .collect(),
  )
}
