//! Fakes shared by cache tests.

use chrono::{DateTime, Duration, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use url::Url;

use super::traits::{Readable, Record};
use crate::remote::{FetchError, FetchOptions, RemoteFetcher};
use crate::store::{MemoryStore, PersistentStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecord {
  pub id: String,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub body: Option<String>,
  #[serde(default)]
  pub read: bool,
}

impl TestRecord {
  pub fn with_body(mut self, body: &str) -> Self {
    self.body = Some(body.to_string());
    self
  }

  pub fn read(mut self) -> Self {
    self.read = true;
    self
  }
}

impl Record for TestRecord {
  fn id(&self) -> &str {
    &self.id
  }

  fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }
}

impl Readable for TestRecord {
  fn is_read(&self) -> bool {
    self.read
  }

  fn mark_read(&mut self) {
    self.read = true;
  }
}

/// Fixed base time plus `minutes`.
pub fn at(minutes: i64) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
}

pub fn rec(id: &str, minutes: i64) -> TestRecord {
  TestRecord {
    id: id.to_string(),
    created_at: at(minutes),
    body: None,
    read: false,
  }
}

pub fn json_of<T: Serialize>(records: &[T]) -> Value {
  serde_json::to_value(records).unwrap()
}

/// Scripted response for `FakeFetcher`.
pub enum Reply {
  Json(Value),
  Status(u16),
  Malformed,
}

/// Remote that replays scripted replies and records every request.
#[derive(Default)]
pub struct FakeFetcher {
  replies: Mutex<VecDeque<Reply>>,
  requests: Mutex<Vec<(Url, FetchOptions)>>,
  gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&self, reply: Reply) {
    self.replies.lock().unwrap().push_back(reply);
  }

  pub fn push_records<T: Serialize>(&self, records: &[T]) {
    self.push(Reply::Json(json_of(records)));
  }

  /// Block each request until the returned handle is notified.
  pub fn gate(&self) -> Arc<Notify> {
    let notify = Arc::new(Notify::new());
    *self.gate.lock().unwrap() = Some(Arc::clone(&notify));
    notify
  }

  pub fn requests(&self) -> Vec<(Url, FetchOptions)> {
    self.requests.lock().unwrap().clone()
  }

  pub fn request_count(&self) -> usize {
    self.requests.lock().unwrap().len()
  }
}

impl RemoteFetcher for FakeFetcher {
  async fn fetch_json(&self, url: &Url, options: &FetchOptions) -> Result<Value, FetchError> {
    self
      .requests
      .lock()
      .unwrap()
      .push((url.clone(), options.clone()));

    let gate = self.gate.lock().unwrap().clone();
    if let Some(gate) = gate {
      gate.notified().await;
    }

    let reply = self.replies.lock().unwrap().pop_front();
    match reply {
      Some(Reply::Json(value)) => Ok(value),
      Some(Reply::Status(status)) => Err(FetchError::Status {
        status,
        message: "scripted".to_string(),
      }),
      Some(Reply::Malformed) => {
        Err(FetchError::Malformed(serde_json::from_str::<Value>("<html>").unwrap_err()))
      }
      None => Err(FetchError::Status {
        status: 503,
        message: "no scripted reply".to_string(),
      }),
    }
  }
}

/// Memory store whose writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
  inner: MemoryStore,
  fail_writes: AtomicBool,
  fail_reads: AtomicBool,
  writes: AtomicUsize,
}

impl FlakyStore {
  pub fn fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  pub fn fail_reads(&self, fail: bool) {
    self.fail_reads.store(fail, Ordering::SeqCst);
  }

  /// Successful `set` calls so far.
  pub fn writes(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }
}

impl PersistentStore for FlakyStore {
  async fn get(&self, key: &str) -> Result<Option<String>> {
    if self.fail_reads.load(Ordering::SeqCst) {
      return Err(eyre!("disk read failed"));
    }
    self.inner.get(key).await
  }

  async fn set(&self, key: &str, value: String) -> Result<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(eyre!("quota exceeded"));
    }
    self.inner.set(key, value).await?;
    self.writes.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(eyre!("quota exceeded"));
    }
    self.inner.delete(key).await
  }
}
