//! Change notifications for cache observers.
//!
//! Fire-and-forget publish/subscribe: dispatch is synchronous, in
//! subscription order, on the publishing task. Nothing is buffered, so a
//! subscriber that joins after an event was published has missed it.

use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::trace;

/// Kinds of cache mutation announced to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
  /// Records appeared (background sync or optimistic add)
  NewRecords,
  /// A record was removed locally
  RecordRemoved,
  /// Every record was marked read
  MarkedRead,
}

impl EventKind {
  /// Wire name of this event for `domain`, e.g. `new-notifications-records`.
  pub fn event_name(self, domain: &str) -> String {
    match self {
      Self::NewRecords => format!("new-{}-records", domain),
      Self::RecordRemoved => format!("{}-record-removed", domain),
      Self::MarkedRead => format!("{}-marked-read", domain),
    }
  }
}

/// Minimal delta carried by an event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
  /// Only the records that were not cached before
  Records(Vec<Value>),
  /// Id of the affected record
  RecordId(String),
  None,
}

/// A single cache mutation announcement.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
  pub kind: EventKind,
  pub domain: String,
  pub owner_id: String,
  pub payload: EventPayload,
}

impl ChangeEvent {
  pub fn name(&self) -> String {
    self.kind.event_name(&self.domain)
  }
}

type Handler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
  next_id: u64,
  handlers: Vec<(u64, String, Handler)>,
}

// A handler panicking elsewhere must not silence the registry
fn lock_registry(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
  registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Callback registry keyed by event name.
///
/// Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
  registry: Arc<Mutex<Registry>>,
}

impl ChangeNotifier {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register `handler` for events named `event_name`.
  ///
  /// The subscription stays active until `Subscription::unsubscribe` is
  /// called, even if the handle itself is dropped.
  pub fn subscribe<F>(&self, event_name: impl Into<String>, handler: F) -> Subscription
  where
    F: Fn(&ChangeEvent) + Send + Sync + 'static,
  {
    let mut registry = lock_registry(&self.registry);
    registry.next_id += 1;
    let id = registry.next_id;
    let handler: Handler = Arc::new(handler);
    registry.handlers.push((id, event_name.into(), handler));

    Subscription {
      id,
      registry: Arc::downgrade(&self.registry),
    }
  }

  /// Deliver `event` to every current subscriber of its name.
  ///
  /// Returns how many handlers ran.
  pub fn publish(&self, event: &ChangeEvent) -> usize {
    let name = event.name();

    // Snapshot so handlers may subscribe or unsubscribe while running
    let handlers: Vec<Handler> = lock_registry(&self.registry)
      .handlers
      .iter()
      .filter(|(_, subscribed, _)| *subscribed == name)
      .map(|(_, _, handler)| Arc::clone(handler))
      .collect();

    if handlers.is_empty() {
      trace!(event = %name, "no subscribers for cache event");
    }

    for handler in &handlers {
      handler(event);
    }
    handlers.len()
  }

  /// Number of live subscriptions for `event_name`.
  pub fn subscriber_count(&self, event_name: &str) -> usize {
    lock_registry(&self.registry)
      .handlers
      .iter()
      .filter(|(_, name, _)| name == event_name)
      .count()
  }
}

impl std::fmt::Debug for ChangeNotifier {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let count = lock_registry(&self.registry).handlers.len();
    f.debug_struct("ChangeNotifier")
      .field("subscriptions", &count)
      .finish()
  }
}

/// Handle returned by `ChangeNotifier::subscribe`.
#[derive(Debug)]
pub struct Subscription {
  id: u64,
  registry: Weak<Mutex<Registry>>,
}

impl Subscription {
  /// Stop receiving events.
  pub fn unsubscribe(self) {
    let Some(shared) = self.registry.upgrade() else {
      return;
    };
    let mut registry = lock_registry(&shared);
    registry.handlers.retain(|(id, _, _)| *id != self.id);
  }
}
