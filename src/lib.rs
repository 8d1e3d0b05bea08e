//! feedcache - offline-first cache for per-user record collections.
//!
//! Collections (notifications, messages, followers) are persisted locally,
//! served instantly on read and reconciled against a remote JSON API in the
//! background. UI code only calls the cache's read/write operations and
//! subscribes to its change events.
//!
//! ```ignore
//! let config = Config::load(None)?;
//! let caches = Caches::from_config(&config, SessionToken::new(token))?;
//!
//! caches.notifier().subscribe("new-notifications-records", |event| {
//!     // append event.payload to the list
//! });
//!
//! let notifications = caches.notifications.get_all(&user_id).await;
//! caches.notifications.mark_all_read(&user_id).await?;
//! ```

pub mod cache;
pub mod config;
pub mod domains;
pub mod logging;
pub mod notify;
pub mod remote;
pub mod store;

pub use cache::{CacheEntry, CacheResult, CacheSource, DomainCache, DomainSpec, Readable, Record};
pub use config::Config;
pub use domains::{Caches, Follower, Message, Notification};
pub use notify::{ChangeEvent, ChangeNotifier, EventKind, EventPayload, Subscription};
pub use remote::{FetchError, FetchOptions, HttpFetcher, RemoteFetcher, SessionToken};
pub use store::{MemoryStore, NoopStore, PersistentStore, SqliteStore, StoreBackend};
