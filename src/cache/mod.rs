//! Generic offline-first cache for per-owner record collections.
//!
//! This module provides a domain-agnostic caching engine that:
//! - Serves persisted collections immediately and revalidates them in the background
//! - Fetches only records created after the newest cached one (delta sync)
//! - Merges by id with fetched records winning, keeping newest-first order
//! - Applies optimistic local writes under a per-key async lock

mod domain;
mod entry;
mod keys;
mod layer;
#[cfg(test)]
pub(crate) mod testing;
mod traits;

pub use domain::{DomainSpec, SyncPolicy, OWNER_PLACEHOLDER};
pub use entry::{CacheEntry, MergeOutcome};
pub use layer::{DomainCache, SyncOutcome};
pub use traits::{CacheResult, CacheSource, Readable, Record};
