//! In-memory entry storage for cached queries.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::key::QueryKey;
use super::layer::QueryError;

/// Type-erased cached value. Each key always holds the same concrete type.
pub(crate) type Payload = Arc<dyn Any + Send + Sync>;

/// Outcome of one fetch, shared by every reader attached to it.
pub(crate) type FetchOutcome = Result<Payload, QueryError>;

pub(crate) type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// Produces a fresh fetch future for a key. Called once per attempt.
pub(crate) type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Payload, crate::api::ApiError>> + Send + Sync>;

/// Whether a fetch is running for the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
  Idle,
  Fetching,
}

/// Whether the cached value may be trusted until it goes stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
  Valid,
  /// A write patched the value locally; the next read must refetch
  Invalidated,
}

/// The fetch currently registered for a key. Readers attach to it instead
/// of starting their own.
pub(crate) struct Inflight {
  pub generation: u64,
  pub future: SharedFetch,
  /// Stops the task when an invalidation replaces this fetch
  pub abort: AbortHandle,
}

/// One cached query.
pub(crate) struct Entry {
  pub data: Option<Payload>,
  pub updated_at: Option<Instant>,
  pub updated_at_wall: Option<DateTime<Utc>>,
  pub fetch_status: FetchStatus,
  pub validity: Validity,
  pub error: Option<QueryError>,
  /// Failed attempts of the current or last fetch
  pub failure_count: u32,
  /// Bumped by every invalidation; results of older fetches are not applied
  pub generation: u64,
  pub inflight: Option<Inflight>,
  pub fetcher: Option<Fetcher>,
  pub subscribers: usize,
  /// Set while no subscriber is attached; drives garbage collection
  pub inactive_since: Option<Instant>,
  /// Version counter observed by subscribers
  pub notify: watch::Sender<u64>,
}

impl Entry {
  pub fn new(now: Instant) -> Self {
    let (notify, _) = watch::channel(0);
    Self {
      data: None,
      updated_at: None,
      updated_at_wall: None,
      fetch_status: FetchStatus::Idle,
      validity: Validity::Valid,
      error: None,
      failure_count: 0,
      generation: 0,
      inflight: None,
      fetcher: None,
      subscribers: 0,
      inactive_since: Some(now),
      notify,
    }
  }

  /// Store a new value and mark it fresh.
  pub fn set_data(&mut self, data: Payload, now: Instant) {
    self.data = Some(data);
    self.updated_at = Some(now);
    self.updated_at_wall = Some(Utc::now());
  }

  pub fn is_stale(&self, stale_time: Duration, now: Instant) -> bool {
    match (self.validity, self.updated_at) {
      (Validity::Invalidated, _) | (_, None) => true,
      (Validity::Valid, Some(at)) => now.saturating_duration_since(at) >= stale_time,
    }
  }

  /// Whether the key needs a real fetch before its value can be trusted.
  pub fn needs_fetch(&self, stale_time: Duration, now: Instant) -> bool {
    self.data.is_none() || self.is_stale(stale_time, now)
  }

  pub fn status(&self, stale_time: Duration, now: Instant) -> QueryStatus {
    if self.fetch_status == FetchStatus::Fetching {
      QueryStatus::Fetching
    } else if self.error.is_some() {
      QueryStatus::Failed
    } else if self.data.is_none() {
      QueryStatus::Idle
    } else if self.is_stale(stale_time, now) {
      QueryStatus::Stale
    } else {
      QueryStatus::Fresh
    }
  }

  /// Tell subscribers the entry changed.
  pub fn bump(&self) {
    self.notify.send_modify(|version| *version = version.wrapping_add(1));
  }

  pub fn is_collectable(&self, gc_time: Duration, now: Instant) -> bool {
    self.subscribers == 0
      && self.inflight.is_none()
      && self
        .inactive_since
        .is_some_and(|since| now.saturating_duration_since(since) >= gc_time)
  }
}

/// Lifecycle state of a query: `Idle → Fetching → {Fresh, Failed}`,
/// `Fresh → Stale` after the staleness threshold or an invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Nothing fetched yet
  Idle,
  /// A fetch (or its retries) is running; cached data is still served
  Fetching,
  Fresh,
  /// Served, but the next read revalidates
  Stale,
  /// The last fetch exhausted its retries or hit a non-retryable error
  Failed,
}

/// All entries, keyed by query.
#[derive(Default)]
pub(crate) struct EntryStore {
  entries: HashMap<QueryKey, Entry>,
}

impl EntryStore {
  pub fn get(&self, key: &QueryKey) -> Option<&Entry> {
    self.entries.get(key)
  }

  pub fn get_mut(&mut self, key: &QueryKey) -> Option<&mut Entry> {
    self.entries.get_mut(key)
  }

  pub fn get_or_insert(&mut self, key: QueryKey, now: Instant) -> &mut Entry {
    self.entries.entry(key).or_insert_with(|| Entry::new(now))
  }

  pub fn keys(&self) -> Vec<QueryKey> {
    let mut keys: Vec<QueryKey> = self.entries.keys().copied().collect();
    keys.sort();
    keys
  }

  /// Drop every entry that has been unobserved for `gc_time`.
  pub fn collect_garbage(&mut self, gc_time: Duration, now: Instant) -> Vec<QueryKey> {
    let expired: Vec<QueryKey> = self
      .entries
      .iter()
      .filter(|(_, entry)| entry.is_collectable(gc_time, now))
      .map(|(key, _)| *key)
      .collect();
    for key in &expired {
      self.entries.remove(key);
    }
    expired
  }
}
