//! Cache layer that orchestrates caching logic with network fetching.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::key::QueryKey;
use super::retry::RetryPolicy;
use super::storage::{
  Entry, EntryStore, FetchOutcome, FetchStatus, Fetcher, Inflight, Payload, QueryStatus,
  SharedFetch, Validity,
};
use super::traits::CacheResult;
use crate::api::ApiError;
use crate::query::{Query, QuerySnapshot};

/// Why a cached read produced no data.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
  #[error(transparent)]
  Api(Arc<ApiError>),

  #[error("fetch for {0} was aborted: {1}")]
  Aborted(QueryKey, String),

  #[error("fetch for {0} was replaced by a newer one")]
  Superseded(QueryKey),

  #[error("no fetcher registered for {0}")]
  Unregistered(QueryKey),

  #[error("cache entry {0} holds a value of a different type")]
  TypeMismatch(QueryKey),
}

impl QueryError {
  #[cfg(test)]
  pub fn api(&self) -> Option<&ApiError> {
    match self {
      Self::Api(err) => Some(err),
      _ => None,
    }
  }

  pub fn user_message(&self) -> String {
    match self {
      Self::Api(err) => err.user_message(),
      other => other.to_string(),
    }
  }
}

impl From<ApiError> for QueryError {
  fn from(err: ApiError) -> Self {
    Self::Api(Arc::new(err))
  }
}

/// Tuning for every query held by a [`CacheLayer`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
  /// How long before cached data is considered stale
  pub stale_time: Duration,
  /// How long an unobserved entry is kept
  pub gc_time: Duration,
  pub retry: RetryPolicy,
  pub refetch_on_window_focus: bool,
  pub refetch_on_reconnect: bool,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      stale_time: Duration::from_secs(5 * 60),
      gc_time: Duration::from_secs(10 * 60),
      retry: RetryPolicy::default(),
      refetch_on_window_focus: false,
      refetch_on_reconnect: true,
    }
  }
}

/// One line of [`CacheLayer::summary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySummary {
  pub key: QueryKey,
  pub status: QueryStatus,
  pub validity: Validity,
  pub subscribers: usize,
  pub failure_count: u32,
  /// Time since the value was last written
  pub age: Option<Duration>,
}

struct Inner {
  store: Mutex<EntryStore>,
  options: CacheOptions,
}

/// Keyed store of server state shared by everything that reads or writes
/// catalog data.
///
/// Construct one per session and hand out clones; clones share the same
/// entries. The store lock is never held across an await, so every update
/// to an entry is atomic with respect to other tasks. Methods that start
/// fetches must be called from within a tokio runtime.
#[derive(Clone)]
pub struct CacheLayer {
  inner: Arc<Inner>,
}

impl CacheLayer {
  pub fn new(options: CacheOptions) -> Self {
    Self {
      inner: Arc::new(Inner {
        store: Mutex::new(EntryStore::default()),
        options,
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, EntryStore> {
    self
      .inner
      .store
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Read with a stale-while-revalidate strategy.
  ///
  /// 1. Fresh cached value - return it, no request
  /// 2. Stale or invalidated value - return it and refetch in the background
  /// 3. No value - start (or join) the fetch for `key` and wait for it
  ///
  /// The fetcher is remembered for background refetches of the key.
  pub async fn fetch<T, F, Fut>(&self, key: QueryKey, fetcher: F) -> Result<CacheResult<T>, QueryError>
  where
    T: Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    let pending = {
      let mut store = self.lock();
      let now = Instant::now();
      let entry = store.get_or_insert(key, now);
      entry.fetcher = Some(erase_fetcher(fetcher));
      if entry.subscribers == 0 {
        entry.inactive_since = Some(now);
      }

      if let Some(payload) = entry.data.clone() {
        let stale = entry.is_stale(self.inner.options.stale_time, now);
        if stale {
          debug!(key = %key, "Serving stale data while revalidating");
          self.spawn_fetch(key, entry);
        }
        let data = downcast::<T>(key, payload)?;
        return Ok(CacheResult::from_cache(data, entry.updated_at_wall, stale));
      }

      self.pending_fetch(key, entry)
    };

    let data = downcast::<T>(key, self.await_fetch(key, pending).await?)?;
    let updated_at = self.lock().get(&key).and_then(|e| e.updated_at_wall);
    Ok(CacheResult::from_network(data, updated_at))
  }

  /// Fetch `key` from the network regardless of freshness, joining a fetch
  /// that is already running. The key must have been read before.
  pub async fn refetch<T>(&self, key: QueryKey) -> Result<CacheResult<T>, QueryError>
  where
    T: Send + Sync + 'static,
  {
    let pending = {
      let mut store = self.lock();
      let entry = store
        .get_mut(&key)
        .filter(|e| e.fetcher.is_some())
        .ok_or(QueryError::Unregistered(key))?;
      self.pending_fetch(key, entry)
    };

    let data = downcast::<T>(key, self.await_fetch(key, pending).await?)?;
    let updated_at = self.lock().get(&key).and_then(|e| e.updated_at_wall);
    Ok(CacheResult::from_network(data, updated_at))
  }

  /// Attach an observer to `key`, fetching if there is no trustworthy value.
  pub fn subscribe<T, F, Fut>(&self, key: QueryKey, fetcher: F) -> Query<T>
  where
    T: Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    let mut store = self.lock();
    let now = Instant::now();
    let entry = store.get_or_insert(key, now);
    entry.fetcher = Some(erase_fetcher(fetcher));
    entry.subscribers += 1;
    entry.inactive_since = None;

    if entry.needs_fetch(self.inner.options.stale_time, now) {
      self.spawn_fetch(key, entry);
    }

    Query::new(self.clone(), key, entry.notify.subscribe())
  }

  pub(crate) fn unsubscribe(&self, key: QueryKey) {
    let mut store = self.lock();
    if let Some(entry) = store.get_mut(&key) {
      entry.subscribers = entry.subscribers.saturating_sub(1);
      if entry.subscribers == 0 {
        entry.inactive_since = Some(Instant::now());
      }
    }
  }

  /// Current state of `key` as seen by an observer.
  pub fn snapshot<T>(&self, key: QueryKey) -> QuerySnapshot<T>
  where
    T: Send + Sync + 'static,
  {
    let store = self.lock();
    let Some(entry) = store.get(&key) else {
      return QuerySnapshot::idle();
    };

    let now = Instant::now();
    let mut error = entry.error.clone();
    let data = match entry.data.clone().map(|p| downcast::<T>(key, p)) {
      Some(Ok(data)) => Some(data),
      Some(Err(mismatch)) => {
        error = Some(mismatch);
        None
      }
      None => None,
    };

    QuerySnapshot {
      status: entry.status(self.inner.options.stale_time, now),
      data,
      error,
      failure_count: entry.failure_count,
    }
  }

  /// Cached value of `key`, if any.
  pub fn get_query_data<T>(&self, key: QueryKey) -> Result<Option<Arc<T>>, QueryError>
  where
    T: Send + Sync + 'static,
  {
    let payload = self.lock().get(&key).and_then(|e| e.data.clone());
    payload.map(|p| downcast::<T>(key, p)).transpose()
  }

  /// Apply a confirmed write to the cached value of `key` and invalidate it.
  ///
  /// Both steps happen under one lock: the patched value is visible right
  /// away, and the next read (or, with active observers, an immediate
  /// background fetch) reconciles it with the server. The server accepted
  /// the write, so an earlier fetch failure no longer describes the entry.
  /// A missing value is not seeded. Returns whether a value was patched.
  pub fn apply_write<T, F>(&self, key: QueryKey, patch: F) -> Result<bool, QueryError>
  where
    T: Send + Sync + 'static,
    F: FnOnce(&T) -> T,
  {
    let mut store = self.lock();
    let now = Instant::now();
    let Some(entry) = store.get_mut(&key) else {
      return Ok(false);
    };

    let patched = match entry.data.clone() {
      Some(payload) => {
        let current = downcast::<T>(key, payload)?;
        entry.set_data(Arc::new(patch(&current)), now);
        entry.error = None;
        entry.failure_count = 0;
        true
      }
      None => false,
    };

    self.invalidate_entry(key, entry);
    Ok(patched)
  }

  /// Mark `key` as needing a refetch. Returns false if the key is unknown.
  #[cfg(test)]
  pub fn invalidate(&self, key: QueryKey) -> bool {
    let mut store = self.lock();
    match store.get_mut(&key) {
      Some(entry) => {
        self.invalidate_entry(key, entry);
        true
      }
      None => false,
    }
  }

  #[cfg(test)]
  pub fn validity(&self, key: QueryKey) -> Option<Validity> {
    self.lock().get(&key).map(|e| e.validity)
  }

  /// Refetch observed queries after connectivity comes back.
  pub fn on_reconnect(&self) -> usize {
    if !self.inner.options.refetch_on_reconnect {
      return 0;
    }
    self.refetch_observed("reconnect")
  }

  /// Refetch observed queries when the user returns to the session.
  /// Disabled unless `refetch_on_window_focus` is set.
  pub fn on_window_focus(&self) -> usize {
    if !self.inner.options.refetch_on_window_focus {
      debug!("Ignoring focus regain");
      return 0;
    }
    self.refetch_observed("focus")
  }

  /// Drop entries that have had no observer for the gc period.
  pub fn collect_garbage(&self) -> usize {
    let removed = self
      .lock()
      .collect_garbage(self.inner.options.gc_time, Instant::now());
    for key in &removed {
      debug!(key = %key, "Collected unused cache entry");
    }
    removed.len()
  }

  pub fn summary(&self) -> Vec<EntrySummary> {
    let store = self.lock();
    let now = Instant::now();
    store
      .keys()
      .into_iter()
      .filter_map(|key| {
        let entry = store.get(&key)?;
        Some(EntrySummary {
          key,
          status: entry.status(self.inner.options.stale_time, now),
          validity: entry.validity,
          subscribers: entry.subscribers,
          failure_count: entry.failure_count,
          age: entry.updated_at.map(|at| now.saturating_duration_since(at)),
        })
      })
      .collect()
  }

  fn refetch_observed(&self, reason: &'static str) -> usize {
    let mut store = self.lock();
    let now = Instant::now();
    let stale_time = self.inner.options.stale_time;
    let mut started = 0;

    for key in store.keys() {
      let Some(entry) = store.get_mut(&key) else {
        continue;
      };
      let wanted = entry.needs_fetch(stale_time, now) || entry.error.is_some();
      if entry.subscribers > 0 && entry.inflight.is_none() && wanted {
        self.spawn_fetch(key, entry);
        started += 1;
      }
    }

    info!(reason, started, "Refetching observed queries");
    started
  }

  fn invalidate_entry(&self, key: QueryKey, entry: &mut Entry) {
    entry.validity = Validity::Invalidated;
    entry.generation += 1;
    // The running fetch may predate the write; stop it so the key never has two.
    if let Some(inflight) = entry.inflight.take() {
      inflight.abort.abort();
      entry.fetch_status = FetchStatus::Idle;
    }
    debug!(key = %key, generation = entry.generation, "Invalidated");

    if entry.subscribers > 0 && entry.fetcher.is_some() {
      self.spawn_fetch(key, entry);
    }
    entry.bump();
  }

  /// Wait for a fetch of `key`. Readers whose fetch was replaced by an
  /// invalidation follow the replacement, starting it if nobody has.
  async fn await_fetch(&self, key: QueryKey, mut pending: SharedFetch) -> FetchOutcome {
    loop {
      match pending.await {
        Err(QueryError::Superseded(_)) => {
          let mut store = self.lock();
          let entry = store
            .get_mut(&key)
            .filter(|e| e.fetcher.is_some())
            .ok_or(QueryError::Superseded(key))?;
          debug!(key = %key, "Joining replacement fetch");
          pending = self.pending_fetch(key, entry);
        }
        outcome => return outcome,
      }
    }
  }

  /// The fetch running for `key`, started if there is none.
  fn pending_fetch(&self, key: QueryKey, entry: &mut Entry) -> SharedFetch {
    let inflight = match entry.inflight.take() {
      Some(inflight) => inflight,
      None => self.launch_fetch(key, entry),
    };
    let future = inflight.future.clone();
    entry.inflight = Some(inflight);
    future
  }

  /// Start a fetch for `key` unless one is already running.
  fn spawn_fetch(&self, key: QueryKey, entry: &mut Entry) {
    if entry.inflight.is_none() {
      entry.inflight = Some(self.launch_fetch(key, entry));
    }
  }

  /// The fetch runs in its own task so its result reaches the cache even
  /// when every reader has gone away.
  fn launch_fetch(&self, key: QueryKey, entry: &mut Entry) -> Inflight {
    let generation = entry.generation;
    let fetcher = entry.fetcher.clone();
    let layer = self.clone();

    entry.fetch_status = FetchStatus::Fetching;
    entry.failure_count = 0;
    entry.bump();
    debug!(key = %key, generation, "Fetching");

    let handle = tokio::spawn(async move {
      let outcome = match fetcher {
        Some(fetcher) => AssertUnwindSafe(layer.run_fetch(key, generation, &fetcher))
          .catch_unwind()
          .await
          .unwrap_or_else(|_| Err(QueryError::Aborted(key, "fetcher panicked".to_string()))),
        None => Err(QueryError::Unregistered(key)),
      };
      layer.finish_fetch(key, generation, &outcome);
      outcome
    });

    let abort = handle.abort_handle();
    let future = async move {
      handle.await.unwrap_or_else(|e| {
        if e.is_cancelled() {
          Err(QueryError::Superseded(key))
        } else {
          Err(QueryError::Aborted(key, e.to_string()))
        }
      })
    }
    .boxed()
    .shared();

    Inflight {
      generation,
      future,
      abort,
    }
  }

  /// Run one fetch, retrying transient failures per the retry policy.
  async fn run_fetch(&self, key: QueryKey, generation: u64, fetcher: &Fetcher) -> FetchOutcome {
    let policy = &self.inner.options.retry;
    let mut retries = 0;

    loop {
      match fetcher().await {
        Ok(payload) => return Ok(payload),
        Err(error) => {
          self.record_failure(key, generation);
          if !policy.should_retry(retries, &error) {
            warn!(key = %key, attempts = retries + 1, error = %error, "Fetch failed");
            return Err(error.into());
          }

          let delay = policy.delay_for(retries);
          info!(
            key = %key,
            retry = retries + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying fetch"
          );
          tokio::time::sleep(delay).await;
          retries += 1;
        }
      }
    }
  }

  fn record_failure(&self, key: QueryKey, generation: u64) {
    let mut store = self.lock();
    if let Some(entry) = store.get_mut(&key) {
      if entry.generation == generation {
        entry.failure_count += 1;
        entry.bump();
      }
    }
  }

  fn finish_fetch(&self, key: QueryKey, generation: u64, outcome: &FetchOutcome) {
    let mut store = self.lock();
    let now = Instant::now();
    let Some(entry) = store.get_mut(&key) else {
      return;
    };

    if entry
      .inflight
      .as_ref()
      .is_some_and(|inflight| inflight.generation == generation)
    {
      entry.inflight = None;
      entry.fetch_status = FetchStatus::Idle;
    }

    // A write invalidated the key while this fetch ran; its result predates the write.
    if entry.generation != generation {
      debug!(key = %key, generation, "Discarding superseded fetch result");
      return;
    }

    match outcome {
      Ok(payload) => {
        entry.set_data(payload.clone(), now);
        entry.validity = Validity::Valid;
        entry.error = None;
        entry.failure_count = 0;
        debug!(key = %key, "Fetched");
      }
      Err(error) => {
        entry.error = Some(error.clone());
      }
    }

    if entry.subscribers == 0 {
      entry.inactive_since = Some(now);
    }
    entry.bump();
  }
}

fn erase_fetcher<T, F, Fut>(fetcher: F) -> Fetcher
where
  T: Send + Sync + 'static,
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
{
  Arc::new(move || {
    let fut = fetcher();
    async move { fut.await.map(|data| Arc::new(data) as Payload) }.boxed()
  })
}

fn downcast<T>(key: QueryKey, payload: Payload) -> Result<Arc<T>, QueryError>
where
  T: Send + Sync + 'static,
{
  payload
    .downcast::<T>()
    .map_err(|_| QueryError::TypeMismatch(key))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::{Operation, RequestContext};
  use crate::cache::CacheSource;
  use futures::future::{ready, BoxFuture, Ready};
  use std::sync::atomic::{AtomicU32, Ordering};

  fn key() -> QueryKey {
    QueryKey::list("brands")
  }

  fn status_error(status: u16) -> ApiError {
    ApiError::Status {
      context: RequestContext::new("brand", Operation::List),
      status,
      message: None,
    }
  }

  /// Fetcher returning how many times it has been called.
  fn counter(calls: &Arc<AtomicU32>) -> impl Fn() -> Ready<Result<u32, ApiError>> + Send + Sync + 'static {
    let calls = calls.clone();
    move || ready(Ok(calls.fetch_add(1, Ordering::SeqCst) + 1))
  }

  /// Like `counter`, but each response takes 100ms.
  fn slow_counter(
    calls: &Arc<AtomicU32>,
  ) -> impl Fn() -> BoxFuture<'static, Result<u32, ApiError>> + Send + Sync + 'static {
    let calls = calls.clone();
    move || {
      let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
      async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(n)
      }
      .boxed()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_read_is_served_without_refetch() {
    let cache = CacheLayer::new(CacheOptions::default());
    let calls = Arc::new(AtomicU32::new(0));

    let first = cache.fetch(key(), counter(&calls)).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    tokio::time::advance(Duration::from_secs(299)).await;
    let second = cache.fetch(key(), counter(&calls)).await.unwrap();

    assert_eq!(second.source, CacheSource::CacheFresh);
    assert!(Arc::ptr_eq(&first.data, &second.data));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_read_serves_cached_value_and_revalidates() {
    let cache = CacheLayer::new(CacheOptions::default());
    let calls = Arc::new(AtomicU32::new(0));

    cache.fetch(key(), counter(&calls)).await.unwrap();
    tokio::time::advance(Duration::from_secs(300)).await;

    let stale = cache.fetch(key(), counter(&calls)).await.unwrap();
    assert_eq!(stale.source, CacheSource::CacheStale);
    assert_eq!(*stale.data, 1);

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.get_query_data::<u32>(key()).unwrap().as_deref(), Some(&2));
    assert_eq!(cache.snapshot::<u32>(key()).status, QueryStatus::Fresh);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_reads_share_one_request() {
    let cache = CacheLayer::new(CacheOptions::default());
    let calls = Arc::new(AtomicU32::new(0));

    let (a, b, c) = tokio::join!(
      cache.fetch(key(), slow_counter(&calls)),
      cache.fetch(key(), slow_counter(&calls)),
      cache.fetch(key(), slow_counter(&calls)),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
    assert!(Arc::ptr_eq(&a.data, &b.data));
    assert!(Arc::ptr_eq(&b.data, &c.data));
  }

  #[tokio::test(start_paused = true)]
  async fn test_server_errors_retry_with_backoff_then_fail() {
    let cache = CacheLayer::new(CacheOptions::default());
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let log = attempts.clone();
    let fetcher = move || {
      log.lock().unwrap().push(Instant::now());
      ready(Err::<u32, _>(status_error(500)))
    };

    let err = cache.fetch(key(), fetcher).await.unwrap_err();
    assert_eq!(err.api().and_then(ApiError::status), Some(500));

    let times = attempts.lock().unwrap().clone();
    assert_eq!(times.len(), 4);
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    for (gap, expected) in gaps.iter().zip([1, 2, 4]) {
      let expected = Duration::from_secs(expected);
      assert!(
        *gap >= expected && *gap < expected + Duration::from_millis(5),
        "gap {:?}, expected {:?}",
        gap,
        expected
      );
    }

    let snapshot = cache.snapshot::<u32>(key());
    assert_eq!(snapshot.status, QueryStatus::Failed);
    assert_eq!(snapshot.failure_count, 4);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(attempts.lock().unwrap().len(), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_client_error_fails_without_retry() {
    let cache = CacheLayer::new(CacheOptions::default());
    let calls = Arc::new(AtomicU32::new(0));

    let counted = calls.clone();
    let fetcher = move || {
      counted.fetch_add(1, Ordering::SeqCst);
      ready(Err::<u32, _>(status_error(422)))
    };

    let start = Instant::now();
    let err = cache.fetch(key(), fetcher).await.unwrap_err();

    assert_eq!(err.api().and_then(ApiError::status), Some(422));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(start.elapsed() < Duration::from_millis(1));
    assert!(cache.snapshot::<u32>(key()).is_error());
  }

  #[tokio::test(start_paused = true)]
  async fn test_throttled_errors_are_retried() {
    let cache = CacheLayer::new(CacheOptions::default());
    let calls = Arc::new(AtomicU32::new(0));

    let counted = calls.clone();
    let fetcher = move || {
      let n = counted.fetch_add(1, Ordering::SeqCst) + 1;
      ready(if n < 3 { Err(status_error(429)) } else { Ok(n) })
    };

    let result = cache.fetch(key(), fetcher).await.unwrap();
    assert_eq!(*result.data, 3);
    assert_eq!(cache.snapshot::<u32>(key()).failure_count, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_write_patches_value_and_forces_next_read_to_fetch() {
    let cache = CacheLayer::new(CacheOptions::default());
    let calls = Arc::new(AtomicU32::new(0));

    cache.fetch(key(), counter(&calls)).await.unwrap();
    assert!(cache.apply_write::<u32, _>(key(), |n| n + 100).unwrap());

    let snapshot = cache.snapshot::<u32>(key());
    assert_eq!(snapshot.data.as_deref(), Some(&101));
    assert_eq!(cache.validity(key()), Some(Validity::Invalidated));
    assert_eq!(snapshot.status, QueryStatus::Stale);

    // Nobody is observing, so nothing was fetched yet.
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let read = cache.fetch(key(), counter(&calls)).await.unwrap();
    assert_eq!(read.source, CacheSource::CacheStale);
    assert_eq!(*read.data, 101);

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let snapshot = cache.snapshot::<u32>(key());
    assert_eq!(snapshot.data.as_deref(), Some(&2));
    assert_eq!(cache.validity(key()), Some(Validity::Valid));
  }

  #[tokio::test(start_paused = true)]
  async fn test_write_without_cached_value_does_not_seed() {
    let cache = CacheLayer::new(CacheOptions::default());
    assert!(!cache.apply_write::<u32, _>(key(), |n| n + 1).unwrap());
    assert!(cache.get_query_data::<u32>(key()).unwrap().is_none());
    assert!(!cache.invalidate(key()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_started_before_write_does_not_overwrite_it() {
    let cache = CacheLayer::new(CacheOptions::default());
    let calls = Arc::new(AtomicU32::new(0));

    cache.fetch(key(), slow_counter(&calls)).await.unwrap();
    tokio::time::advance(Duration::from_secs(301)).await;

    // Stale read kicks off a background fetch that will answer 2.
    cache.fetch(key(), slow_counter(&calls)).await.unwrap();
    assert_eq!(cache.snapshot::<u32>(key()).status, QueryStatus::Fetching);

    cache.apply_write::<u32, _>(key(), |_| 42).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let snapshot = cache.snapshot::<u32>(key());
    assert_eq!(snapshot.data.as_deref(), Some(&42));
    assert_eq!(cache.validity(key()), Some(Validity::Invalidated));
    assert_eq!(snapshot.status, QueryStatus::Stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_subscriber_sees_loading_then_data() {
    let cache = CacheLayer::new(CacheOptions::default());
    let calls = Arc::new(AtomicU32::new(0));

    let mut query = cache.subscribe(key(), slow_counter(&calls));
    assert!(query.is_loading());
    assert_eq!(query.state().status, QueryStatus::Fetching);

    assert_eq!(*query.settled().await.unwrap(), 1);
    assert_eq!(query.state().status, QueryStatus::Fresh);
    assert!(!query.poll());

    cache.invalidate(key());
    assert!(query.poll());
    assert!(!query.poll());
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidation_refetches_observed_query_immediately() {
    let cache = CacheLayer::new(CacheOptions::default());
    let calls = Arc::new(AtomicU32::new(0));

    let mut query = cache.subscribe(key(), counter(&calls));
    query.settled().await.unwrap();

    cache.apply_write::<u32, _>(key(), |_| 42).unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(query.data().as_deref(), Some(&2));
    assert_eq!(cache.validity(key()), Some(Validity::Valid));
  }

  #[tokio::test(start_paused = true)]
  async fn test_departed_subscriber_does_not_cancel_fetch() {
    let cache = CacheLayer::new(CacheOptions::default());
    let calls = Arc::new(AtomicU32::new(0));

    drop(cache.subscribe(key(), slow_counter(&calls)));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(cache.get_query_data::<u32>(key()).unwrap().as_deref(), Some(&1));
    assert_eq!(cache.summary()[0].subscribers, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_gc_drops_only_unobserved_entries() {
    let cache = CacheLayer::new(CacheOptions::default());
    let calls = Arc::new(AtomicU32::new(0));

    cache.fetch(key(), counter(&calls)).await.unwrap();
    let observed = cache.subscribe(QueryKey::list("types"), counter(&calls));
    tokio::time::sleep(Duration::from_millis(1)).await;

    tokio::time::advance(Duration::from_secs(9 * 60)).await;
    assert_eq!(cache.collect_garbage(), 0);

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(cache.collect_garbage(), 1);
    assert!(cache.get_query_data::<u32>(key()).unwrap().is_none());
    assert!(observed.data().is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_refetches_but_focus_does_not() {
    let cache = CacheLayer::new(CacheOptions::default());
    let calls = Arc::new(AtomicU32::new(0));

    let mut query = cache.subscribe(key(), counter(&calls));
    query.settled().await.unwrap();
    tokio::time::advance(Duration::from_secs(6 * 60)).await;

    assert_eq!(cache.on_window_focus(), 0);
    assert_eq!(cache.on_reconnect(), 1);
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(query.state().status, QueryStatus::Fresh);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reading_key_as_wrong_type_is_an_error() {
    let cache = CacheLayer::new(CacheOptions::default());
    let calls = Arc::new(AtomicU32::new(0));
    cache.fetch(key(), counter(&calls)).await.unwrap();

    let err = cache.get_query_data::<String>(key()).unwrap_err();
    assert!(matches!(err, QueryError::TypeMismatch(k) if k == key()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_refetch_requires_known_key() {
    let cache = CacheLayer::new(CacheOptions::default());
    let err = cache.refetch::<u32>(key()).await.unwrap_err();
    assert!(matches!(err, QueryError::Unregistered(_)));

    let calls = Arc::new(AtomicU32::new(0));
    cache.fetch(key(), counter(&calls)).await.unwrap();
    let result = cache.refetch::<u32>(key()).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(*result.data, 2);
  }

  /// Tracks how many fetcher calls are running at once.
  struct Live {
    running: Arc<AtomicU32>,
  }

  impl Live {
    fn enter(running: &Arc<AtomicU32>, peak: &Arc<AtomicU32>) -> Self {
      let now = running.fetch_add(1, Ordering::SeqCst) + 1;
      peak.fetch_max(now, Ordering::SeqCst);
      Self {
        running: running.clone(),
      }
    }
  }

  impl Drop for Live {
    fn drop(&mut self) {
      self.running.fetch_sub(1, Ordering::SeqCst);
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidation_replaces_running_fetch() {
    let cache = CacheLayer::new(CacheOptions::default());
    let calls = Arc::new(AtomicU32::new(0));
    let running = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let fetcher = {
      let (calls, running, peak) = (calls.clone(), running.clone(), peak.clone());
      move || {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        let live = Live::enter(&running, &peak);
        async move {
          let _live = live;
          tokio::time::sleep(Duration::from_millis(100)).await;
          Ok::<u32, ApiError>(n)
        }
        .boxed()
      }
    };

    let _query = cache.subscribe(key(), fetcher.clone());
    let reader = tokio::spawn({
      let cache = cache.clone();
      let fetcher = fetcher.clone();
      async move { cache.fetch(key(), fetcher).await }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(cache.invalidate(key()));

    // The waiting reader follows the replacement fetch instead of failing.
    let result = reader.await.unwrap().unwrap();
    assert_eq!(*result.data, 2);
    assert_eq!(result.source, CacheSource::Network);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(running.load(Ordering::SeqCst), 0);
    assert_eq!(cache.get_query_data::<u32>(key()).unwrap().as_deref(), Some(&2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_replaced_fetch_stops_retrying() {
    let cache = CacheLayer::new(CacheOptions::default());
    let calls = Arc::new(AtomicU32::new(0));

    let counted = calls.clone();
    let fetcher = move || {
      counted.fetch_add(1, Ordering::SeqCst);
      ready(Err::<u32, _>(status_error(503)))
    };

    // First attempt fails at once; the task then sleeps before its first retry.
    drop(cache.subscribe(key(), fetcher));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(cache.invalidate(key()));
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.snapshot::<u32>(key()).status, QueryStatus::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_confirmed_write_clears_failed_state() {
    let cache = CacheLayer::new(CacheOptions::default());
    let calls = Arc::new(AtomicU32::new(0));

    let counted = calls.clone();
    let fetcher = move || {
      let n = counted.fetch_add(1, Ordering::SeqCst) + 1;
      ready(if n == 1 { Ok(n) } else { Err(status_error(404)) })
    };

    cache.fetch(key(), fetcher.clone()).await.unwrap();
    tokio::time::advance(Duration::from_secs(301)).await;
    cache.fetch(key(), fetcher).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    let failed = cache.snapshot::<u32>(key());
    assert_eq!(failed.status, QueryStatus::Failed);
    assert_eq!(failed.failure_count, 1);

    assert!(cache.apply_write::<u32, _>(key(), |n| n + 1).unwrap());

    let snapshot = cache.snapshot::<u32>(key());
    assert_ne!(snapshot.status, QueryStatus::Failed);
    assert_eq!(snapshot.status, QueryStatus::Stale);
    assert!(snapshot.error.is_none());
    assert_eq!(snapshot.failure_count, 0);
    assert_eq!(snapshot.data.as_deref(), Some(&2));
  }
}
