//! Observer handles for cached queries.
//!
//! Inspired by TanStack Query, a `Query<T>` is one subscriber's view of a
//! cache entry: it exposes loading/success/error state, tells its owner
//! when the entry changed, and keeps the entry alive while it exists.
//!
//! # Example
//!
//! ```ignore
//! let mut brands = catalog.collection::<Brand>().subscribe();
//!
//! // In event loop tick
//! if brands.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! let state = brands.state();
//! match state.status {
//!     QueryStatus::Fetching if state.data.is_none() => render_spinner(),
//!     QueryStatus::Failed => render_error(state.error),
//!     _ => render_data(state.data),
//! }
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::watch;

use crate::cache::{CacheLayer, QueryError, QueryKey, QueryStatus};

/// Point-in-time view of a cache entry.
#[derive(Debug, Clone)]
pub struct QuerySnapshot<T> {
  pub status: QueryStatus,
  /// Last known value; still present while stale, refetching or failed
  pub data: Option<Arc<T>>,
  pub error: Option<QueryError>,
  /// Failed attempts of the current or last fetch
  pub failure_count: u32,
}

impl<T> QuerySnapshot<T> {
  pub(crate) fn idle() -> Self {
    Self {
      status: QueryStatus::Idle,
      data: None,
      error: None,
      failure_count: 0,
    }
  }

  /// Waiting for the first value.
  #[cfg(test)]
  pub fn is_loading(&self) -> bool {
    self.data.is_none() && matches!(self.status, QueryStatus::Idle | QueryStatus::Fetching)
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Failed
  }
}

/// A subscription to one cache entry.
///
/// Dropping the handle detaches it; a fetch it started keeps running and
/// its result is still stored for other readers.
pub struct Query<T> {
  cache: CacheLayer,
  key: QueryKey,
  receiver: watch::Receiver<u64>,
  _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Query<T> {
  pub(crate) fn new(cache: CacheLayer, key: QueryKey, receiver: watch::Receiver<u64>) -> Self {
    Self {
      cache,
      key,
      receiver,
      _marker: PhantomData,
    }
  }

  /// Get the current state of the query.
  pub fn state(&self) -> QuerySnapshot<T> {
    self.cache.snapshot(self.key)
  }

  /// Get the data if any has been fetched.
  #[cfg(test)]
  pub fn data(&self) -> Option<Arc<T>> {
    self.state().data
  }

  /// Check if the query is waiting for its first value.
  #[cfg(test)]
  pub fn is_loading(&self) -> bool {
    self.state().is_loading()
  }

  /// Check if the last fetch failed.
  pub fn is_error(&self) -> bool {
    self.state().is_error()
  }

  /// Check for changes since the last poll without waiting.
  ///
  /// Returns `true` if the entry changed. Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    match self.receiver.has_changed() {
      Ok(true) => {
        self.receiver.borrow_and_update();
        true
      }
      _ => false,
    }
  }

  /// Wait until the entry changes. Returns `false` if it was dropped from the cache.
  #[cfg(test)]
  pub async fn changed(&mut self) -> bool {
    self.receiver.changed().await.is_ok()
  }

  /// Wait until the entry holds a value or its fetch has failed.
  #[cfg(test)]
  pub async fn settled(&mut self) -> Result<Arc<T>, QueryError> {
    loop {
      let state = self.state();
      match state.status {
        QueryStatus::Idle | QueryStatus::Fetching => {}
        QueryStatus::Failed => {
          if let Some(error) = state.error {
            return Err(error);
          }
        }
        QueryStatus::Fresh | QueryStatus::Stale => {
          if let Some(data) = state.data {
            return Ok(data);
          }
        }
      }

      if !self.changed().await {
        return Err(QueryError::Aborted(self.key, "cache entry dropped".to_string()));
      }
    }
  }
}

impl<T> Drop for Query<T> {
  fn drop(&mut self) {
    self.cache.unsubscribe(self.key);
  }
}

impl<T> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .finish_non_exhaustive()
  }
}
