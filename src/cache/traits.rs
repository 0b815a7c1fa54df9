//! Core traits and types for the caching system.

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Trait for entities that can be cached.
///
/// The cache key is the server-assigned identity used to match records
/// when a write patches a cached list.
pub trait Cacheable: Clone + Send + Sync + 'static {
  /// Unique identifier for this entity (server-assigned id)
  fn cache_key(&self) -> &str;

  /// Entity type name used in logs and messages (e.g., "brand", "headphone")
  fn entity_type() -> &'static str;
}

/// Result from a cache read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: Arc<T>,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was last written to the cache
  pub updated_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from data that was just fetched.
  pub fn from_network(data: Arc<T>, updated_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      updated_at,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: Arc<T>, updated_at: Option<DateTime<Utc>>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      updated_at,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched from the network during this read
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, stale or invalidated; a background refetch is running
  CacheStale,
}
