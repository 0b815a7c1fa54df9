//! Keyed cache of server state with stale-while-revalidate reads.
//!
//! This module provides a catalog-agnostic caching mechanism that:
//! - Holds one entry per query key, shared by every reader
//! - Serves fresh values without a request and stale ones while refetching
//! - Coalesces concurrent fetches of a key into one request
//! - Retries transient read failures with exponential backoff
//! - Patches values after confirmed writes and forces a revalidation

mod key;
mod layer;
mod retry;
mod storage;
mod traits;

pub use key::QueryKey;
pub use layer::{CacheLayer, CacheOptions, EntrySummary, QueryError};
pub use retry::RetryPolicy;
pub use storage::{QueryStatus, Validity};
pub use traits::{CacheResult, CacheSource, Cacheable};
