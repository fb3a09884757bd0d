//! fanoutcache — a persistent, process- and thread-shared key/value cache.
//!
//! The cache partitions its keyspace across N independently lockable
//! storage shards. Every operation is routed to the owning shard(s); on
//! top of the per-shard store this crate layers retry policy, partial
//! failure accounting, and cross-shard aggregation.
//!
//! - [`FanoutCache`] is the facade callers use.
//! - [`shard::Shard`] is the per-shard contract; [`shard::DiskShard`] is
//!   the default on-disk implementation.
//! - Routing is a fixed-key hash, stable across process restarts — the
//!   same key always lands on the same shard for a given shard count.
//!
//! Changing the shard count after data has been written is unsupported:
//! keys may route to a different shard, orphaning previously stored data.

pub mod config;
pub mod fanout;
pub mod policy;
pub mod router;
pub mod shard;

// Re-export main types
pub use config::{CacheConfig, SettingValue, Settings};
pub use fanout::{FanoutCache, Lookup};
pub use policy::{Backoff, FixedBackoff, NoBackoff, OpPolicy};
pub use shard::{DiskShard, GetOptions, Payload, ReadHandle, Shard};
pub use shard::entry::Value;

/// Cache error type
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A shard could not acquire what it needed within its wait bound.
    /// Always recoverable by retrying. For bulk sweep calls, `removed`
    /// carries the count of items removed before the wait bound expired;
    /// for single-key calls it is 0.
    #[error("shard wait bound exceeded ({removed} items removed before timeout)")]
    Timeout { removed: usize },

    #[error("key not found")]
    NotFound,

    #[error("unknown setting: {0}")]
    UnknownSetting(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("corrupt shard data: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Bounded-wait failure with no partial progress.
    pub(crate) fn timeout() -> Self {
        CacheError::Timeout { removed: 0 }
    }

    /// Whether this error is a bounded-wait (timeout) failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CacheError::Timeout { .. })
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
