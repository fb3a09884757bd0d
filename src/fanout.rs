//! FanoutCache - Sharded cache facade
//!
//! Routes every operation to the shard(s) that own it and layers policy
//! on top of the per-shard store:
//! - single-key operations route by stable hash and apply a retry policy
//!   on bounded-wait failures;
//! - bulk sweeps (`expire`, `evict`, `clear`) visit every shard in index
//!   order and keep an exact removal count across timeouts;
//! - read-oriented reducers (`check`, `stats`, `volume`, `len`) fan out
//!   and aggregate with no retry wrapping;
//! - the settings broadcast (`reset`) pushes one change to every shard,
//!   retrying each until it lands.
//!
//! The facade itself is stateless and lock-free: it owns the immutable
//! shard table and a backoff strategy, nothing else. All calls execute
//! synchronously on the caller's thread; the only blocking is inside a
//! shard, bounded by the shard's wait bound.

use std::io::Read;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::policy::{Backoff, NoBackoff, OpPolicy};
use crate::router::route;
use crate::shard::{DiskShard, GetOptions, Payload, ReadHandle, Shard};
use crate::{CacheError, Result, SettingValue, Value};

// ============================================================================
// Lookup Result
// ============================================================================

/// Result of a full `get_with` lookup.
///
/// On a hit, `value` is the stored payload and the metadata fields are
/// populated for whichever [`GetOptions`] flags were set. On a miss (or
/// a swallowed timeout), `value` is the caller's default and the
/// metadata fields are `None` regardless of the flags.
#[derive(Debug)]
pub struct Lookup {
    pub value: Payload,
    pub expire_time: Option<SystemTime>,
    pub tag: Option<String>,
}

// ============================================================================
// Fanout Cache
// ============================================================================

/// Process- and thread-shared cache that shards keys and values.
///
/// The shard table is fixed at construction: index order is the shard's
/// identity for the cache's lifetime, and the routing hash is stable
/// across restarts, so a reopened cache reads what an earlier process
/// wrote — provided the shard count is unchanged.
pub struct FanoutCache<S: Shard = DiskShard> {
    shards: Box<[S]>,
    backoff: Box<dyn Backoff>,
}

impl FanoutCache<DiskShard> {
    /// Open (or create) a cache under `directory` with default
    /// configuration: 8 shards, 25 ms per-shard wait bound.
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self> {
        Self::with_config(directory, CacheConfig::default())
    }

    /// Open (or create) a cache under `directory`. Shard directories are
    /// named `000`, `001`, … and each receives the same wait bound and
    /// settings bundle.
    pub fn with_config(directory: impl Into<PathBuf>, config: CacheConfig) -> Result<Self> {
        if config.shards == 0 {
            return Err(CacheError::Config("shard count must be at least 1".into()));
        }
        let directory = directory.into();
        let mut shards = Vec::with_capacity(config.shards);
        for num in 0..config.shards {
            shards.push(DiskShard::open(
                directory.join(format!("{num:03}")),
                config.timeout,
                config.settings.clone(),
            )?);
        }
        debug!(directory = %directory.display(), shards = config.shards, "opened cache");
        Ok(Self {
            shards: shards.into_boxed_slice(),
            backoff: Box::new(NoBackoff),
        })
    }
}

impl<S: Shard> FanoutCache<S> {
    /// Build a cache over caller-constructed shards. The vector's order
    /// becomes the shard index order.
    pub fn from_shards(shards: Vec<S>) -> Result<Self> {
        if shards.is_empty() {
            return Err(CacheError::Config("shard count must be at least 1".into()));
        }
        Ok(Self {
            shards: shards.into_boxed_slice(),
            backoff: Box::new(NoBackoff),
        })
    }

    /// Replace the pause strategy used between retry attempts. The
    /// default retries immediately with no delay.
    pub fn set_backoff(&mut self, backoff: Box<dyn Backoff>) {
        self.backoff = backoff;
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, key: &[u8]) -> &S {
        &self.shards[route(key, self.shards.len())]
    }

    fn pause(&self, attempt: u32) {
        if let Some(delay) = self.backoff.delay(attempt) {
            std::thread::sleep(delay);
        }
    }

    /// Run a single-shard call under `policy`: retry forever on timeout,
    /// or give up and return `no_effect`. Non-timeout errors pass through.
    fn with_policy<T>(
        &self,
        policy: OpPolicy,
        no_effect: T,
        mut call: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            match call() {
                Err(err) if err.is_timeout() => {
                    if !policy.retry {
                        return Ok(no_effect);
                    }
                    trace!(attempt, "shard busy, retrying");
                    self.pause(attempt);
                    attempt = attempt.wrapping_add(1);
                }
                other => return other,
            }
        }
    }

    // ========================================================================
    // Single-Key Operations
    // ========================================================================

    /// Set `key` to `value`, unconditionally.
    ///
    /// Returns `Ok(true)` on success; `Ok(false)` only when `retry` is
    /// off and the owning shard timed out.
    pub fn set(
        &self,
        key: impl AsRef<[u8]>,
        value: impl Into<Value>,
        expire: Option<Duration>,
        tag: Option<&str>,
        retry: bool,
    ) -> Result<bool> {
        self.set_impl(
            key.as_ref(),
            value.into(),
            expire,
            tag,
            OpPolicy::method(retry),
        )
    }

    /// Assignment form of [`FanoutCache::set`]: always retries on
    /// timeout, so it cannot report `false`.
    pub fn insert(&self, key: impl AsRef<[u8]>, value: impl Into<Value>) -> Result<()> {
        self.set_impl(key.as_ref(), value.into(), None, None, OpPolicy::BRACKET)
            .map(|_| ())
    }

    fn set_impl(
        &self,
        key: &[u8],
        value: Value,
        expire: Option<Duration>,
        tag: Option<&str>,
        policy: OpPolicy,
    ) -> Result<bool> {
        let expire_at = expire.map(|ttl| SystemTime::now() + ttl);
        let shard = self.shard_for(key);
        self.with_policy(policy, false, || {
            shard.set(key, value.clone(), expire_at, tag)
        })
    }

    /// Set `key` with the payload read from `reader`. The stream is
    /// consumed exactly once, before any commit attempt; retries repeat
    /// only the commit.
    pub fn set_stream(
        &self,
        key: impl AsRef<[u8]>,
        reader: &mut dyn Read,
        expire: Option<Duration>,
        tag: Option<&str>,
        retry: bool,
    ) -> Result<bool> {
        let key = key.as_ref();
        let expire_at = expire.map(|ttl| SystemTime::now() + ttl);
        let shard = self.shard_for(key);
        let spooled = shard.spool(reader)?;
        let mut attempt = 0u32;
        loop {
            match shard.set_spooled(key, &spooled, expire_at, tag) {
                Err(err) if err.is_timeout() && retry => {
                    trace!(attempt, "shard busy, retrying spooled set");
                    self.pause(attempt);
                    attempt = attempt.wrapping_add(1);
                }
                Err(err) if err.is_timeout() => {
                    shard.discard_spooled(spooled);
                    return Ok(false);
                }
                Err(err) => {
                    shard.discard_spooled(spooled);
                    return Err(err);
                }
                Ok(stored) => return Ok(stored),
            }
        }
    }

    /// Add `key` only if it is not already present.
    ///
    /// Atomic: among concurrent `add` calls for one key, from any thread
    /// or process sharing the shard, at most one succeeds. Routing puts
    /// every such call on the same shard by construction; exclusivity
    /// within the shard is the shard's responsibility.
    pub fn add(
        &self,
        key: impl AsRef<[u8]>,
        value: impl Into<Value>,
        expire: Option<Duration>,
        tag: Option<&str>,
        retry: bool,
    ) -> Result<bool> {
        let key = key.as_ref();
        let value = value.into();
        let expire_at = expire.map(|ttl| SystemTime::now() + ttl);
        let shard = self.shard_for(key);
        self.with_policy(OpPolicy::method(retry), false, || {
            shard.add(key, value.clone(), expire_at, tag)
        })
    }

    /// Get the value for `key`, or `default` if the key is missing (or,
    /// with `retry` off, if the shard timed out).
    pub fn get(
        &self,
        key: impl AsRef<[u8]>,
        default: impl Into<Value>,
        retry: bool,
    ) -> Result<Value> {
        self.get_with(key, default.into(), &GetOptions::default(), retry)
            .map(|lookup| lookup.value.into_value())
    }

    /// Full-form lookup: optionally return the expire time and tag, or a
    /// readable handle over the value's bytes (`opts.read`).
    pub fn get_with(
        &self,
        key: impl AsRef<[u8]>,
        default: Value,
        opts: &GetOptions,
        retry: bool,
    ) -> Result<Lookup> {
        let key = key.as_ref();
        let shard = self.shard_for(key);
        // Both a miss and a swallowed timeout yield the default.
        let fetched = self.with_policy(OpPolicy::method(retry), None, || shard.get(key, opts))?;
        Ok(match fetched {
            Some(found) => Lookup {
                value: found.payload,
                expire_time: found.expire_time,
                tag: found.tag,
            },
            None => Lookup {
                value: Payload::Value(default),
                expire_time: None,
                tag: None,
            },
        })
    }

    /// Lookup form of [`FanoutCache::get`]: a missing key (or a timeout,
    /// which without retry is indistinguishable from one) is
    /// `Err(NotFound)`.
    pub fn fetch(&self, key: impl AsRef<[u8]>) -> Result<Value> {
        let key = key.as_ref();
        let shard = self.shard_for(key);
        let fetched = self.with_policy(OpPolicy::method(false), None, || {
            shard.get(key, &GetOptions::default())
        })?;
        match fetched {
            Some(found) => Ok(found.payload.into_value()),
            None => Err(CacheError::NotFound),
        }
    }

    /// Readable handle over the value stored for `key`. Retries on
    /// timeout unconditionally; a missing key is `Err(NotFound)`.
    pub fn read(&self, key: impl AsRef<[u8]>) -> Result<ReadHandle> {
        let key = key.as_ref();
        let shard = self.shard_for(key);
        let opts = GetOptions {
            read: true,
            ..Default::default()
        };
        let fetched = self.with_policy(OpPolicy::BRACKET, None, || shard.get(key, &opts))?;
        match fetched {
            Some(found) => match found.payload {
                Payload::Stream(handle) => Ok(handle),
                Payload::Value(_) => unreachable!("read option requested"),
            },
            None => Err(CacheError::NotFound),
        }
    }

    /// Whether `key` is present.
    ///
    /// Deliberately unwrapped: unlike every other single-key operation
    /// this is a direct shard query with no retry policy, and a shard
    /// timeout propagates to the caller unmodified.
    pub fn contains(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        let key = key.as_ref();
        self.shard_for(key).contains(key)
    }

    /// Delete `key`. Missing keys are ignored: returns `Ok(false)`
    /// rather than failing, and `Ok(false)` likewise when `retry` is off
    /// and the shard timed out.
    pub fn delete(&self, key: impl AsRef<[u8]>, retry: bool) -> Result<bool> {
        self.delete_impl(key.as_ref(), OpPolicy::method(retry))
    }

    /// Deletion form of [`FanoutCache::delete`]: always retries on
    /// timeout and reports a missing key as `Err(NotFound)`.
    pub fn remove(&self, key: impl AsRef<[u8]>) -> Result<()> {
        self.delete_impl(key.as_ref(), OpPolicy::BRACKET).map(|_| ())
    }

    fn delete_impl(&self, key: &[u8], policy: OpPolicy) -> Result<bool> {
        let shard = self.shard_for(key);
        let result = self.with_policy(policy, false, || shard.delete(key).map(|()| true));
        match result {
            Err(CacheError::NotFound) if !policy.propagate_not_found => Ok(false),
            other => other,
        }
    }

    // ========================================================================
    // Bulk Sweeps
    // ========================================================================

    /// Drive one sweep operation across every shard in index order.
    ///
    /// Each shard is called repeatedly until it reports a clean zero. A
    /// bounded-wait failure contributes its partial-progress payload to
    /// the total and the same call is retried on the same shard, so the
    /// grand total is exact: every accounted increment is either a
    /// confirmed return value or a failure's explicit partial count.
    fn sweep_all(&self, mut op: impl FnMut(&S) -> Result<usize>) -> Result<usize> {
        let mut total = 0usize;
        for (index, shard) in self.shards.iter().enumerate() {
            let mut attempt = 0u32;
            loop {
                match op(shard) {
                    Ok(0) => break,
                    Ok(count) => {
                        total += count;
                        attempt = 0;
                    }
                    Err(CacheError::Timeout { removed }) => {
                        total += removed;
                        trace!(shard = index, removed, "sweep timed out, retrying shard");
                        self.pause(attempt);
                        attempt = attempt.wrapping_add(1);
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(total)
    }

    /// Remove expired items from every shard, returning the count
    /// removed. One timestamp is captured before the first shard and
    /// reused for all of them, so a slow sweep never expires items more
    /// aggressively on later shards.
    pub fn expire(&self) -> Result<usize> {
        let now = SystemTime::now();
        let removed = self.sweep_all(|shard| shard.expire(now))?;
        debug!(removed, "expire sweep finished");
        Ok(removed)
    }

    /// Remove items tagged `tag` from every shard.
    pub fn evict(&self, tag: &str) -> Result<usize> {
        let removed = self.sweep_all(|shard| shard.evict(tag))?;
        debug!(tag, removed, "evict sweep finished");
        Ok(removed)
    }

    /// Remove all items.
    pub fn clear(&self) -> Result<usize> {
        let removed = self.sweep_all(|shard| shard.clear())?;
        debug!(removed, "clear finished");
        Ok(removed)
    }

    // ========================================================================
    // Cross-Shard Reducers
    // ========================================================================

    /// Check cache consistency, shard by shard in index order; warnings
    /// are concatenated in that order. Each shard's check holds that
    /// shard's write lock for its duration — other shards stay writable.
    /// `fix` requests shard-local repair. A shard timeout propagates.
    pub fn check(&self, fix: bool) -> Result<Vec<String>> {
        let mut warnings = Vec::new();
        for shard in self.shards.iter() {
            warnings.extend(shard.check(fix)?);
        }
        Ok(warnings)
    }

    /// Cache-wide (hits, misses). `enable` and `reset` are broadcast to
    /// every shard.
    pub fn stats(&self, enable: bool, reset: bool) -> (u64, u64) {
        self.shards
            .iter()
            .map(|shard| shard.stats(enable, reset))
            .fold((0, 0), |(hits, misses), (h, m)| (hits + h, misses + m))
    }

    /// Estimated total on-disk size in bytes.
    pub fn volume(&self) -> u64 {
        self.shards.iter().map(Shard::volume).sum()
    }

    /// Total number of stored items. A shard timeout propagates.
    pub fn len(&self) -> Result<usize> {
        let mut total = 0;
        for shard in self.shards.iter() {
            total += shard.len()?;
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // ========================================================================
    // Settings Broadcast
    // ========================================================================

    /// Read or update one setting on every shard, in index order,
    /// retrying each shard until its update lands.
    ///
    /// Returns the LAST shard's result; earlier shards' results are
    /// discarded. Callers should treat settings as cache-wide: every
    /// shard converges to the same value, but the broadcaster does not
    /// verify it.
    pub fn reset(&self, key: &str, value: Option<SettingValue>) -> Result<SettingValue> {
        let mut last = None;
        for shard in self.shards.iter() {
            let mut attempt = 0u32;
            let result = loop {
                match shard.reset(key, value) {
                    Err(err) if err.is_timeout() => {
                        self.pause(attempt);
                        attempt = attempt.wrapping_add(1);
                    }
                    other => break other?,
                }
            };
            last = Some(result);
        }
        // Construction guarantees at least one shard.
        last.ok_or_else(|| CacheError::Config("cache has no shards".into()))
    }

    /// Create the tag index on every shard. Speeds up `evict`; better
    /// set at construction via `Settings::tag_index`. A timeout
    /// propagates.
    pub fn create_tag_index(&self) -> Result<()> {
        for shard in self.shards.iter() {
            shard.create_tag_index()?;
        }
        Ok(())
    }

    /// Drop the tag index on every shard. A timeout propagates.
    pub fn drop_tag_index(&self) -> Result<()> {
        for shard in self.shards.iter() {
            shard.drop_tag_index()?;
        }
        Ok(())
    }

    /// Close every shard. Idempotent; also runs on drop.
    pub fn close(&self) {
        for shard in self.shards.iter() {
            shard.close();
        }
    }
}

impl<S: Shard> Drop for FanoutCache<S> {
    fn drop(&mut self) {
        self.close();
    }
}
