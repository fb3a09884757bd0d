//! Shard Contract - The per-shard store the coordination layer runs on
//!
//! A shard is one independently lockable, independently persistent
//! storage unit holding a disjoint partition of the keyspace. The
//! [`Shard`] trait is the exact surface the fanout layer consumes;
//! [`DiskShard`] is the default on-disk implementation.
//!
//! Failure contract: any call that needs the shard's lock may report
//! `CacheError::Timeout` after the shard's wait bound. Sweep calls carry
//! the count of items already removed in that call inside the timeout,
//! so callers never lose progress accounting. `stats` and `volume` are
//! lock-free and never fail.

use std::fs::File;
use std::io::{self, Cursor, Read};
use std::time::SystemTime;

pub mod entry;
mod store;

pub use entry::{Entry, Value, ValueSlot};
pub use store::DiskShard;

use crate::{Result, SettingValue};

// ============================================================================
// Get Options
// ============================================================================

/// Flags for `get`: what to return alongside the value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Return a readable handle over the value's bytes instead of a
    /// materialized value.
    pub read: bool,
    /// Include the entry's expire time.
    pub expire_time: bool,
    /// Include the entry's tag.
    pub tag: bool,
}

// ============================================================================
// Fetched Items
// ============================================================================

/// A value payload as returned by `get`.
pub enum Payload {
    Value(Value),
    /// Requested with `GetOptions::read`; streams the value's bytes.
    Stream(ReadHandle),
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Payload::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl Payload {
    /// The materialized value; panics on a stream payload. Intended for
    /// callers that did not request `read`.
    pub fn into_value(self) -> Value {
        match self {
            Payload::Value(v) => v,
            Payload::Stream(_) => unreachable!("stream payload without read option"),
        }
    }
}

/// A present entry returned by `get`. Metadata fields are populated only
/// when the corresponding [`GetOptions`] flag was set.
#[derive(Debug)]
pub struct Fetched {
    pub payload: Payload,
    pub expire_time: Option<SystemTime>,
    pub tag: Option<String>,
}

/// Readable handle over a stored value's bytes.
///
/// Small values are served from memory; values stored in external files
/// stream from the file.
pub enum ReadHandle {
    Inline(Cursor<Vec<u8>>),
    File(File),
}

impl Read for ReadHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ReadHandle::Inline(c) => c.read(buf),
            ReadHandle::File(f) => f.read(buf),
        }
    }
}

// ============================================================================
// Shard Trait
// ============================================================================

/// The per-shard storage contract.
///
/// All methods execute synchronously on the caller's thread; the only
/// suspension point is waiting for the shard's lock, bounded by the
/// shard's configured wait bound.
///
/// Stream-sourced writes are split into [`Shard::spool`] (consumes the
/// reader, needs no lock) and [`Shard::set_spooled`] (the lockable
/// commit): a bounded-wait retry repeats only the commit, never the
/// already-consumed stream.
pub trait Shard {
    /// Token for a payload spooled into the shard ahead of a commit.
    type Spooled;

    /// Unconditional upsert. Returns `Ok(true)` on success.
    fn set(
        &self,
        key: &[u8],
        value: Value,
        expire: Option<SystemTime>,
        tag: Option<&str>,
    ) -> Result<bool>;

    /// Consume `reader` into shard-local storage, returning a token for
    /// a later commit. The payload is always stored as an external value
    /// file.
    fn spool(&self, reader: &mut dyn Read) -> Result<Self::Spooled>;

    /// Upsert a previously spooled payload. May be retried with the same
    /// token after a bounded-wait failure.
    fn set_spooled(
        &self,
        key: &[u8],
        spooled: &Self::Spooled,
        expire: Option<SystemTime>,
        tag: Option<&str>,
    ) -> Result<bool>;

    /// Release a spooled payload that will not be committed.
    fn discard_spooled(&self, spooled: Self::Spooled);

    /// Insert only if the key is absent (or expired). Returns `Ok(false)`
    /// if the key is already present. Atomic with respect to every other
    /// writer of this shard.
    fn add(
        &self,
        key: &[u8],
        value: Value,
        expire: Option<SystemTime>,
        tag: Option<&str>,
    ) -> Result<bool>;

    /// Look up a key. `Ok(None)` means the key is not present (including
    /// logically expired entries); it is the only "absent" signal and
    /// cannot collide with a stored `Value::None`.
    fn get(&self, key: &[u8], opts: &GetOptions) -> Result<Option<Fetched>>;

    /// Delete a key. `Err(NotFound)` if absent.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Whether the key is present and unexpired.
    fn contains(&self, key: &[u8]) -> Result<bool>;

    /// Remove entries whose expiry is at or before `now`. One call
    /// removes a bounded batch and returns the count removed; a timeout
    /// mid-batch carries the partial count.
    fn expire(&self, now: SystemTime) -> Result<usize>;

    /// Remove entries with the given tag. Bounded batch, like `expire`.
    fn evict(&self, tag: &str) -> Result<usize>;

    /// Remove entries unconditionally. Bounded batch, like `expire`.
    fn clear(&self) -> Result<usize>;

    /// Consistency check; holds the shard's write lock for the duration.
    /// Returns warning descriptions. `fix` requests shard-local repair.
    fn check(&self, fix: bool) -> Result<Vec<String>>;

    /// Hit/miss counters. `enable` turns collection on or off; `reset`
    /// zeroes the counters after reading them.
    fn stats(&self, enable: bool, reset: bool) -> (u64, u64);

    /// Estimated on-disk size in bytes.
    fn volume(&self) -> u64;

    /// Number of stored entries, including not-yet-swept expired ones.
    fn len(&self) -> Result<usize>;

    /// Read or update one setting. `Some(value)` updates and persists;
    /// `None` returns the current value.
    fn reset(&self, key: &str, value: Option<SettingValue>) -> Result<SettingValue>;

    /// Build the tag → keys index and enable it for `evict`.
    fn create_tag_index(&self) -> Result<()>;

    /// Drop the tag index; `evict` falls back to scanning.
    fn drop_tag_index(&self) -> Result<()>;

    /// Flush and compact. Idempotent.
    fn close(&self);
}
