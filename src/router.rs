//! Shard Router - Maps a key to the shard that owns it
//!
//! Routing is `hash(key) mod N`: a pure, total function of the key's
//! bytes and the shard count. Every single-key operation goes through
//! it, so two properties are load-bearing:
//!
//! - Deterministic within a process: concurrent `add` calls for the same
//!   key land on the same shard, which is what makes `add` exclusive.
//! - Stable across processes and restarts: a randomized per-process hash
//!   (the std `DefaultHasher`, or `ahash` with its random seeds) would
//!   silently orphan data written by an earlier process. The router
//!   therefore uses SipHash-1-3 with fixed keys.

use std::hash::Hasher;

use siphasher::sip::SipHasher13;

/// Version of the routing hash. Bump only with a migration story:
/// any change to the hash function or its keys re-routes existing keys.
pub const ROUTING_HASH_VERSION: u32 = 1;

// Fixed SipHash keys. Arbitrary but frozen; part of the on-disk contract.
const SIP_KEY_0: u64 = 0x7c8f_2d4b_91e6_a053;
const SIP_KEY_1: u64 = 0x35a1_f0c9_6bd2_e847;

/// Stable 64-bit hash of a key's bytes.
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(SIP_KEY_0, SIP_KEY_1);
    hasher.write(key);
    hasher.finish()
}

/// Route a key to a shard index in `[0, shards)`.
///
/// Total and side-effect free. `shards` must be at least 1; the cache
/// enforces that invariant at construction.
pub fn route(key: &[u8], shards: usize) -> usize {
    debug_assert!(shards >= 1);
    (hash_key(key) % shards as u64) as usize
}
