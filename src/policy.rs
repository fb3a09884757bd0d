//! Retry Policy - What a single-key operation does when its shard times out
//!
//! Every single-key operation exists in two forms with deliberately
//! different failure behavior:
//! - the named method (`set`, `add`, `get`, `delete`) takes an explicit
//!   `retry` flag defaulting to off, swallows the timeout, and returns
//!   the operation's "no effect" result;
//! - the bracket form (`insert`, `remove`, `read`) always retries on
//!   timeout and propagates `NotFound`. The lookup accessor `fetch` is
//!   the odd one out: it does not retry, but still surfaces a missing
//!   key as `NotFound`.
//!
//! Both forms run through the same code path parameterized by one
//! [`OpPolicy`] value, so the asymmetry stays auditable instead of being
//! duplicated logic. The two presets are the named constants below.
//!
//! Retries happen with no delay between attempts. That matches the
//! observed behavior of the system this one is compatible with, but it
//! is a livelock hazard under sustained contention, so the pause between
//! attempts is an injectable [`Backoff`] strategy rather than hardcoded.

use std::time::Duration;

// ============================================================================
// Operation Policy
// ============================================================================

/// Failure-handling policy for a single-key operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpPolicy {
    /// Retry indefinitely on a bounded-wait failure. When off, the
    /// operation returns its "no effect" result instead.
    pub retry: bool,
    /// Propagate `NotFound` to the caller. When off, a missing key is a
    /// normal outcome (`false` for delete, the default for get).
    pub propagate_not_found: bool,
}

impl OpPolicy {
    /// Preset for the named methods: give up on timeout, absorb NotFound.
    pub const METHOD: OpPolicy = OpPolicy {
        retry: false,
        propagate_not_found: false,
    };

    /// Preset for the bracket forms: retry forever, surface NotFound.
    pub const BRACKET: OpPolicy = OpPolicy {
        retry: true,
        propagate_not_found: true,
    };

    /// The METHOD preset with the caller-supplied retry flag applied.
    pub fn method(retry: bool) -> OpPolicy {
        OpPolicy {
            retry,
            ..OpPolicy::METHOD
        }
    }
}

// ============================================================================
// Backoff Strategy
// ============================================================================

/// Pause strategy between retry attempts against a busy shard.
///
/// `attempt` starts at 0 for the pause after the first failure. Returning
/// `None` means retry immediately.
pub trait Backoff: Send + Sync {
    fn delay(&self, attempt: u32) -> Option<Duration>;
}

/// Immediate retry, no delay. The default, for compatibility; can spin
/// under sustained contention.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackoff;

impl Backoff for NoBackoff {
    fn delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Constant pause between attempts.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff(pub Duration);

impl Backoff for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Option<Duration> {
        Some(self.0)
    }
}
