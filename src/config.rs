//! Cache Configuration - Construction parameters and per-shard settings
//!
//! [`CacheConfig`] is consumed once at cache construction: shard count
//! and per-shard wait bound, plus a [`Settings`] bundle forwarded
//! unchanged to every shard. [`Settings`] is also the target of the
//! runtime settings broadcast (`FanoutCache::reset`), addressed by
//! string key so callers can update one knob cache-wide.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CacheError, Result};

// ============================================================================
// Cache Config
// ============================================================================

/// Construction-time configuration for a [`crate::FanoutCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of shards to distribute keys across. Fixed for the life of
    /// the on-disk cache; changing it orphans previously written data.
    pub shards: usize,
    /// Per-shard wait bound. A shard call that cannot acquire the shard
    /// within this bound reports a timeout.
    pub timeout: Duration,
    /// Initial settings, forwarded unchanged to every shard.
    pub settings: Settings,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shards: 8,
            timeout: Duration::from_millis(25),
            settings: Settings::default(),
        }
    }
}

// ============================================================================
// Setting Value
// ============================================================================

/// Value of a single shard setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettingValue {
    Bool(bool),
    Int(u64),
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(v) => write!(f, "{v}"),
            SettingValue::Int(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        SettingValue::Bool(v)
    }
}

impl From<u64> for SettingValue {
    fn from(v: u64) -> Self {
        SettingValue::Int(v)
    }
}

impl SettingValue {
    fn as_bool(&self, key: &str) -> Result<bool> {
        match self {
            SettingValue::Bool(v) => Ok(*v),
            SettingValue::Int(_) => Err(CacheError::Config(format!(
                "setting '{key}' expects a boolean"
            ))),
        }
    }

    fn as_int(&self, key: &str) -> Result<u64> {
        match self {
            SettingValue::Int(v) => Ok(*v),
            SettingValue::Bool(_) => Err(CacheError::Config(format!(
                "setting '{key}' expects an integer"
            ))),
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Setting key: collect hit/miss statistics.
pub const STATISTICS: &str = "statistics";
/// Setting key: maintain a tag → keys index for `evict`.
pub const TAG_INDEX: &str = "tag_index";
/// Setting key: byte threshold above which values are stored in their
/// own file instead of inline in the log.
pub const MIN_FILE_SIZE: &str = "min_file_size";
/// Setting key: advisory on-disk size limit, surfaced by `check`.
pub const SIZE_LIMIT: &str = "size_limit";

/// Per-shard settings bundle.
///
/// Every shard starts from the same bundle; `reset` keeps them converged
/// afterwards. Persisted in each shard's log so a reopened shard keeps
/// its configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub statistics: bool,
    pub tag_index: bool,
    pub min_file_size: u64,
    pub size_limit: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            statistics: false,
            tag_index: false,
            min_file_size: 32 * 1024,
            size_limit: 1 << 30,
        }
    }
}

impl Settings {
    /// Read a setting by key.
    pub fn get(&self, key: &str) -> Result<SettingValue> {
        match key {
            STATISTICS => Ok(SettingValue::Bool(self.statistics)),
            TAG_INDEX => Ok(SettingValue::Bool(self.tag_index)),
            MIN_FILE_SIZE => Ok(SettingValue::Int(self.min_file_size)),
            SIZE_LIMIT => Ok(SettingValue::Int(self.size_limit)),
            _ => Err(CacheError::UnknownSetting(key.to_string())),
        }
    }

    /// Update a setting by key, returning the new value.
    pub fn set(&mut self, key: &str, value: SettingValue) -> Result<SettingValue> {
        match key {
            STATISTICS => self.statistics = value.as_bool(key)?,
            TAG_INDEX => self.tag_index = value.as_bool(key)?,
            MIN_FILE_SIZE => self.min_file_size = value.as_int(key)?,
            SIZE_LIMIT => self.size_limit = value.as_int(key)?,
            _ => return Err(CacheError::UnknownSetting(key.to_string())),
        }
        Ok(value)
    }
}
