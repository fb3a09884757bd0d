//! DiskShard - Persistent per-shard store
//!
//! One shard owns one directory:
//!
//! ```text
//! <shard dir>/
//!   shard.log    append-only record log (see entry.rs for framing)
//!   shard.lock   fs2 flock sidecar for cross-process writers
//!   values/      external value files for large / streamed payloads
//! ```
//!
//! Two-layer locking for concurrent access safety:
//! Layer 1: parking_lot::Mutex over the in-memory state — same-process
//!          threads, acquired with the shard's wait bound.
//! Layer 2: fs2 flock on the cached sidecar handle — cross-process
//!          writers, polled against the same deadline.
//!
//! Expiry of the wait bound on either layer is the bounded-wait failure
//! (`CacheError::Timeout`). Sweep calls reacquire the lock between
//! chunks so writers can interleave; a timeout between chunks carries
//! the count already removed by that call.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

use ahash::{AHashMap, AHashSet};
use fs2::FileExt;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::entry::{
    from_unix_millis, read_log_header, unix_millis, write_log_header, Entry, LogOp, LogRecord,
    ValueSlot, LOG_HEADER_SIZE,
};
use super::{Fetched, GetOptions, Payload, ReadHandle, Shard, Value};
use crate::config::{Settings, MIN_FILE_SIZE, STATISTICS, TAG_INDEX};
use crate::{CacheError, Result, SettingValue};

/// Log file name inside a shard directory
const LOG_FILE: &str = "shard.log";
/// Flock sidecar file name
const LOCK_FILE: &str = "shard.lock";
/// Directory for external value files
const VALUES_DIR: &str = "values";

/// Maximum items one sweep call removes before returning its count.
const SWEEP_BATCH: usize = 100;
/// Items removed per lock hold inside a sweep call.
const SWEEP_CHUNK: usize = 25;
/// Compact when the log holds more than this many records and more than
/// four records per live entry.
const COMPACT_MIN_RECORDS: u64 = 1024;

type TagIndex = AHashMap<String, AHashSet<Vec<u8>>>;

fn corrupt(err: bincode::Error) -> CacheError {
    CacheError::Corrupt(err.to_string())
}

// ============================================================================
// Shard State
// ============================================================================

struct ShardState {
    entries: AHashMap<Vec<u8>, Entry>,
    tag_index: Option<TagIndex>,
    settings: Settings,
    log: BufWriter<File>,
    log_path: PathBuf,
    values_dir: PathBuf,
    /// Records currently in the log, counting the header's META record.
    log_records: u64,
}

impl ShardState {
    fn append(&mut self, record: &LogRecord) -> Result<()> {
        record.write_to(&mut self.log)?;
        self.log.flush()?;
        self.log_records += 1;
        Ok(())
    }

    fn value_file(&self, name: &str) -> PathBuf {
        self.values_dir.join(name)
    }

    fn index_add(&mut self, key: &[u8], entry: &Entry) {
        if let (Some(index), Some(tag)) = (self.tag_index.as_mut(), entry.tag.as_ref()) {
            index.entry(tag.clone()).or_default().insert(key.to_vec());
        }
    }

    fn index_remove(&mut self, key: &[u8], entry: &Entry) {
        if let (Some(index), Some(tag)) = (self.tag_index.as_mut(), entry.tag.as_ref()) {
            if let Some(keys) = index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    index.remove(tag);
                }
            }
        }
    }

    /// Delete an entry's external value file, if it has one. Best effort:
    /// a leftover file is reported by `check`, not an operation failure.
    fn discard_value_file(&self, entry: &Entry) {
        if let ValueSlot::File { name, .. } = &entry.slot {
            let _ = fs::remove_file(self.value_file(name));
        }
    }

    /// Upsert `entry` under `key` and log it.
    fn commit_set(&mut self, key: &[u8], entry: Entry) -> Result<()> {
        let payload = bincode::serialize(&entry).map_err(corrupt)?;
        self.append(&LogRecord::new(LogOp::Set, key, payload))?;
        if let Some(old) = self.entries.remove(key) {
            self.index_remove(key, &old);
            self.discard_value_file(&old);
        }
        self.index_add(key, &entry);
        self.entries.insert(key.to_vec(), entry);
        Ok(())
    }

    /// Remove the entry under `key` and log the deletion.
    fn commit_delete(&mut self, key: &[u8]) -> Result<Option<Entry>> {
        let Some(entry) = self.entries.remove(key) else {
            return Ok(None);
        };
        self.append(&LogRecord::new(LogOp::Delete, key, Vec::new()))?;
        self.index_remove(key, &entry);
        self.discard_value_file(&entry);
        Ok(Some(entry))
    }

    /// Persist the settings bundle.
    fn commit_meta(&mut self) -> Result<()> {
        let payload = bincode::serialize(&self.settings).map_err(corrupt)?;
        self.append(&LogRecord::new(LogOp::Meta, &[], payload))
    }

    fn build_tag_index(&self) -> TagIndex {
        let mut index = TagIndex::new();
        for (key, entry) in &self.entries {
            if let Some(tag) = &entry.tag {
                index.entry(tag.clone()).or_default().insert(key.clone());
            }
        }
        index
    }

    /// Rewrite the log from live state, dropping superseded records.
    fn compact(&mut self) -> Result<()> {
        let tmp_path = self.log_path.with_extension("log.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            write_log_header(&mut tmp)?;
            let meta = bincode::serialize(&self.settings).map_err(corrupt)?;
            LogRecord::new(LogOp::Meta, &[], meta).write_to(&mut tmp)?;
            for (key, entry) in &self.entries {
                let payload = bincode::serialize(entry).map_err(corrupt)?;
                LogRecord::new(LogOp::Set, key, payload).write_to(&mut tmp)?;
            }
            tmp.flush()?;
        }
        fs::rename(&tmp_path, &self.log_path)?;
        self.log = BufWriter::new(OpenOptions::new().append(true).open(&self.log_path)?);
        self.log_records = self.entries.len() as u64 + 1;
        debug!(records = self.log_records, "compacted shard log");
        Ok(())
    }

    fn maybe_compact(&mut self) {
        if self.log_records > COMPACT_MIN_RECORDS
            && self.log_records > 4 * (self.entries.len() as u64 + 1)
        {
            if let Err(err) = self.compact() {
                warn!(error = %err, "shard log compaction failed");
            }
        }
    }
}

// ============================================================================
// Lock Guard
// ============================================================================

/// Holds both lock layers; the flock is released on drop.
struct StateGuard<'a> {
    state: MutexGuard<'a, ShardState>,
    flock: Option<&'a File>,
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.flock {
            let _ = FileExt::unlock(file);
        }
    }
}

impl std::ops::Deref for StateGuard<'_> {
    type Target = ShardState;
    fn deref(&self) -> &ShardState {
        &self.state
    }
}

impl std::ops::DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut ShardState {
        &mut self.state
    }
}

// ============================================================================
// Sweep Filter
// ============================================================================

enum SweepFilter<'a> {
    /// Entries expired at the captured timestamp (milliseconds).
    Expired(u64),
    Tag(&'a str),
    All,
}

impl SweepFilter<'_> {
    fn matches(&self, entry: &Entry) -> bool {
        match self {
            SweepFilter::Expired(now_ms) => entry.is_expired(*now_ms),
            SweepFilter::Tag(tag) => entry.tag.as_deref() == Some(*tag),
            SweepFilter::All => true,
        }
    }
}

// ============================================================================
// Disk Shard
// ============================================================================

/// Persistent per-shard store. See the module docs for the on-disk
/// layout and locking model.
pub struct DiskShard {
    dir: PathBuf,
    timeout: std::time::Duration,
    state: Mutex<ShardState>,
    /// Cached sidecar handle for the cross-process flock. `None` when
    /// the sidecar could not be created; locking is then in-process only.
    lock_file: Option<File>,
    /// Next external value file sequence number. A hint only: another
    /// instance sharing this directory may claim a name first, so file
    /// creation skips taken names.
    value_seq: AtomicU64,
    /// Snapshot of `settings.min_file_size`, readable without the lock.
    min_file_size: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    stats_enabled: AtomicBool,
    closed: AtomicBool,
}

impl DiskShard {
    /// Open (or create) the shard under `dir`.
    ///
    /// The log is replayed into memory; a torn or corrupt tail is
    /// truncated at the last intact record. `settings` is the
    /// construction-time bundle and is authoritative over whatever the
    /// log recorded.
    pub fn open(
        dir: impl Into<PathBuf>,
        timeout: std::time::Duration,
        settings: Settings,
    ) -> Result<Self> {
        let dir = dir.into();
        let values_dir = dir.join(VALUES_DIR);
        fs::create_dir_all(&values_dir)?;

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(dir.join(LOCK_FILE))
            .ok();

        let log_path = dir.join(LOG_FILE);
        let mut entries = AHashMap::new();
        let mut log_records = 0u64;
        if log_path.exists() {
            log_records = replay_log(&log_path, &mut entries)?;
        } else {
            let mut log = BufWriter::new(File::create(&log_path)?);
            write_log_header(&mut log)?;
            log.flush()?;
        }

        let value_seq = next_value_seq(&values_dir)?;
        let tag_index = settings.tag_index.then(|| {
            let mut index = TagIndex::new();
            for (key, entry) in &entries {
                if let Some(tag) = &entry.tag {
                    index.entry(tag.clone()).or_default().insert(key.clone());
                }
            }
            index
        });

        let stats_enabled = settings.statistics;
        let min_file_size = settings.min_file_size;
        let mut state = ShardState {
            entries,
            tag_index,
            settings,
            log: BufWriter::new(OpenOptions::new().append(true).open(&log_path)?),
            log_path,
            values_dir,
            log_records,
        };
        state.commit_meta()?;

        debug!(dir = %dir.display(), entries = state.entries.len(), "opened shard");
        Ok(Self {
            dir,
            timeout,
            state: Mutex::new(state),
            lock_file,
            value_seq: AtomicU64::new(value_seq),
            min_file_size: AtomicU64::new(min_file_size),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stats_enabled: AtomicBool::new(stats_enabled),
            closed: AtomicBool::new(false),
        })
    }

    /// Shard directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Acquire both lock layers within the shard's wait bound. On
    /// timeout, the error carries `removed` so sweep callers keep their
    /// partial count.
    fn acquire(&self, removed: usize) -> Result<StateGuard<'_>> {
        let deadline = Instant::now() + self.timeout;
        let Some(state) = self.state.try_lock_for(self.timeout) else {
            return Err(CacheError::Timeout { removed });
        };
        let mut flock = None;
        if let Some(file) = &self.lock_file {
            let contended = fs2::lock_contended_error();
            loop {
                match file.try_lock_exclusive() {
                    Ok(()) => {
                        flock = Some(file);
                        break;
                    }
                    Err(err) if err.raw_os_error() == contended.raw_os_error() => {
                        if Instant::now() >= deadline {
                            return Err(CacheError::Timeout { removed });
                        }
                        std::thread::yield_now();
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(StateGuard { state, flock })
    }

    /// Claim a fresh external value file name. `create_new` makes the
    /// claim atomic at the filesystem, so instances sharing this
    /// directory can never allocate the same name; a taken name bumps
    /// the sequence and tries the next one.
    fn create_value_file(&self) -> Result<(String, BufWriter<File>)> {
        loop {
            let name = format!("{:016x}.val", self.value_seq.fetch_add(1, Ordering::SeqCst));
            let path = self.dir.join(VALUES_DIR).join(&name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((name, BufWriter::new(file))),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Write `bytes` to a fresh external value file, returning its slot.
    fn spool_bytes(&self, bytes: &[u8], text: bool) -> Result<ValueSlot> {
        let (name, mut file) = self.create_value_file()?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(ValueSlot::File {
            name,
            len: bytes.len() as u64,
            text,
        })
    }

    /// Spool a reader into a fresh external value file. Runs before the
    /// lock is taken so a bounded-wait retry never re-reads the stream.
    fn spool_reader(&self, reader: &mut dyn Read) -> Result<ValueSlot> {
        let (name, mut file) = self.create_value_file()?;
        let len = io::copy(reader, &mut file)?;
        file.flush()?;
        Ok(ValueSlot::File {
            name,
            len,
            text: false,
        })
    }

    /// Remove a spooled value file after a failed commit.
    fn unspool(&self, slot: &ValueSlot) {
        if let ValueSlot::File { name, .. } = slot {
            let _ = fs::remove_file(self.dir.join(VALUES_DIR).join(name));
        }
    }

    fn record_hit(&self) {
        if self.stats_enabled.load(Ordering::Relaxed) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_miss(&self) {
        if self.stats_enabled.load(Ordering::Relaxed) {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn make_entry(
        &self,
        value: Value,
        expire: Option<SystemTime>,
        tag: Option<&str>,
    ) -> Result<Entry> {
        let min_file_size = self.min_file_size.load(Ordering::Relaxed);
        let slot = match value.as_bytes() {
            Some(bytes) if bytes.len() as u64 >= min_file_size => {
                let text = matches!(value, Value::Text(_));
                self.spool_bytes(bytes, text)?
            }
            _ => ValueSlot::Inline(value),
        };
        Ok(Entry {
            slot,
            expire_at: expire.map(unix_millis),
            tag: tag.map(str::to_string),
        })
    }

    fn commit_upsert(
        &self,
        key: &[u8],
        entry: Entry,
        only_if_absent: bool,
        now_ms: u64,
    ) -> Result<bool> {
        let mut guard = match self.acquire(0) {
            Ok(guard) => guard,
            Err(err) => {
                self.unspool(&entry.slot);
                return Err(err);
            }
        };
        if only_if_absent {
            if let Some(existing) = guard.entries.get(key) {
                if !existing.is_expired(now_ms) {
                    drop(guard);
                    self.unspool(&entry.slot);
                    return Ok(false);
                }
            }
        }
        guard.commit_set(key, entry)?;
        guard.maybe_compact();
        Ok(true)
    }

    /// Remove up to a batch of entries matched by `filter`, reacquiring
    /// the lock between chunks. A timeout carries the partial count.
    fn sweep(&self, filter: SweepFilter<'_>) -> Result<usize> {
        let mut removed = 0;
        loop {
            let want = SWEEP_CHUNK.min(SWEEP_BATCH - removed);
            let mut guard = self.acquire(removed)?;

            let victims: Vec<Vec<u8>> = match (&filter, guard.tag_index.as_ref()) {
                (SweepFilter::Tag(tag), Some(index)) => index
                    .get(*tag)
                    .map(|keys| keys.iter().take(want).cloned().collect())
                    .unwrap_or_default(),
                _ => guard
                    .entries
                    .iter()
                    .filter(|(_, entry)| filter.matches(entry))
                    .take(want)
                    .map(|(key, _)| key.clone())
                    .collect(),
            };

            for key in &victims {
                guard.commit_delete(key)?;
            }
            removed += victims.len();
            let exhausted = victims.len() < want;
            if exhausted {
                guard.maybe_compact();
            }
            drop(guard);

            if exhausted || removed >= SWEEP_BATCH {
                return Ok(removed);
            }
        }
    }
}

impl Shard for DiskShard {
    type Spooled = ValueSlot;

    fn set(
        &self,
        key: &[u8],
        value: Value,
        expire: Option<SystemTime>,
        tag: Option<&str>,
    ) -> Result<bool> {
        let entry = self.make_entry(value, expire, tag)?;
        self.commit_upsert(key, entry, false, 0)
    }

    fn spool(&self, reader: &mut dyn Read) -> Result<ValueSlot> {
        self.spool_reader(reader)
    }

    fn set_spooled(
        &self,
        key: &[u8],
        spooled: &ValueSlot,
        expire: Option<SystemTime>,
        tag: Option<&str>,
    ) -> Result<bool> {
        let entry = Entry {
            slot: spooled.clone(),
            expire_at: expire.map(unix_millis),
            tag: tag.map(str::to_string),
        };
        // No unspool on timeout: the caller still owns the token and may
        // retry or discard it.
        let mut guard = self.acquire(0)?;
        guard.commit_set(key, entry)?;
        guard.maybe_compact();
        Ok(true)
    }

    fn discard_spooled(&self, spooled: ValueSlot) {
        self.unspool(&spooled);
    }

    fn add(
        &self,
        key: &[u8],
        value: Value,
        expire: Option<SystemTime>,
        tag: Option<&str>,
    ) -> Result<bool> {
        let entry = self.make_entry(value, expire, tag)?;
        let now_ms = unix_millis(SystemTime::now());
        self.commit_upsert(key, entry, true, now_ms)
    }

    fn get(&self, key: &[u8], opts: &GetOptions) -> Result<Option<Fetched>> {
        let guard = self.acquire(0)?;
        let now_ms = unix_millis(SystemTime::now());
        let Some(entry) = guard.entries.get(key) else {
            drop(guard);
            self.record_miss();
            return Ok(None);
        };
        if entry.is_expired(now_ms) {
            drop(guard);
            self.record_miss();
            return Ok(None);
        }

        let payload = match &entry.slot {
            ValueSlot::Inline(value) => {
                if opts.read {
                    // Byte payloads stream their raw bytes; anything else
                    // streams its serialized form.
                    let bytes = match value.as_bytes() {
                        Some(b) => b.to_vec(),
                        None => bincode::serialize(value).map_err(corrupt)?,
                    };
                    Payload::Stream(ReadHandle::Inline(io::Cursor::new(bytes)))
                } else {
                    Payload::Value(value.clone())
                }
            }
            ValueSlot::File { name, .. } => {
                let path = guard.value_file(name);
                if opts.read {
                    match File::open(&path) {
                        Ok(file) => Payload::Stream(ReadHandle::File(file)),
                        // Dangling reference: logically a miss; check()
                        // reports and repairs it.
                        Err(err) if err.kind() == io::ErrorKind::NotFound => {
                            drop(guard);
                            self.record_miss();
                            return Ok(None);
                        }
                        Err(err) => return Err(err.into()),
                    }
                } else {
                    let text = matches!(&entry.slot, ValueSlot::File { text: true, .. });
                    match fs::read(&path) {
                        Ok(bytes) if text => Payload::Value(Value::Text(
                            String::from_utf8_lossy(&bytes).into_owned(),
                        )),
                        Ok(bytes) => Payload::Value(Value::Bytes(bytes)),
                        Err(err) if err.kind() == io::ErrorKind::NotFound => {
                            drop(guard);
                            self.record_miss();
                            return Ok(None);
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        };

        let fetched = Fetched {
            payload,
            expire_time: if opts.expire_time {
                entry.expire_at.map(from_unix_millis)
            } else {
                None
            },
            tag: if opts.tag { entry.tag.clone() } else { None },
        };
        drop(guard);
        self.record_hit();
        Ok(Some(fetched))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut guard = self.acquire(0)?;
        match guard.commit_delete(key)? {
            Some(_) => {
                guard.maybe_compact();
                Ok(())
            }
            None => Err(CacheError::NotFound),
        }
    }

    fn contains(&self, key: &[u8]) -> Result<bool> {
        let guard = self.acquire(0)?;
        let now_ms = unix_millis(SystemTime::now());
        Ok(guard
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now_ms)))
    }

    fn expire(&self, now: SystemTime) -> Result<usize> {
        self.sweep(SweepFilter::Expired(unix_millis(now)))
    }

    fn evict(&self, tag: &str) -> Result<usize> {
        self.sweep(SweepFilter::Tag(tag))
    }

    fn clear(&self) -> Result<usize> {
        self.sweep(SweepFilter::All)
    }

    fn check(&self, fix: bool) -> Result<Vec<String>> {
        // Holds the shard write lock for the whole check; blocks other
        // writers to this shard only.
        let mut guard = self.acquire(0)?;
        let mut warnings = Vec::new();

        // Entries referencing missing value files.
        let mut dangling = Vec::new();
        for (key, entry) in &guard.entries {
            if let ValueSlot::File { name, .. } = &entry.slot {
                if !guard.value_file(name).exists() {
                    warnings.push(format!(
                        "entry '{}' references missing value file {name}",
                        String::from_utf8_lossy(key),
                    ));
                    dangling.push(key.clone());
                }
            }
        }
        if fix {
            for key in dangling {
                guard.commit_delete(&key)?;
            }
        }

        // Value files no external entry references.
        let referenced: AHashSet<&str> = guard
            .entries
            .values()
            .filter_map(|entry| match &entry.slot {
                ValueSlot::File { name, .. } => Some(name.as_str()),
                ValueSlot::Inline(_) => None,
            })
            .collect();
        let mut orphans = Vec::new();
        for dirent in fs::read_dir(&guard.values_dir)? {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            if !referenced.contains(name.as_str()) {
                warnings.push(format!("orphan value file {name}"));
                orphans.push(dirent.path());
            }
        }
        if fix {
            for path in orphans {
                fs::remove_file(path)?;
            }
        }

        // Tag index drift.
        if guard.tag_index.is_some() {
            let expected = guard.build_tag_index();
            if guard.tag_index.as_ref() != Some(&expected) {
                warnings.push("tag index out of sync with entries".to_string());
                if fix {
                    guard.tag_index = Some(expected);
                }
            }
        }

        // Advisory size limit.
        let size_limit = guard.settings.size_limit;
        drop(guard);
        let volume = self.volume();
        if volume > size_limit {
            warnings.push(format!(
                "shard volume {volume} exceeds size limit {size_limit}"
            ));
        }
        Ok(warnings)
    }

    fn stats(&self, enable: bool, reset: bool) -> (u64, u64) {
        let result = if reset {
            (
                self.hits.swap(0, Ordering::Relaxed),
                self.misses.swap(0, Ordering::Relaxed),
            )
        } else {
            (
                self.hits.load(Ordering::Relaxed),
                self.misses.load(Ordering::Relaxed),
            )
        };
        self.stats_enabled.store(enable, Ordering::Relaxed);
        result
    }

    fn volume(&self) -> u64 {
        let mut total = fs::metadata(self.dir.join(LOG_FILE))
            .map(|m| m.len())
            .unwrap_or(0);
        if let Ok(dirents) = fs::read_dir(self.dir.join(VALUES_DIR)) {
            for dirent in dirents.flatten() {
                total += dirent.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        total
    }

    fn len(&self) -> Result<usize> {
        Ok(self.acquire(0)?.entries.len())
    }

    fn reset(&self, key: &str, value: Option<SettingValue>) -> Result<SettingValue> {
        let mut guard = self.acquire(0)?;
        match value {
            None => guard.settings.get(key),
            Some(value) => {
                let updated = guard.settings.set(key, value)?;
                match key {
                    STATISTICS => {
                        self.stats_enabled
                            .store(guard.settings.statistics, Ordering::Relaxed);
                    }
                    MIN_FILE_SIZE => {
                        self.min_file_size
                            .store(guard.settings.min_file_size, Ordering::Relaxed);
                    }
                    TAG_INDEX => {
                        let index = if guard.settings.tag_index {
                            Some(guard.build_tag_index())
                        } else {
                            None
                        };
                        guard.tag_index = index;
                    }
                    _ => {}
                }
                guard.commit_meta()?;
                Ok(updated)
            }
        }
    }

    fn create_tag_index(&self) -> Result<()> {
        let mut guard = self.acquire(0)?;
        if guard.tag_index.is_none() {
            let index = guard.build_tag_index();
            guard.tag_index = Some(index);
            guard.settings.tag_index = true;
            guard.commit_meta()?;
        }
        Ok(())
    }

    fn drop_tag_index(&self) -> Result<()> {
        let mut guard = self.acquire(0)?;
        if guard.tag_index.is_some() {
            guard.tag_index = None;
            guard.settings.tag_index = false;
            guard.commit_meta()?;
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Blocking acquisition: close never reports a timeout.
        let mut state = self.state.lock();
        if let Err(err) = state.compact() {
            warn!(error = %err, "shard close compaction failed");
        }
        debug!(dir = %self.dir.display(), "closed shard");
    }
}

impl Drop for DiskShard {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Log Replay
// ============================================================================

/// Replay the log at `path` into `entries`, returning the record count.
/// A torn or corrupt tail is truncated at the last intact record.
fn replay_log(path: &Path, entries: &mut AHashMap<Vec<u8>, Entry>) -> Result<u64> {
    let mut reader = BufReader::new(File::open(path)?);
    read_log_header(&mut reader)?;
    let mut good_offset = LOG_HEADER_SIZE;
    let mut records = 0u64;
    loop {
        match LogRecord::read_from(&mut reader) {
            Ok(None) => break,
            Ok(Some(record)) => {
                let decoded = match record.op {
                    LogOp::Set => bincode::deserialize::<Entry>(&record.payload)
                        .map(|entry| {
                            entries.insert(record.key.clone(), entry);
                        })
                        .is_ok(),
                    LogOp::Delete => {
                        entries.remove(&record.key);
                        true
                    }
                    // Construction settings are authoritative; stored
                    // settings records are skipped on replay.
                    LogOp::Meta => true,
                };
                if !decoded {
                    break;
                }
                good_offset += record.frame_len();
                records += 1;
            }
            Err(err) if err.kind() == io::ErrorKind::InvalidData => break,
            Err(err) => return Err(err.into()),
        }
    }
    drop(reader);

    let actual_len = fs::metadata(path)?.len();
    if actual_len > good_offset {
        warn!(
            path = %path.display(),
            truncated = actual_len - good_offset,
            "truncating corrupt shard log tail"
        );
        OpenOptions::new().write(true).open(path)?.set_len(good_offset)?;
    }
    Ok(records)
}

/// Next unused value-file sequence number under `values_dir`.
fn next_value_seq(values_dir: &Path) -> Result<u64> {
    let mut max_seq = 0u64;
    for dirent in fs::read_dir(values_dir)? {
        let dirent = dirent?;
        let name = dirent.file_name().to_string_lossy().into_owned();
        if let Some(stem) = name.strip_suffix(".val") {
            if let Ok(seq) = u64::from_str_radix(stem, 16) {
                max_seq = max_seq.max(seq + 1);
            }
        }
    }
    Ok(max_seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_shard(dir: &TempDir) -> DiskShard {
        DiskShard::open(
            dir.path(),
            Duration::from_millis(25),
            Settings::default(),
        )
        .unwrap()
    }

    fn open_shard_with(dir: &TempDir, settings: Settings) -> DiskShard {
        DiskShard::open(dir.path(), Duration::from_millis(25), settings).unwrap()
    }

    fn get_value(shard: &DiskShard, key: &[u8]) -> Option<Value> {
        shard
            .get(key, &GetOptions::default())
            .unwrap()
            .map(|fetched| fetched.payload.into_value())
    }

    #[test]
    fn test_set_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        assert!(shard.set(b"k", Value::Int(7), None, None).unwrap());
        assert_eq!(get_value(&shard, b"k"), Some(Value::Int(7)));
        assert_eq!(get_value(&shard, b"missing"), None);
    }

    #[test]
    fn test_stored_none_is_not_absent() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        shard.set(b"null", Value::None, None, None).unwrap();
        // A stored None is present; only a missing key reads as None.
        assert_eq!(get_value(&shard, b"null"), Some(Value::None));
        assert!(shard.contains(b"null").unwrap());
    }

    #[test]
    fn test_get_metadata_only_when_requested() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let expire = SystemTime::now() + Duration::from_secs(60);
        shard
            .set(b"k", Value::Int(1), Some(expire), Some("blue"))
            .unwrap();

        let bare = shard.get(b"k", &GetOptions::default()).unwrap().unwrap();
        assert!(bare.expire_time.is_none());
        assert!(bare.tag.is_none());

        let full = shard
            .get(
                b"k",
                &GetOptions {
                    expire_time: true,
                    tag: true,
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert!(full.expire_time.is_some());
        assert_eq!(full.tag.as_deref(), Some("blue"));
    }

    #[test]
    fn test_add_only_if_absent() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        assert!(shard.add(b"x", Value::Int(1), None, None).unwrap());
        assert!(!shard.add(b"x", Value::Int(2), None, None).unwrap());
        assert_eq!(get_value(&shard, b"x"), Some(Value::Int(1)));
    }

    #[test]
    fn test_add_exclusive_under_concurrent_writers() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let results = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8i64)
                .map(|i| {
                    let shard = &shard;
                    scope.spawn(move || loop {
                        match shard.add(b"x", Value::Int(i), None, None) {
                            Ok(added) => return (i, added),
                            Err(CacheError::Timeout { .. }) => continue,
                            Err(err) => panic!("unexpected error: {err}"),
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        let winners: Vec<_> = results.iter().filter(|(_, added)| *added).collect();
        assert_eq!(winners.len(), 1);
        // The stored value is the winner's, not a later loser's.
        assert_eq!(get_value(&shard, b"x"), Some(Value::Int(winners[0].0)));
    }

    #[test]
    fn test_add_replaces_expired_entry() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let past = SystemTime::now() - Duration::from_secs(1);
        shard.set(b"x", Value::Int(1), Some(past), None).unwrap();
        assert_eq!(get_value(&shard, b"x"), None);
        assert!(shard.add(b"x", Value::Int(2), None, None).unwrap());
        assert_eq!(get_value(&shard, b"x"), Some(Value::Int(2)));
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        shard.set(b"k", Value::Int(1), None, None).unwrap();
        shard.delete(b"k").unwrap();
        assert_eq!(get_value(&shard, b"k"), None);
        assert!(matches!(shard.delete(b"k"), Err(CacheError::NotFound)));
    }

    #[test]
    fn test_contains_respects_expiry() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        shard.set(b"live", Value::Int(1), None, None).unwrap();
        let past = SystemTime::now() - Duration::from_secs(1);
        shard.set(b"dead", Value::Int(2), Some(past), None).unwrap();
        assert!(shard.contains(b"live").unwrap());
        assert!(!shard.contains(b"dead").unwrap());
        assert!(!shard.contains(b"missing").unwrap());
    }

    #[test]
    fn test_expire_sweep() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let now = SystemTime::now();
        shard
            .set(b"dead", Value::Int(1), Some(now - Duration::from_secs(1)), None)
            .unwrap();
        shard
            .set(b"live", Value::Int(2), Some(now + Duration::from_secs(60)), None)
            .unwrap();
        shard.set(b"forever", Value::Int(3), None, None).unwrap();

        assert_eq!(shard.expire(now).unwrap(), 1);
        assert_eq!(shard.len().unwrap(), 2);
        // A second sweep with the same timestamp finds nothing.
        assert_eq!(shard.expire(now).unwrap(), 0);
    }

    #[test]
    fn test_evict_by_tag() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        shard.set(b"a", Value::Int(1), None, Some("red")).unwrap();
        shard.set(b"b", Value::Int(2), None, Some("red")).unwrap();
        shard.set(b"c", Value::Int(3), None, Some("blue")).unwrap();
        shard.set(b"d", Value::Int(4), None, None).unwrap();

        assert_eq!(shard.evict("red").unwrap(), 2);
        assert_eq!(shard.len().unwrap(), 2);
        assert_eq!(shard.evict("red").unwrap(), 0);
    }

    #[test]
    fn test_evict_uses_tag_index() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            tag_index: true,
            ..Settings::default()
        };
        let shard = open_shard_with(&dir, settings);
        for i in 0..10u8 {
            let tag = if i % 2 == 0 { "even" } else { "odd" };
            shard.set(&[i], Value::Int(i as i64), None, Some(tag)).unwrap();
        }
        assert_eq!(shard.evict("even").unwrap(), 5);
        assert_eq!(shard.len().unwrap(), 5);
        assert!(shard.check(false).unwrap().is_empty());
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        for i in 0..7u8 {
            shard.set(&[i], Value::Int(i as i64), None, None).unwrap();
        }
        assert_eq!(shard.clear().unwrap(), 7);
        assert_eq!(shard.len().unwrap(), 0);
        assert_eq!(shard.clear().unwrap(), 0);
    }

    #[test]
    fn test_clear_batches_past_sweep_limit() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        for i in 0..(SWEEP_BATCH as u16 + 20) {
            shard
                .set(&i.to_le_bytes(), Value::Int(i as i64), None, None)
                .unwrap();
        }
        // One call removes at most a batch; the caller loops.
        let first = shard.clear().unwrap();
        assert_eq!(first, SWEEP_BATCH);
        let second = shard.clear().unwrap();
        assert_eq!(second, 20);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let shard = open_shard(&dir);
            shard.set(b"keep", Value::Text("v".into()), None, Some("t")).unwrap();
            shard.set(b"gone", Value::Int(2), None, None).unwrap();
            shard.delete(b"gone").unwrap();
            shard.close();
        }
        let shard = open_shard(&dir);
        assert_eq!(get_value(&shard, b"keep"), Some(Value::Text("v".into())));
        assert_eq!(get_value(&shard, b"gone"), None);
        assert_eq!(shard.len().unwrap(), 1);
    }

    #[test]
    fn test_corrupt_log_tail_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let shard = open_shard(&dir);
            shard.set(b"a", Value::Int(1), None, None).unwrap();
            shard.set(b"b", Value::Int(2), None, None).unwrap();
        }
        // Simulate a torn write at the end of the log.
        let log_path = dir.path().join(LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(&[0x01, 0xde, 0xad]).unwrap();
        drop(file);

        let shard = open_shard(&dir);
        assert_eq!(get_value(&shard, b"a"), Some(Value::Int(1)));
        assert_eq!(get_value(&shard, b"b"), Some(Value::Int(2)));
    }

    #[test]
    fn test_large_value_spills_to_file() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            min_file_size: 8,
            ..Settings::default()
        };
        let shard = open_shard_with(&dir, settings);
        let big = vec![0xabu8; 64];
        shard.set(b"big", Value::Bytes(big.clone()), None, None).unwrap();

        let spilled = fs::read_dir(dir.path().join(VALUES_DIR)).unwrap().count();
        assert_eq!(spilled, 1);
        assert_eq!(get_value(&shard, b"big"), Some(Value::Bytes(big)));

        // Deleting the entry removes its value file.
        shard.delete(b"big").unwrap();
        let remaining = fs::read_dir(dir.path().join(VALUES_DIR)).unwrap().count();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_shared_directory_value_files_never_collide() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            min_file_size: 8,
            ..Settings::default()
        };
        // Two instances over one directory both start their file
        // sequence from the same scan; name claiming must keep their
        // value files disjoint.
        let a = open_shard_with(&dir, settings.clone());
        let b = open_shard_with(&dir, settings);
        a.set(b"key-a", Value::Bytes(vec![0xAA; 64]), None, None).unwrap();
        b.set(b"key-b", Value::Bytes(vec![0xBB; 64]), None, None).unwrap();

        assert_eq!(get_value(&a, b"key-a"), Some(Value::Bytes(vec![0xAA; 64])));
        assert_eq!(get_value(&b, b"key-b"), Some(Value::Bytes(vec![0xBB; 64])));
        let files = fs::read_dir(dir.path().join(VALUES_DIR)).unwrap().count();
        assert_eq!(files, 2);
    }

    #[test]
    fn test_min_file_size_reset_applies_to_later_sets() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        shard.set(b"small", Value::Bytes(vec![1; 64]), None, None).unwrap();
        assert_eq!(fs::read_dir(dir.path().join(VALUES_DIR)).unwrap().count(), 0);

        shard
            .reset(MIN_FILE_SIZE, Some(SettingValue::Int(8)))
            .unwrap();
        shard.set(b"spilled", Value::Bytes(vec![2; 64]), None, None).unwrap();
        assert_eq!(fs::read_dir(dir.path().join(VALUES_DIR)).unwrap().count(), 1);
        assert_eq!(get_value(&shard, b"spilled"), Some(Value::Bytes(vec![2; 64])));
    }

    #[test]
    fn test_foreign_flock_holder_reads_as_timeout() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let outside = OpenOptions::new()
            .write(true)
            .open(dir.path().join(LOCK_FILE))
            .unwrap();
        outside.lock_exclusive().unwrap();

        // Contention on the sidecar flock is a bounded-wait failure,
        // not an IO error.
        let err = shard.set(b"k", Value::Int(1), None, None).unwrap_err();
        assert!(err.is_timeout());

        FileExt::unlock(&outside).unwrap();
        assert!(shard.set(b"k", Value::Int(1), None, None).unwrap());
        assert_eq!(get_value(&shard, b"k"), Some(Value::Int(1)));
    }

    #[test]
    fn test_set_stream_and_read_handle() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let mut source = Cursor::new(b"streamed payload".to_vec());
        let spooled = shard.spool(&mut source).unwrap();
        shard.set_spooled(b"s", &spooled, None, None).unwrap();

        let fetched = shard
            .get(
                b"s",
                &GetOptions {
                    read: true,
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        let mut bytes = Vec::new();
        match fetched.payload {
            Payload::Stream(mut handle) => {
                handle.read_to_end(&mut bytes).unwrap();
            }
            Payload::Value(_) => panic!("expected stream payload"),
        }
        assert_eq!(bytes, b"streamed payload");
    }

    #[test]
    fn test_discard_spooled_removes_file() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let mut source = Cursor::new(b"abandoned".to_vec());
        let spooled = shard.spool(&mut source).unwrap();
        assert_eq!(fs::read_dir(dir.path().join(VALUES_DIR)).unwrap().count(), 1);
        shard.discard_spooled(spooled);
        assert_eq!(fs::read_dir(dir.path().join(VALUES_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn test_check_reports_and_fixes_dangling_reference() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            min_file_size: 4,
            ..Settings::default()
        };
        let shard = open_shard_with(&dir, settings);
        shard
            .set(b"k", Value::Bytes(vec![1; 32]), None, None)
            .unwrap();

        // Remove the value file out from under the entry.
        for dirent in fs::read_dir(dir.path().join(VALUES_DIR)).unwrap() {
            fs::remove_file(dirent.unwrap().path()).unwrap();
        }

        let warnings = shard.check(false).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("missing value file"));

        let warnings = shard.check(true).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(shard.len().unwrap(), 0);
        assert!(shard.check(false).unwrap().is_empty());
    }

    #[test]
    fn test_check_reports_and_fixes_orphan_file() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        fs::write(dir.path().join(VALUES_DIR).join("feedbeef.val"), b"junk").unwrap();

        let warnings = shard.check(true).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("orphan value file"));
        assert!(shard.check(false).unwrap().is_empty());
    }

    #[test]
    fn test_stats_counters() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        // Disabled by default: nothing is counted.
        let _ = get_value(&shard, b"missing");
        assert_eq!(shard.stats(true, false), (0, 0));

        shard.set(b"k", Value::Int(1), None, None).unwrap();
        let _ = get_value(&shard, b"k");
        let _ = get_value(&shard, b"k");
        let _ = get_value(&shard, b"missing");
        assert_eq!(shard.stats(true, true), (2, 1));
        assert_eq!(shard.stats(true, false), (0, 0));
    }

    #[test]
    fn test_volume_grows() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let before = shard.volume();
        shard
            .set(b"k", Value::Bytes(vec![0; 1024]), None, None)
            .unwrap();
        assert!(shard.volume() > before);
    }

    #[test]
    fn test_settings_reset() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        assert_eq!(
            shard.reset("min_file_size", None).unwrap(),
            SettingValue::Int(32 * 1024)
        );
        assert_eq!(
            shard
                .reset("min_file_size", Some(SettingValue::Int(64)))
                .unwrap(),
            SettingValue::Int(64)
        );
        assert_eq!(
            shard.reset("min_file_size", None).unwrap(),
            SettingValue::Int(64)
        );
        assert!(matches!(
            shard.reset("bogus", None),
            Err(CacheError::UnknownSetting(_))
        ));
    }

    #[test]
    fn test_statistics_setting_toggles_counters() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        shard
            .reset(STATISTICS, Some(SettingValue::Bool(true)))
            .unwrap();
        shard.set(b"k", Value::Int(1), None, None).unwrap();
        let _ = get_value(&shard, b"k");
        assert_eq!(shard.stats(true, false), (1, 0));
    }

    #[test]
    fn test_create_and_drop_tag_index() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        shard.set(b"a", Value::Int(1), None, Some("t")).unwrap();
        shard.create_tag_index().unwrap();
        assert_eq!(shard.reset(TAG_INDEX, None).unwrap(), SettingValue::Bool(true));
        assert_eq!(shard.evict("t").unwrap(), 1);
        shard.drop_tag_index().unwrap();
        assert_eq!(shard.reset(TAG_INDEX, None).unwrap(), SettingValue::Bool(false));
    }
}
