//! Shard Entries - Value model and on-disk log records
//!
//! A stored item is an [`Entry`]: the payload (inline, or a reference to
//! an external value file), an optional absolute expiry, and an optional
//! tag for group eviction. Entries are persisted as framed records in
//! the shard's append-only log:
//!
//! ```text
//! Log file:
//! +----------------+----------------+----------------+
//! | Header (8B)    | Record 1       | Record 2 ...   |
//! +----------------+----------------+----------------+
//!
//! Header:
//! - magic: 4 bytes "FCSH"
//! - version: 2 bytes
//! - reserved: 2 bytes
//!
//! Record:
//! - op: 1 byte (SET=1, DELETE=2, META=3)
//! - key_len: 4 bytes
//! - key: variable
//! - payload_len: 4 bytes
//! - payload: variable (bincode serialized)
//! - crc32: 4 bytes (over op + key + payload)
//! ```

use std::io::{self, Read, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

/// Log magic bytes
pub(crate) const LOG_MAGIC: &[u8; 4] = b"FCSH";
/// Log format version
pub(crate) const LOG_VERSION: u16 = 1;
/// Log header size
pub(crate) const LOG_HEADER_SIZE: u64 = 8;

// ============================================================================
// Value
// ============================================================================

/// A cached value.
///
/// `Value::None` is a legitimate stored value and is distinct from "key
/// not present": absence is signaled by `Option<Fetched>::None` at the
/// shard boundary, never by a sentinel value that a caller could store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Approximate in-memory/in-log size of the payload in bytes.
    pub fn size(&self) -> u64 {
        match self {
            Value::None => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 8,
            Value::Text(s) => s.len() as u64,
            Value::Bytes(b) => b.len() as u64,
        }
    }

    /// Raw bytes of a `Text`/`Bytes` payload, if it has any.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Text(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::None
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

// ============================================================================
// Entry
// ============================================================================

/// Where an entry's payload lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueSlot {
    /// Payload stored inline in the log record.
    Inline(Value),
    /// Payload stored in an external value file under the shard's
    /// `values/` directory. `name` is the file name, not a path.
    /// `text` records whether the bytes came from a `Value::Text` so the
    /// value reads back with its original type.
    File { name: String, len: u64, text: bool },
}

/// One stored cache item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub slot: ValueSlot,
    /// Absolute expiry, milliseconds since the Unix epoch. `None` means
    /// the item never expires.
    pub expire_at: Option<u64>,
    pub tag: Option<String>,
}

impl Entry {
    /// Whether the entry is logically absent at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expire_at, Some(at) if at <= now_ms)
    }

    /// Payload size in bytes, wherever it lives.
    pub fn payload_size(&self) -> u64 {
        match &self.slot {
            ValueSlot::Inline(v) => v.size(),
            ValueSlot::File { len, .. } => *len,
        }
    }
}

/// Milliseconds since the Unix epoch for `t`; clamps times before the
/// epoch to 0.
pub(crate) fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Inverse of [`unix_millis`].
pub(crate) fn from_unix_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

// ============================================================================
// Log Records
// ============================================================================

/// Log operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum LogOp {
    Set = 1,
    Delete = 2,
    Meta = 3,
}

impl TryFrom<u8> for LogOp {
    type Error = io::Error;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(LogOp::Set),
            2 => Ok(LogOp::Delete),
            3 => Ok(LogOp::Meta),
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, "invalid log op")),
        }
    }
}

/// One framed log record.
#[derive(Debug, Clone)]
pub(crate) struct LogRecord {
    pub op: LogOp,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub fn new(op: LogOp, key: &[u8], payload: Vec<u8>) -> Self {
        Self {
            op,
            key: key.to_vec(),
            payload,
        }
    }

    fn crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[self.op as u8]);
        hasher.update(&self.key);
        hasher.update(&self.payload);
        hasher.finalize()
    }

    /// Append the framed record to `w`.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(self.op as u8)?;
        w.write_u32::<LittleEndian>(self.key.len() as u32)?;
        w.write_all(&self.key)?;
        w.write_u32::<LittleEndian>(self.payload.len() as u32)?;
        w.write_all(&self.payload)?;
        w.write_u32::<LittleEndian>(self.crc())?;
        Ok(())
    }

    /// Size of the framed record on disk.
    pub fn frame_len(&self) -> u64 {
        1 + 4 + self.key.len() as u64 + 4 + self.payload.len() as u64 + 4
    }

    /// Read one record from `r`.
    ///
    /// Returns `Ok(None)` at a clean end of file. A torn or corrupt
    /// record (short read, bad op, bad checksum) is an `InvalidData`
    /// error; the store truncates the log there on replay.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Option<LogRecord>> {
        let op = match r.read_u8() {
            Ok(b) => LogOp::try_from(b)?,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        let torn = |e: io::Error| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(io::ErrorKind::InvalidData, "torn log record")
            } else {
                e
            }
        };
        let key_len = r.read_u32::<LittleEndian>().map_err(torn)? as usize;
        let mut key = vec![0u8; key_len];
        r.read_exact(&mut key).map_err(torn)?;
        let payload_len = r.read_u32::<LittleEndian>().map_err(torn)? as usize;
        let mut payload = vec![0u8; payload_len];
        r.read_exact(&mut payload).map_err(torn)?;
        let stored_crc = r.read_u32::<LittleEndian>().map_err(torn)?;
        let record = LogRecord { op, key, payload };
        if record.crc() != stored_crc {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "log record checksum mismatch",
            ));
        }
        Ok(Some(record))
    }
}

/// Write the log header to `w`.
pub(crate) fn write_log_header<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(LOG_MAGIC)?;
    w.write_u16::<LittleEndian>(LOG_VERSION)?;
    w.write_u16::<LittleEndian>(0)?; // reserved
    Ok(())
}

/// Read and validate the log header.
pub(crate) fn read_log_header<R: Read>(r: &mut R) -> io::Result<()> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != LOG_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad shard log magic",
        ));
    }
    let version = r.read_u16::<LittleEndian>()?;
    if version != LOG_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported shard log version {version}"),
        ));
    }
    let _reserved = r.read_u16::<LittleEndian>()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_value_size() {
        assert_eq!(Value::None.size(), 0);
        assert_eq!(Value::Int(7).size(), 8);
        assert_eq!(Value::Text("abc".into()).size(), 3);
        assert_eq!(Value::Bytes(vec![0; 10]).size(), 10);
    }

    #[test]
    fn test_entry_expiry() {
        let entry = Entry {
            slot: ValueSlot::Inline(Value::Int(1)),
            expire_at: Some(1_000),
            tag: None,
        };
        assert!(!entry.is_expired(999));
        assert!(entry.is_expired(1_000));
        assert!(entry.is_expired(1_001));
        let forever = Entry {
            slot: ValueSlot::Inline(Value::Int(1)),
            expire_at: None,
            tag: None,
        };
        assert!(!forever.is_expired(u64::MAX));
    }

    #[test]
    fn test_record_round_trip() {
        let entry = Entry {
            slot: ValueSlot::Inline(Value::Text("hello".into())),
            expire_at: Some(42),
            tag: Some("t".into()),
        };
        let payload = bincode::serialize(&entry).unwrap();
        let record = LogRecord::new(LogOp::Set, b"key", payload);

        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, record.frame_len());

        let mut cursor = Cursor::new(buf);
        let back = LogRecord::read_from(&mut cursor).unwrap().unwrap();
        assert_eq!(back.op, LogOp::Set);
        assert_eq!(back.key, b"key");
        let decoded: Entry = bincode::deserialize(&back.payload).unwrap();
        assert_eq!(decoded, entry);
        // Clean EOF after the last record.
        assert!(LogRecord::read_from(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_torn_record_is_invalid_data() {
        let record = LogRecord::new(LogOp::Delete, b"some-key", Vec::new());
        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();
        buf.truncate(buf.len() - 3);
        let err = LogRecord::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_corrupt_crc_rejected() {
        let record = LogRecord::new(LogOp::Delete, b"k", Vec::new());
        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();
        let mid = buf.len() / 2;
        buf[mid] ^= 0xFF;
        let err = LogRecord::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_log_header_round_trip() {
        let mut buf = Vec::new();
        write_log_header(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, LOG_HEADER_SIZE);
        read_log_header(&mut Cursor::new(&buf)).unwrap();

        let mut bad = buf.clone();
        bad[0] = b'X';
        assert!(read_log_header(&mut Cursor::new(&bad)).is_err());
    }
}
