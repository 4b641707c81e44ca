//! On-disk entry file format
//!
//! ```text
//! "SQLCACHE"  format_version:u16  header_len:u32  header:json  payload
//! ```
//!
//! The JSON header carries everything `list()` needs (key, query text,
//! creation time, row count, schema) plus the payload length and SHA-256, so
//! metadata can be read without touching the payload and a truncated or
//! altered payload is detected before it reaches the codec.

use crate::key::{CacheKey, Normalization};
use crate::table::{ColumnSchema, Table};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::PathBuf;

/// File extension of committed entries
pub const ENTRY_EXTENSION: &str = "sqlc";

const MAGIC: &[u8; 8] = b"SQLCACHE";
const FORMAT_VERSION: u16 = 1;
const PREFIX_LEN: usize = MAGIC.len() + 2 + 4;
const MAX_HEADER_LEN: usize = 16 * 1024 * 1024;

/// Metadata stored alongside every cached result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Key the entry is stored under
    pub key: CacheKey,
    /// Query text exactly as the caller supplied it
    pub query_text: String,
    /// Scrubbed identity of the database the result came from
    pub db_identity: String,
    /// Logical cache name, when the store belongs to a named cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_name: Option<String>,
    /// Database user that executed the query, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Number of bound parameters
    pub param_count: usize,
    /// Whether the key hashed normalized or raw text
    pub normalization: Normalization,
    /// Query calls a function whose value changes per execution
    #[serde(default)]
    pub volatile: bool,
    /// When the query was executed
    pub created_at: DateTime<Utc>,
    /// How long execution took
    pub duration_ms: u64,
    /// Rows in the result
    pub row_count: u64,
    /// Ordered result schema
    pub schema: Vec<ColumnSchema>,
    /// Version of sqlcache that wrote the entry
    pub sqlcache_version: String,
}

impl EntryMeta {
    /// Metadata for a freshly executed result
    #[must_use]
    pub fn new(key: CacheKey, query_text: impl Into<String>, table: &Table) -> Self {
        Self {
            key,
            query_text: query_text.into(),
            db_identity: String::new(),
            cache_name: None,
            username: None,
            param_count: 0,
            normalization: Normalization::Normalized,
            volatile: false,
            created_at: Utc::now(),
            duration_ms: 0,
            row_count: table.row_count() as u64,
            schema: table.schema(),
            sqlcache_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Age of the entry relative to `now`
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.created_at)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    #[serde(flatten)]
    meta: EntryMeta,
    payload_len: u64,
    payload_sha256: String,
}

/// A complete stored entry: metadata plus codec payload
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Entry metadata
    pub meta: EntryMeta,
    /// Columnar codec blob
    pub payload: Vec<u8>,
}

impl CacheEntry {
    /// Pair metadata with an encoded payload
    #[must_use]
    pub const fn new(meta: EntryMeta, payload: Vec<u8>) -> Self {
        Self { meta, payload }
    }
}

/// Metadata of a committed entry, as reported by `list()`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryInfo {
    /// Entry metadata
    pub meta: EntryMeta,
    /// Size of the entry file in bytes
    pub size: u64,
    /// Location of the entry file
    pub path: PathBuf,
}

impl EntryInfo {
    /// Key of the entry
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.meta.key
    }

    /// Age of the entry relative to `now`
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        self.meta.age(now)
    }
}

/// Serialize an entry into its file representation
pub(crate) fn encode_entry(entry: &CacheEntry) -> Result<Vec<u8>> {
    let header = Header {
        meta: entry.meta.clone(),
        payload_len: entry.payload.len() as u64,
        payload_sha256: hex::encode(Sha256::digest(&entry.payload)),
    };
    let json = serde_json::to_vec(&header)
        .map_err(|e| Error::serialization(format!("Failed to serialize entry header: {e}")))?;
    let header_len = u32::try_from(json.len())
        .ok()
        .filter(|&n| n as usize <= MAX_HEADER_LEN)
        .ok_or_else(|| Error::serialization("entry header too large"))?;

    let mut out = Vec::with_capacity(PREFIX_LEN + json.len() + entry.payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(&json);
    out.extend_from_slice(&entry.payload);
    Ok(out)
}

fn parse_prefix(prefix: &[u8]) -> Result<usize> {
    if prefix.len() < PREFIX_LEN || &prefix[..MAGIC.len()] != MAGIC {
        return Err(Error::corrupt("", "not a sqlcache entry (bad magic)"));
    }
    let version = u16::from_le_bytes([prefix[8], prefix[9]]);
    if version != FORMAT_VERSION {
        return Err(Error::corrupt(
            "",
            format!("unsupported entry format version {version}"),
        ));
    }
    let header_len = u32::from_le_bytes([prefix[10], prefix[11], prefix[12], prefix[13]]) as usize;
    if header_len > MAX_HEADER_LEN {
        return Err(Error::corrupt("", "entry header length out of range"));
    }
    Ok(header_len)
}

fn parse_header(json: &[u8]) -> Result<Header> {
    serde_json::from_slice(json)
        .map_err(|e| Error::corrupt("", format!("unreadable entry header: {e}")))
}

/// Parse and verify a complete entry file
pub(crate) fn decode_entry(bytes: &[u8]) -> Result<CacheEntry> {
    let header_len = parse_prefix(bytes)?;
    let body = &bytes[PREFIX_LEN..];
    if body.len() < header_len {
        return Err(Error::corrupt("", "truncated entry header"));
    }
    let (json, payload) = body.split_at(header_len);
    let header = parse_header(json)?;

    if payload.len() as u64 != header.payload_len {
        return Err(Error::corrupt(
            "",
            format!(
                "payload is {} bytes, header says {}",
                payload.len(),
                header.payload_len
            ),
        ));
    }
    let digest = hex::encode(Sha256::digest(payload));
    if digest != header.payload_sha256 {
        return Err(Error::corrupt("", "payload checksum mismatch"));
    }

    Ok(CacheEntry {
        meta: header.meta,
        payload: payload.to_vec(),
    })
}

/// Read only the metadata from the start of an entry file
///
/// Returns the metadata and the payload length the header declares.
pub(crate) fn read_header(reader: &mut impl Read) -> Result<(EntryMeta, u64)> {
    let mut prefix = [0u8; PREFIX_LEN];
    reader.read_exact(&mut prefix).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::corrupt("", "truncated entry prefix"),
        _ => Error::io_no_path(e, "read"),
    })?;
    let header_len = parse_prefix(&prefix)?;

    let mut json = vec![0u8; header_len];
    reader.read_exact(&mut json).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::corrupt("", "truncated entry header"),
        _ => Error::io_no_path(e, "read"),
    })?;
    let header = parse_header(&json)?;
    Ok((header.meta, header.payload_len))
}
