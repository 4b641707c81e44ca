//! Filesystem-backed store of cached query results
//!
//! One directory per logical cache, one `<key>.sqlc` file per entry. Writers
//! stage into a uniquely named temporary file in the same directory and
//! rename it into place, so readers only ever see complete entries. Readers
//! pull the whole file with a single read, so a concurrent eviction (an
//! unlink) cannot cut a read short.

mod archive;
mod entry;
mod limits;

pub use archive::ArchiveReport;
pub use entry::{CacheEntry, ENTRY_EXTENSION, EntryInfo, EntryMeta};
pub use limits::PruneReport;

use crate::key::CacheKey;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Prefix of in-flight temporary files
pub(crate) const TEMP_PREFIX: &str = ".sqlc-";
/// Suffix of in-flight temporary files
pub(crate) const TEMP_SUFFIX: &str = ".tmp";

/// Summary of a store's contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Number of readable entries
    pub entries: usize,
    /// Combined size of readable entries in bytes
    pub total_bytes: u64,
    /// Creation time of the oldest entry
    pub oldest: Option<DateTime<Utc>>,
    /// Creation time of the newest entry
    pub newest: Option<DateTime<Utc>>,
}

/// Handle to a cache directory
///
/// The handle is cheap to clone and holds no open files; any number of
/// handles (in one process or many) may share a directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

/// Raw classification of the files in a store directory
#[derive(Debug, Default)]
pub(crate) struct Scan {
    pub entries: Vec<EntryInfo>,
    pub unreadable: Vec<(PathBuf, u64)>,
    pub temp_files: Vec<(PathBuf, SystemTime, u64)>,
}

impl CacheStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::io(e, &root, "create_dir_all"))?;
        Ok(Self { root })
    }

    /// A handle for `root` without touching the filesystem
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the entries
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file an entry for `key` is committed to
    #[must_use]
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}.{ENTRY_EXTENSION}", key.as_hex()))
    }

    /// Load and verify a complete entry
    ///
    /// Returns `NotFound` when no entry is committed under `key` and
    /// `CorruptEntry` when the file fails validation.
    pub fn get(&self, key: &CacheKey) -> Result<CacheEntry> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::not_found(key.as_hex()));
            }
            Err(e) => return Err(Error::io(e, &path, "read")),
        };
        let entry = entry::decode_entry(&bytes).map_err(|e| e.with_key(key.as_hex()))?;
        if entry.meta.key != *key {
            return Err(Error::corrupt(
                key.as_hex(),
                format!("file holds entry for key {}", entry.meta.key),
            ));
        }
        Ok(entry)
    }

    /// Read only the metadata header of an entry
    pub fn read_meta(&self, key: &CacheKey) -> Result<EntryInfo> {
        let path = self.entry_path(key);
        Self::read_info(&path).map_err(|e| match e {
            Error::Io { source, .. } if source.kind() == ErrorKind::NotFound => {
                Error::not_found(key.as_hex())
            }
            other => other.with_key(key.as_hex()),
        })
    }

    fn read_info(path: &Path) -> Result<EntryInfo> {
        let mut file = fs::File::open(path).map_err(|e| Error::io(e, path, "open"))?;
        let size = file
            .metadata()
            .map_err(|e| Error::io(e, path, "metadata"))?
            .len();
        let (meta, _payload_len) = entry::read_header(&mut file)?;
        Ok(EntryInfo {
            meta,
            size,
            path: path.to_path_buf(),
        })
    }

    /// Whether an entry file is committed under `key`
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entry_path(key).is_file()
    }

    /// Atomically commit `entry` under `key`, replacing any existing entry
    pub fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        if entry.meta.key != *key {
            return Err(Error::configuration(format!(
                "entry metadata names key {} but is being stored under {key}",
                entry.meta.key
            )));
        }
        let bytes = entry::encode_entry(entry)?;
        self.write_atomic(&self.entry_path(key), &bytes)?;
        tracing::debug!(key = %key, size = bytes.len(), "Committed cache entry");
        Ok(())
    }

    /// Write `bytes` to a fresh temp file beside `path`, flush, then rename
    pub(crate) fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| Error::io(e, &self.root, "create_dir_all"))?;
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.root)
            .map_err(|e| Error::io(e, &self.root, "create_temp"))?;
        tmp.write_all(bytes)
            .map_err(|e| Error::io(e, tmp.path(), "write"))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::io(e, tmp.path(), "sync"))?;
        tmp.persist(path)
            .map_err(|e| Error::io(e.error, path, "rename"))?;
        Ok(())
    }

    /// Remove the entry under `key`
    ///
    /// Returns whether an entry was removed; a missing entry is not an error.
    pub fn evict(&self, key: &CacheKey) -> Result<bool> {
        let path = self.entry_path(key);
        let removed = remove_if_present(&path)?;
        if removed {
            tracing::debug!(key = %key, "Evicted cache entry");
        }
        Ok(removed)
    }

    /// Metadata of every readable entry, oldest first
    ///
    /// Temporary files and unreadable entry files are skipped.
    pub fn list(&self) -> Result<Vec<EntryInfo>> {
        let mut entries = self.scan()?.entries;
        entries.sort_by(|a, b| a.meta.created_at.cmp(&b.meta.created_at));
        Ok(entries)
    }

    /// Combined size of readable entries in bytes
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.scan()?.entries.iter().map(|e| e.size).sum())
    }

    /// Entry count, total size and the creation-time range
    pub fn stats(&self) -> Result<StoreStats> {
        let entries = self.scan()?.entries;
        Ok(StoreStats {
            entries: entries.len(),
            total_bytes: entries.iter().map(|e| e.size).sum(),
            oldest: entries.iter().map(|e| e.meta.created_at).min(),
            newest: entries.iter().map(|e| e.meta.created_at).max(),
        })
    }

    pub(crate) fn scan(&self) -> Result<Scan> {
        let mut scan = Scan::default();
        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(scan),
            Err(e) => return Err(Error::io(e, &self.root, "read_dir")),
        };

        for item in dir {
            let item = item.map_err(|e| Error::io(e, &self.root, "read_dir"))?;
            let path = item.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX) {
                // A writer may rename or drop the file between listing and stat
                if let Ok(meta) = item.metadata() {
                    let modified = meta.modified().unwrap_or_else(|_| SystemTime::now());
                    scan.temp_files.push((path, modified, meta.len()));
                }
                continue;
            }
            if !is_entry_file_name(name) {
                continue;
            }

            match Self::read_info(&path) {
                Ok(info) => scan.entries.push(info),
                Err(Error::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {}
                Err(e) if e.is_corrupt() => {
                    tracing::warn!(path = %path.display(), error = %e, "Unreadable cache entry");
                    let size = item.metadata().map(|m| m.len()).unwrap_or(0);
                    scan.unreadable.push((path, size));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(scan)
    }
}

/// `<64 hex chars>.sqlc`
pub(crate) fn is_entry_file_name(name: &str) -> bool {
    name.strip_suffix(ENTRY_EXTENSION)
        .and_then(|stem| stem.strip_suffix('.'))
        .is_some_and(|stem| CacheKey::from_hex(stem).is_ok())
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(e, path, "remove_file")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Column, ColumnData, Table};
    use tempfile::TempDir;

    fn key(n: u8) -> CacheKey {
        CacheKey::from_hex(format!("{n:02x}").repeat(32)).unwrap()
    }

    fn entry_for(key: &CacheKey, rows: i64) -> CacheEntry {
        let table = Table::new(vec![Column::new(
            "n",
            ColumnData::Int64((0..rows).map(Some).collect()),
        )])
        .unwrap();
        let meta = EntryMeta::new(key.clone(), "select n from t", &table);
        CacheEntry::new(meta, crate::codec::encode(&table).unwrap())
    }

    #[test]
    fn put_then_get() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::open(tmp.path()).unwrap();
        let k = key(1);
        let entry = entry_for(&k, 3);

        store.put(&k, &entry).unwrap();
        assert!(store.contains(&k));
        assert_eq!(store.get(&k).unwrap(), entry);
        assert!(store.entry_path(&k).ends_with(format!("{k}.sqlc")));
    }

    #[test]
    fn get_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::open(tmp.path()).unwrap();
        assert!(store.get(&key(9)).unwrap_err().is_not_found());
        assert!(store.read_meta(&key(9)).unwrap_err().is_not_found());
    }

    #[test]
    fn put_replaces_existing_entry() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::open(tmp.path()).unwrap();
        let k = key(2);
        store.put(&k, &entry_for(&k, 1)).unwrap();
        store.put(&k, &entry_for(&k, 5)).unwrap();
        assert_eq!(store.get(&k).unwrap().meta.row_count, 5);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn put_rejects_mismatched_key() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::open(tmp.path()).unwrap();
        let err = store.put(&key(1), &entry_for(&key(2), 1)).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn evict_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::open(tmp.path()).unwrap();
        let k = key(3);
        store.put(&k, &entry_for(&k, 1)).unwrap();
        assert!(store.evict(&k).unwrap());
        assert!(!store.evict(&k).unwrap());
        assert!(!store.contains(&k));
    }

    #[test]
    fn truncated_file_is_corrupt_with_key() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::open(tmp.path()).unwrap();
        let k = key(4);
        store.put(&k, &entry_for(&k, 10)).unwrap();
        let path = store.entry_path(&k);
        let len = fs::metadata(&path).unwrap().len();
        fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 4)
            .unwrap();

        match store.get(&k).unwrap_err() {
            Error::CorruptEntry { key: reported, .. } => assert_eq!(reported, k.as_hex()),
            other => panic!("expected corrupt entry, got {other:?}"),
        }
        // Header is still intact, so metadata remains listable
        assert!(store.read_meta(&k).is_ok());
    }

    #[test]
    fn entry_under_wrong_name_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::open(tmp.path()).unwrap();
        store.put(&key(5), &entry_for(&key(5), 1)).unwrap();
        fs::rename(store.entry_path(&key(5)), store.entry_path(&key(6))).unwrap();
        assert!(store.get(&key(6)).unwrap_err().is_corrupt());
    }

    #[test]
    fn list_skips_temp_and_foreign_files() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::open(tmp.path()).unwrap();
        store.put(&key(1), &entry_for(&key(1), 1)).unwrap();
        store.put(&key(2), &entry_for(&key(2), 2)).unwrap();
        fs::write(tmp.path().join(".sqlc-abc.tmp"), b"partial").unwrap();
        fs::write(tmp.path().join("notes.txt"), b"hello").unwrap();
        fs::write(store.entry_path(&key(3)), b"garbage").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|e| e.meta.query_text == "select n from t"));
        assert!(listed.iter().all(|e| e.size > 0));

        let scan = store.scan().unwrap();
        assert_eq!(scan.temp_files.len(), 1);
        assert_eq!(scan.unreadable.len(), 1);
    }

    #[test]
    fn missing_root_lists_empty() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path().join("absent"));
        assert!(store.list().unwrap().is_empty());
        assert_eq!(store.stats().unwrap(), StoreStats::default());
    }

    #[test]
    fn stats_cover_all_entries() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::open(tmp.path()).unwrap();
        for n in 1..=3 {
            store.put(&key(n), &entry_for(&key(n), i64::from(n))).unwrap();
        }
        let stats = store.stats().unwrap();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.total_bytes, store.total_size().unwrap());
        assert!(stats.oldest <= stats.newest);
    }

    #[test]
    fn entry_file_names() {
        assert!(is_entry_file_name(&format!("{}.sqlc", "0f".repeat(32))));
        assert!(!is_entry_file_name(&format!("{}.sqlc", "0F".repeat(32))));
        assert!(!is_entry_file_name("abc.sqlc"));
        assert!(!is_entry_file_name(&format!("{}sqlc", "0f".repeat(32))));
        assert!(!is_entry_file_name(&"0f".repeat(32)));
    }
}
