//! Export and import of whole stores as `.tar.zst` archives

use super::{CacheStore, TEMP_PREFIX, TEMP_SUFFIX, entry, is_entry_file_name};
use crate::key::CacheKey;
use crate::{Error, Result};
use serde::Serialize;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

const ARCHIVE_EXTENSION: &str = "tar.zst";

/// Outcome of an export or import
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveReport {
    /// Archive written or read
    pub path: PathBuf,
    /// Entries written to the archive or committed to the store
    pub entries: usize,
    /// Archive members or store files passed over as invalid
    pub skipped: usize,
}

impl CacheStore {
    /// Write every valid entry into a zstd-compressed tar archive
    ///
    /// A destination without an extension gets `.tar.zst` appended. The
    /// archive is staged next to the destination and renamed into place.
    pub fn export(&self, dest: &Path) -> Result<ArchiveReport> {
        let dest = if dest.extension().is_none() {
            dest.with_extension(ARCHIVE_EXTENSION)
        } else {
            dest.to_path_buf()
        };
        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| Error::io(e, &parent, "create_dir_all"))?;

        let staging = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&parent)
            .map_err(|e| Error::io(e, &parent, "create_temp"))?;
        let file = staging
            .reopen()
            .map_err(|e| Error::io(e, staging.path(), "open"))?;
        let enc = zstd::Encoder::new(file, crate::codec::DEFAULT_COMPRESSION_LEVEL)
            .map_err(|e| Error::configuration(format!("zstd encoder error: {e}")))?;
        let mut builder = tar::Builder::new(enc);

        let mut report = ArchiveReport {
            path: dest.clone(),
            ..ArchiveReport::default()
        };
        for info in self.list()? {
            let bytes = match fs::read(&info.path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::io(e, &info.path, "read")),
            };
            // Only entries that would be served are worth sharing
            if let Err(e) = entry::decode_entry(&bytes) {
                tracing::warn!(key = %info.meta.key, error = %e, "Skipping corrupt entry in export");
                report.skipped += 1;
                continue;
            }

            let name = format!("{}.{}", info.meta.key, super::ENTRY_EXTENSION);
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(u64::try_from(info.meta.created_at.timestamp()).unwrap_or(0));
            builder
                .append_data(&mut header, &name, bytes.as_slice())
                .map_err(|e| Error::configuration(format!("tar append failed: {e}")))?;
            report.entries += 1;
        }

        let enc = builder
            .into_inner()
            .map_err(|e| Error::configuration(format!("tar finalize failed: {e}")))?;
        let file = enc
            .finish()
            .map_err(|e| Error::configuration(format!("zstd finish failed: {e}")))?;
        file.sync_all()
            .map_err(|e| Error::io(e, staging.path(), "sync"))?;
        drop(file);
        staging
            .persist(&dest)
            .map_err(|e| Error::io(e.error, &dest, "rename"))?;

        tracing::info!(
            path = %dest.display(),
            entries = report.entries,
            skipped = report.skipped,
            "Exported cache"
        );
        Ok(report)
    }

    /// Commit every valid entry from an archive written by [`CacheStore::export`]
    ///
    /// Members that are not `<key>.sqlc` files, or whose contents fail
    /// validation, are skipped. Existing entries under the same key are
    /// replaced.
    pub fn import(&self, src: &Path) -> Result<ArchiveReport> {
        let file = fs::File::open(src).map_err(|e| Error::io(e, src, "open"))?;
        let dec = zstd::Decoder::new(file)
            .map_err(|e| Error::configuration(format!("zstd decoder error: {e}")))?;
        let mut archive = tar::Archive::new(dec);

        let mut report = ArchiveReport {
            path: src.to_path_buf(),
            ..ArchiveReport::default()
        };
        let members = archive
            .entries()
            .map_err(|e| Error::corrupt("", format!("unreadable archive: {e}")))?;
        for member in members {
            let mut member =
                member.map_err(|e| Error::corrupt("", format!("unreadable archive member: {e}")))?;
            let name = member
                .path()
                .ok()
                .and_then(|p| p.to_str().map(str::to_string))
                .unwrap_or_default();

            if !member.header().entry_type().is_file() || !is_entry_file_name(&name) {
                tracing::debug!(member = %name, "Skipping archive member");
                report.skipped += 1;
                continue;
            }

            let mut bytes = Vec::new();
            member
                .read_to_end(&mut bytes)
                .map_err(|e| Error::io(e, src, "read"))?;
            match validate(&name, &bytes) {
                Ok(key) => {
                    self.write_atomic(&self.entry_path(&key), &bytes)?;
                    report.entries += 1;
                }
                Err(e) => {
                    tracing::warn!(member = %name, error = %e, "Skipping invalid archive member");
                    report.skipped += 1;
                }
            }
        }

        tracing::info!(
            path = %src.display(),
            entries = report.entries,
            skipped = report.skipped,
            "Imported cache"
        );
        Ok(report)
    }
}

/// Check that archived bytes form a complete entry for the key in its name
fn validate(name: &str, bytes: &[u8]) -> Result<CacheKey> {
    let stem = name
        .strip_suffix(super::ENTRY_EXTENSION)
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or(name);
    let key = CacheKey::from_hex(stem)?;
    let entry = entry::decode_entry(bytes).map_err(|e| e.with_key(key.as_hex()))?;
    if entry.meta.key != key {
        return Err(Error::corrupt(
            key.as_hex(),
            format!("archived under {key} but holds {}", entry.meta.key),
        ));
    }
    Ok(key)
}
