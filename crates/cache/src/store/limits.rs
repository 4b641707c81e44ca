//! Size and age limits

use super::{CacheStore, EntryInfo, Scan, remove_if_present};
use crate::key::CacheKey;
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::time::SystemTime;

/// Temp files younger than this may still belong to a live writer
const TEMP_FILE_GRACE: std::time::Duration = std::time::Duration::from_secs(60 * 60);

/// Why a file was selected for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemovalReason {
    /// Older than the age limit
    Expired,
    /// Oldest entry while the store exceeded its size budget
    OverSize,
    /// Entry file whose header cannot be read
    Unreadable,
    /// Temp file abandoned by a writer
    StaleTemp,
}

#[derive(Debug, Clone)]
struct Victim {
    path: PathBuf,
    size: u64,
    reason: RemovalReason,
    key: Option<CacheKey>,
    created_at: Option<DateTime<Utc>>,
}

/// Outcome of a pruning pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Keys removed, in removal order
    pub removed: Vec<CacheKey>,
    /// Entries removed for exceeding the age limit
    pub expired: usize,
    /// Entries removed to get under the size budget
    pub evicted_for_size: usize,
    /// Unreadable entry files removed
    pub unreadable: usize,
    /// Abandoned temp files removed
    pub temp_files: usize,
    /// Bytes reclaimed
    pub bytes_freed: u64,
    /// Entries left in the store
    pub remaining_entries: usize,
    /// Bytes left in the store
    pub remaining_bytes: u64,
    /// Nothing was deleted; the counts describe what would have been
    pub dry_run: bool,
}

impl CacheStore {
    /// Remove entries older than `max_age`, then the oldest entries until the
    /// store fits in `max_total_size` bytes
    ///
    /// Entries with equal creation time are evicted largest first. Unreadable
    /// entry files and temp files abandoned for over an hour are removed too.
    pub fn enforce_limits(
        &self,
        max_total_size: Option<u64>,
        max_age: Option<Duration>,
    ) -> Result<PruneReport> {
        self.prune_at(max_total_size, max_age, Utc::now(), false)
    }

    /// Report what `enforce_limits` would remove without removing anything
    pub fn preview_limits(
        &self,
        max_total_size: Option<u64>,
        max_age: Option<Duration>,
    ) -> Result<PruneReport> {
        self.prune_at(max_total_size, max_age, Utc::now(), true)
    }

    pub(crate) fn prune_at(
        &self,
        max_total_size: Option<u64>,
        max_age: Option<Duration>,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<PruneReport> {
        let scan = self.scan()?;
        let total: u64 = scan.entries.iter().map(|e| e.size).sum();
        tracing::debug!(
            root = %self.root.display(),
            entries = scan.entries.len(),
            total_bytes = total,
            "Scanned cache store"
        );

        let mut report = PruneReport {
            dry_run,
            remaining_entries: scan.entries.len(),
            remaining_bytes: total,
            ..PruneReport::default()
        };
        let victims = select_victims(scan, max_total_size, max_age, now, SystemTime::now());

        for victim in victims {
            if !dry_run && !self.remove_victim(&victim)? {
                continue;
            }
            match victim.reason {
                RemovalReason::Expired => report.expired += 1,
                RemovalReason::OverSize => report.evicted_for_size += 1,
                RemovalReason::Unreadable => report.unreadable += 1,
                RemovalReason::StaleTemp => report.temp_files += 1,
            }
            report.bytes_freed += victim.size;
            if let Some(key) = victim.key {
                report.remaining_entries = report.remaining_entries.saturating_sub(1);
                report.remaining_bytes = report.remaining_bytes.saturating_sub(victim.size);
                report.removed.push(key);
            }
        }

        tracing::info!(
            removed = report.removed.len(),
            unreadable = report.unreadable,
            temp_files = report.temp_files,
            bytes_freed = report.bytes_freed,
            remaining_bytes = report.remaining_bytes,
            dry_run,
            "Cache pruning complete"
        );
        Ok(report)
    }

    /// Delete one selected file; false when it vanished or was replaced first
    fn remove_victim(&self, victim: &Victim) -> Result<bool> {
        if let Some(created_at) = victim.created_at {
            // A writer may have committed a fresh entry under the same key
            // since the scan; only the scanned generation is removed.
            match Self::read_info(&victim.path) {
                Ok(current) if current.meta.created_at != created_at => {
                    tracing::debug!(path = %victim.path.display(), "Entry replaced during prune, keeping");
                    return Ok(false);
                }
                Ok(_) => {}
                Err(Error::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    return Ok(false);
                }
                Err(e) if e.is_corrupt() => {}
                Err(e) => return Err(e),
            }
        }

        match remove_if_present(&victim.path) {
            Ok(removed) => {
                if removed {
                    tracing::debug!(
                        path = %victim.path.display(),
                        size = victim.size,
                        reason = ?victim.reason,
                        "Removed cache file"
                    );
                }
                Ok(removed)
            }
            Err(e) => {
                tracing::warn!(path = %victim.path.display(), error = %e, "Failed to remove cache file");
                Ok(false)
            }
        }
    }
}

fn select_victims(
    scan: Scan,
    max_total_size: Option<u64>,
    max_age: Option<Duration>,
    now: DateTime<Utc>,
    wall_now: SystemTime,
) -> Vec<Victim> {
    let mut victims = Vec::new();

    for (path, modified, size) in scan.temp_files {
        let age = wall_now.duration_since(modified).unwrap_or_default();
        if age > TEMP_FILE_GRACE {
            victims.push(Victim {
                path,
                size,
                reason: RemovalReason::StaleTemp,
                key: None,
                created_at: None,
            });
        }
    }
    for (path, size) in scan.unreadable {
        victims.push(Victim {
            path,
            size,
            reason: RemovalReason::Unreadable,
            key: None,
            created_at: None,
        });
    }

    let mut live: Vec<EntryInfo> = Vec::with_capacity(scan.entries.len());
    for info in scan.entries {
        if max_age.is_some_and(|limit| info.age(now) > limit) {
            victims.push(victim_for(info, RemovalReason::Expired));
        } else {
            live.push(info);
        }
    }

    if let Some(budget) = max_total_size {
        // Oldest first; on equal age the larger entry goes first
        live.sort_by(|a, b| {
            a.meta
                .created_at
                .cmp(&b.meta.created_at)
                .then_with(|| b.size.cmp(&a.size))
                .then_with(|| a.meta.key.as_hex().cmp(b.meta.key.as_hex()))
        });
        let mut current: u64 = live.iter().map(|e| e.size).sum();
        for info in live {
            if current <= budget {
                break;
            }
            current = current.saturating_sub(info.size);
            victims.push(victim_for(info, RemovalReason::OverSize));
        }
    }

    victims
}

fn victim_for(info: EntryInfo, reason: RemovalReason) -> Victim {
    Victim {
        size: info.size,
        created_at: Some(info.meta.created_at),
        key: Some(info.meta.key),
        path: info.path,
        reason,
    }
}
