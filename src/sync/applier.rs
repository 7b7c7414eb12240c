// Change application
//
// Applies one direction's change set to the destination replica. Every entry
// ends as exactly one outcome; errors are classified per item and never abort
// the batch.

use super::change::{ChangeEntry, ChangeKind};
use super::output::{AppliedChange, SkippedChange, SyncObserver};
use super::recycle::RecycleBin;
use super::{Side, SyncOptions};
use crate::error::ItemError;
use crate::filter::FilterEngine;
use crate::fs_util::{self, FileStat, StagedFile};
use crate::store::{ChangeStamp, FileRecord, ItemId, MetadataStore, ReplicaId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{self, AtomicBool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both replicas edited the same item since their last common version
    ConcurrentUpdate,
    /// One side deleted an item the other side edited or renamed
    UpdateDelete,
    /// Two different items claim the same path
    NameCollision,
    /// Both sides renamed the same item to different paths
    RenameRename,
    /// The destination file changed after it was last scanned
    DestinationChanged,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConcurrentUpdate => "concurrent update",
            Self::UpdateDelete => "update/delete",
            Self::NameCollision => "name collision",
            Self::RenameRename => "rename/rename",
            Self::DestinationChanged => "destination changed",
        }
    }
}

#[derive(Debug)]
pub enum SkipReason {
    Conflict(ConflictKind),
    Filtered,
    UpToDate,
    /// The source replica moved on after the entry was produced
    Superseded,
    Error(ItemError),
}

impl SkipReason {
    /// Offer the entry again next cycle
    pub fn should_retry(&self) -> bool {
        matches!(
            self,
            Self::Error(_) | Self::Conflict(ConflictKind::DestinationChanged)
        )
    }
}

#[derive(Debug)]
pub enum Outcome {
    Applied { conflict: Option<ConflictKind> },
    Skipped(SkipReason),
}

fn up_to_date() -> Outcome {
    Outcome::Skipped(SkipReason::UpToDate)
}

fn conflict(kind: ConflictKind) -> Outcome {
    Outcome::Skipped(SkipReason::Conflict(kind))
}

type ItemResult<T> = std::result::Result<T, ItemError>;

#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: usize,
    /// Conflicts seen, whether resolved in favour of the incoming change or not
    pub conflicts: usize,
    pub up_to_date: usize,
    pub filtered: usize,
    pub superseded: usize,
    pub errors: usize,
    /// Errors counted but not reported (access denied on delete)
    pub benign: usize,
    pub bytes_copied: u64,
    /// Entries to offer again next cycle
    pub retry: Vec<ChangeEntry>,
    pub interrupted: bool,
}

/// Shared, read-only settings for one apply pass
pub struct ApplyContext<'a> {
    pub filter: &'a FilterEngine,
    pub recycle: &'a RecycleBin,
    pub options: &'a SyncOptions,
    pub shutdown: &'a AtomicBool,
}

pub struct Applier<'a> {
    from: Side,
    source_root: &'a Path,
    source: &'a MetadataStore,
    dest_root: &'a Path,
    dest: &'a mut MetadataStore,
    ctx: ApplyContext<'a>,
    bytes_copied: u64,
}

impl<'a> Applier<'a> {
    pub fn new(
        from: Side,
        source: (&'a Path, &'a MetadataStore),
        dest: (&'a Path, &'a mut MetadataStore),
        ctx: ApplyContext<'a>,
    ) -> Self {
        Self {
            from,
            source_root: source.0,
            source: source.1,
            dest_root: dest.0,
            dest: dest.1,
            ctx,
            bytes_copied: 0,
        }
    }

    /// Apply entries in order, stopping between items once shutdown is
    /// requested (the rest are handed back for retry)
    pub fn apply(mut self, entries: Vec<ChangeEntry>, observer: &mut dyn SyncObserver) -> ApplyReport {
        let mut report = ApplyReport::default();
        let mut entries = entries.into_iter();

        while let Some(entry) = entries.next() {
            if self.ctx.shutdown.load(atomic::Ordering::SeqCst) {
                tracing::info!("Shutdown requested; deferring {} changes", entries.len() + 1);
                report.interrupted = true;
                report.retry.push(entry);
                report.retry.extend(entries.by_ref());
                break;
            }

            let outcome = self
                .apply_entry(&entry)
                .unwrap_or_else(|e| Outcome::Skipped(SkipReason::Error(e)));
            self.report(entry, outcome, &mut report, observer);
        }

        report.bytes_copied = self.bytes_copied;
        report
    }

    fn report(
        &self,
        entry: ChangeEntry,
        outcome: Outcome,
        report: &mut ApplyReport,
        observer: &mut dyn SyncObserver,
    ) {
        match outcome {
            Outcome::Applied { conflict } => {
                report.applied += 1;
                if let Some(kind) = conflict {
                    report.conflicts += 1;
                    tracing::info!("{}: {} resolved for the incoming change", entry.path().display(), kind.as_str());
                }
                tracing::debug!("Applied {} {} ({})", entry.kind, entry.path().display(), self.from.arrow());
                observer.applied(&AppliedChange {
                    from: self.from,
                    kind: entry.kind,
                    old_path: entry.old_path.as_deref(),
                    new_path: entry.new_path.as_deref(),
                    conflict,
                });
            }
            Outcome::Skipped(reason) => {
                match &reason {
                    SkipReason::Conflict(kind) => {
                        report.conflicts += 1;
                        tracing::info!("{}: {} kept the destination", entry.path().display(), kind.as_str());
                    }
                    SkipReason::Filtered => report.filtered += 1,
                    SkipReason::UpToDate => report.up_to_date += 1,
                    SkipReason::Superseded => report.superseded += 1,
                    SkipReason::Error(e) => {
                        report.errors += 1;
                        tracing::debug!("Failed {} {}: {}", entry.kind, entry.path().display(), e);
                    }
                }

                let skipped = SkippedChange {
                    from: self.from,
                    kind: entry.kind,
                    path: entry.path(),
                    reason: &reason,
                };
                if skipped.is_benign() {
                    report.benign += 1;
                } else if !matches!(reason, SkipReason::Superseded) {
                    observer.skipped(&skipped);
                }

                if reason.should_retry() {
                    report.retry.push(entry);
                }
            }
        }
    }

    fn apply_entry(&mut self, entry: &ChangeEntry) -> ItemResult<Outcome> {
        let excluded = [entry.old_path.as_deref(), entry.new_path.as_deref()]
            .into_iter()
            .flatten()
            .any(|p| self.ctx.filter.excludes_file(p));
        if excluded {
            return Ok(Outcome::Skipped(SkipReason::Filtered));
        }

        if entry.kind == ChangeKind::Delete {
            if self.source.get_live(&entry.item_id).is_some() {
                return Ok(Outcome::Skipped(SkipReason::Superseded));
            }
            return self.apply_delete(entry);
        }

        // Content and path always come from the source's current record
        let incoming = match self.source.get_live(&entry.item_id) {
            Some(current) if is_current(entry, current) => current.clone(),
            _ => return Ok(Outcome::Skipped(SkipReason::Superseded)),
        };

        if entry.kind == ChangeKind::Rename {
            return self.apply_rename(entry, &incoming);
        }

        match self.dest.get_live(&entry.item_id).cloned() {
            Some(existing) => self.overwrite(entry, &incoming, existing),
            None => self.place_new(&incoming, &incoming.path),
        }
    }

    fn apply_delete(&mut self, entry: &ChangeEntry) -> ItemResult<Outcome> {
        let Some(existing) = self.dest.get_live(&entry.item_id).cloned() else {
            return Ok(up_to_date());
        };
        // The source's tombstone may be newer than the queued one
        let tombstone = self.source.get(&entry.item_id).unwrap_or(&entry.record);
        let same_path = existing.path == tombstone.path
            || entry.old_path.as_deref() == Some(existing.path.as_path());
        if !same_path || !self.dest_is_behind(&existing, tombstone, entry.base) {
            return Ok(conflict(ConflictKind::UpdateDelete));
        }

        match self.stat_dest(&existing.path)? {
            None => {
                tracing::debug!("{} already gone", existing.path.display());
            }
            Some(stat) if !existing.matches_metadata(stat.size, stat.modified) => {
                return Ok(conflict(ConflictKind::DestinationChanged));
            }
            Some(_) => {
                if self.ctx.options.recycle_deleted {
                    self.recycle_file(&existing.path)?;
                } else {
                    let absolute = self.dest_root.join(&existing.path);
                    std::fs::remove_file(&absolute).map_err(|e| ItemError::new(&existing.path, e))?;
                }
                self.prune(&existing.path);
            }
        }

        self.dest.tombstone(&existing.item_id, Utc::now());
        Ok(Outcome::Applied { conflict: None })
    }

    /// Bring an item the destination does not track yet to `path`
    fn place_new(&mut self, incoming: &FileRecord, path: &Path) -> ItemResult<Outcome> {
        let Some(occupant) = self.dest.live_at(path).cloned() else {
            if self.stat_dest(path)?.is_some() {
                // Untracked file; the destination's next scan will pick it up
                return Ok(conflict(ConflictKind::DestinationChanged));
            }
            let staged = self.stage(incoming, path)?;
            self.commit(staged, incoming, path)?;
            return Ok(Outcome::Applied { conflict: None });
        };

        if self.is_stale(&occupant)? {
            return Ok(conflict(ConflictKind::DestinationChanged));
        }

        if occupant.fingerprint == incoming.fingerprint {
            // Same bytes under two identities: both sides keep the smaller id
            if incoming.item_id < occupant.item_id {
                tracing::debug!(
                    "{}: rebinding identical content from {} to {}",
                    path.display(),
                    occupant.item_id,
                    incoming.item_id
                );
                self.dest.tombstone(&occupant.item_id, Utc::now());
                let version = self.dest.next_version(&incoming.item_id);
                self.dest.upsert(FileRecord {
                    item_id: incoming.item_id,
                    path: path.to_path_buf(),
                    version,
                    deleted_at: None,
                    origin: incoming.origin,
                    ..occupant
                });
            }
            return Ok(up_to_date());
        }

        if !incoming_wins(incoming, &occupant) {
            return Ok(conflict(ConflictKind::NameCollision));
        }

        let staged = self.stage(incoming, path)?;
        self.displace(&occupant)?;
        self.commit(staged, incoming, path)?;
        Ok(Outcome::Applied {
            conflict: Some(ConflictKind::NameCollision),
        })
    }

    /// Replace the content of an item the destination already tracks
    fn overwrite(
        &mut self,
        entry: &ChangeEntry,
        incoming: &FileRecord,
        existing: FileRecord,
    ) -> ItemResult<Outcome> {
        if existing.origin == incoming.origin {
            return Ok(up_to_date());
        }
        if self.is_stale(&existing)? {
            return Ok(conflict(ConflictKind::DestinationChanged));
        }

        if existing.fingerprint == incoming.fingerprint {
            if incoming_wins(incoming, &existing) {
                let version = existing.version + 1;
                self.dest.upsert(FileRecord {
                    origin: incoming.origin,
                    version,
                    ..existing
                });
            }
            return Ok(up_to_date());
        }

        let resolved = if self.dest_is_behind(&existing, incoming, entry.base) {
            None
        } else if incoming_wins(incoming, &existing) {
            Some(ConflictKind::ConcurrentUpdate)
        } else {
            return Ok(conflict(ConflictKind::ConcurrentUpdate));
        };

        let staged = self.stage(incoming, &existing.path)?;
        if resolved.is_some() || self.ctx.options.recycle_updated {
            self.recycle_file(&existing.path)?;
        }
        self.commit(staged, incoming, &existing.path)?;
        Ok(Outcome::Applied { conflict: resolved })
    }

    fn apply_rename(&mut self, entry: &ChangeEntry, incoming: &FileRecord) -> ItemResult<Outcome> {
        let new_path = incoming.path.clone();
        let Some(existing) = self.dest.get_live(&entry.item_id).cloned() else {
            return self.place_new(incoming, &new_path);
        };
        if existing.path == new_path {
            return Ok(up_to_date());
        }

        let expected_old = entry.old_path.as_deref().unwrap_or(&existing.path);
        if existing.path != expected_old && new_path >= existing.path {
            // Renamed on both sides; the smaller path wins everywhere
            return Ok(conflict(ConflictKind::RenameRename));
        }

        if self.is_stale(&existing)? {
            return Ok(conflict(ConflictKind::DestinationChanged));
        }

        let mut resolved = None;
        match self.dest.live_at(&new_path).cloned() {
            Some(occupant) => {
                if self.is_stale(&occupant)? {
                    return Ok(conflict(ConflictKind::DestinationChanged));
                }
                if !collision_winner_is_incoming(incoming, &occupant) {
                    self.displace(&existing)?;
                    self.prune(&existing.path);
                    return Ok(conflict(ConflictKind::NameCollision));
                }
                self.displace(&occupant)?;
                resolved = Some(ConflictKind::NameCollision);
            }
            None => {
                if self.stat_dest(&new_path)?.is_some() {
                    return Ok(conflict(ConflictKind::DestinationChanged));
                }
            }
        }

        let from = self.dest_root.join(&existing.path);
        let to = self.dest_root.join(&new_path);
        fs_util::move_file(&from, &to).map_err(|e| ItemError::new(&new_path, e))?;
        self.prune(&existing.path);

        let stat = self.stat_after_write(&new_path)?;
        let version = existing.version + 1;
        self.dest.upsert(FileRecord {
            path: new_path,
            modified: stat.modified,
            size: stat.size,
            version,
            ..existing
        });
        Ok(Outcome::Applied { conflict: resolved })
    }

    fn stage(&self, incoming: &FileRecord, path: &Path) -> ItemResult<StagedFile> {
        let source = self.source_root.join(&incoming.path);
        let staged = fs_util::stage_copy(&source, &self.dest_root.join(path), incoming.modified)
            .map_err(|e| ItemError::new(&incoming.path, e))?;
        if staged.fingerprint() != incoming.fingerprint {
            return Err(ItemError::source_changed(&incoming.path));
        }
        Ok(staged)
    }

    fn commit(&mut self, staged: StagedFile, incoming: &FileRecord, path: &Path) -> ItemResult<()> {
        let stat = staged
            .commit(&self.dest_root.join(path))
            .map_err(|e| ItemError::new(path, e))?;
        self.bytes_copied += stat.size;

        let version = self.dest.next_version(&incoming.item_id);
        self.dest.upsert(FileRecord {
            item_id: incoming.item_id,
            path: path.to_path_buf(),
            fingerprint: incoming.fingerprint,
            modified: stat.modified,
            size: stat.size,
            version,
            deleted_at: None,
            origin: incoming.origin,
        });
        Ok(())
    }

    /// Recycle a losing item's file and tombstone its record
    fn displace(&mut self, loser: &FileRecord) -> ItemResult<()> {
        if self.stat_dest(&loser.path)?.is_some() {
            self.recycle_file(&loser.path)?;
        }
        self.dest.tombstone(&loser.item_id, Utc::now());
        Ok(())
    }

    fn recycle_file(&self, relative: &Path) -> ItemResult<PathBuf> {
        self.ctx
            .recycle
            .recycle(&self.dest_root.join(relative), relative)
            .map_err(|e| ItemError::new(relative, e))
    }

    fn prune(&self, relative: &Path) {
        if let Some(parent) = self.dest_root.join(relative).parent() {
            fs_util::prune_empty_dirs(self.dest_root, parent);
        }
    }

    fn stat_dest(&self, relative: &Path) -> ItemResult<Option<FileStat>> {
        fs_util::stat(&self.dest_root.join(relative)).map_err(|e| ItemError::new(relative, e))
    }

    fn stat_after_write(&self, relative: &Path) -> ItemResult<FileStat> {
        self.stat_dest(relative)?.ok_or_else(|| {
            ItemError::new(
                relative,
                std::io::Error::new(std::io::ErrorKind::NotFound, "file vanished right after write"),
            )
        })
    }

    /// The destination holds nothing the source has not already seen: its
    /// content came from `source` itself, or from the base the change was
    /// derived from
    fn dest_is_behind(&self, existing: &FileRecord, source: &FileRecord, base: Option<ChangeStamp>) -> bool {
        existing.origin == source.origin
            || base == Some(existing.origin)
            || (existing.origin.replica == self.source.replica() && existing.origin.version <= source.version)
    }

    /// The destination file no longer matches what its record says
    fn is_stale(&self, record: &FileRecord) -> ItemResult<bool> {
        Ok(!matches!(
            self.stat_dest(&record.path)?,
            Some(stat) if record.matches_metadata(stat.size, stat.modified)
        ))
    }
}

fn is_current(entry: &ChangeEntry, current: &FileRecord) -> bool {
    match entry.kind {
        ChangeKind::Rename => current.path == entry.record.path,
        _ => current.origin == entry.record.origin,
    }
}

fn conflict_key(record: &FileRecord) -> (DateTime<Utc>, ReplicaId, ItemId) {
    (record.modified, record.origin.replica, record.item_id)
}

/// Last-writer-wins: later mtime, then greater origin replica id, then
/// greater item id. Both directions evaluate the same pair and agree.
pub fn incoming_wins(incoming: &FileRecord, existing: &FileRecord) -> bool {
    conflict_key(incoming) > conflict_key(existing)
}

/// Winner between two different items competing for one path
pub fn collision_winner_is_incoming(incoming: &FileRecord, occupant: &FileRecord) -> bool {
    if incoming.fingerprint == occupant.fingerprint {
        incoming.item_id < occupant.item_id
    } else {
        incoming_wins(incoming, occupant)
    }
}
