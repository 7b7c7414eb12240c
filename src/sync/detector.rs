// Change detection
//
// Reconciles one walk of a replica against its metadata store and turns the
// differences into an ordered change set, updating the store in one batch.

use super::change::{sort_for_apply, ChangeEntry};
use super::scanner::{fingerprint, FileEntry, Scanner};
use crate::error::Result;
use crate::store::{ChangeStamp, FileRecord, Fingerprint, ItemId, MetadataStore, ReplicaId};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};

pub struct Detector<'a> {
    scanner: &'a Scanner,
    tombstone_retention: chrono::Duration,
}

impl<'a> Detector<'a> {
    pub fn new(scanner: &'a Scanner, tombstone_retention: chrono::Duration) -> Self {
        Self {
            scanner,
            tombstone_retention,
        }
    }

    pub fn detect(&self, store: &mut MetadataStore) -> Result<Vec<ChangeEntry>> {
        let scan = self.scanner.scan()?;
        let now = Utc::now();
        let replica = store.replica();

        let mut working: BTreeMap<_, FileEntry> = scan
            .entries
            .iter()
            .map(|e| (e.relative_path.clone(), e.clone()))
            .collect();

        let mut missing: Vec<FileRecord> = Vec::new();
        let mut updated: Vec<(FileRecord, FileEntry, Fingerprint)> = Vec::new();
        let mut refreshed: Vec<(FileRecord, FileEntry)> = Vec::new();

        // Records whose path is still on disk
        for record in store.all_live() {
            match working.remove(&record.path) {
                None => {
                    if scan.is_unreadable(&record.path) {
                        tracing::debug!("Keeping {} (not readable this pass)", record.path.display());
                    } else {
                        missing.push(record.clone());
                    }
                }
                Some(entry) => {
                    if record.matches_metadata(entry.size, entry.modified) {
                        continue;
                    }
                    match fingerprint(&entry.path) {
                        Ok(fp) if fp == record.fingerprint => {
                            refreshed.push((record.clone(), entry));
                        }
                        Ok(fp) => updated.push((record.clone(), entry, fp)),
                        Err(e) => {
                            tracing::warn!("Cannot read {}: {}; retrying next cycle", entry.path.display(), e);
                        }
                    }
                }
            }
        }

        // Paths with no live record: new files, or the far end of a rename
        let mut new_files: Vec<(FileEntry, Fingerprint)> = Vec::new();
        for entry in working.into_values() {
            match fingerprint(&entry.path) {
                Ok(fp) => new_files.push((entry, fp)),
                Err(e) => {
                    tracing::warn!("Cannot read {}: {}; retrying next cycle", entry.path.display(), e);
                }
            }
        }

        let mut by_fingerprint: HashMap<Fingerprint, VecDeque<usize>> = HashMap::new();
        for (index, (_, fp)) in new_files.iter().enumerate() {
            by_fingerprint.entry(*fp).or_default().push_back(index);
        }

        missing.sort_by(|a, b| a.path.cmp(&b.path));
        let mut claimed = vec![false; new_files.len()];
        let mut renamed: Vec<(FileRecord, usize)> = Vec::new();
        let mut deleted: Vec<FileRecord> = Vec::new();

        for record in missing {
            let candidate = by_fingerprint
                .get_mut(&record.fingerprint)
                .and_then(|queue| queue.pop_front());
            match candidate {
                Some(index) => {
                    claimed[index] = true;
                    renamed.push((record, index));
                }
                None => deleted.push(record),
            }
        }

        // Apply everything to the store in one batch
        let mut changes = Vec::new();

        for record in deleted {
            if let Some(tombstone) = store.tombstone(&record.item_id, now) {
                changes.push(ChangeEntry::delete(tombstone.clone()));
            }
        }

        for (record, index) in renamed {
            let (entry, _) = &new_files[index];
            let old_path = record.path.clone();
            let moved = FileRecord {
                path: entry.relative_path.clone(),
                modified: entry.modified,
                size: entry.size,
                version: record.version + 1,
                ..record
            };
            store.upsert(moved.clone());
            changes.push(ChangeEntry::rename(moved, old_path));
        }

        for (record, entry, fp) in updated {
            let version = record.version + 1;
            let base = record.origin;
            let changed = FileRecord {
                fingerprint: fp,
                modified: entry.modified,
                size: entry.size,
                version,
                origin: ChangeStamp { replica, version },
                ..record
            };
            store.upsert(changed.clone());
            changes.push(ChangeEntry::update(changed, base));
        }

        for (record, entry) in refreshed {
            tracing::trace!("Touched without content change: {}", entry.relative_path.display());
            store.upsert(FileRecord {
                modified: entry.modified,
                size: entry.size,
                ..record
            });
        }

        for (index, (entry, fp)) in new_files.into_iter().enumerate() {
            if claimed[index] {
                continue;
            }
            let record = new_record(entry, fp, replica);
            store.upsert(record.clone());
            changes.push(ChangeEntry::create(record));
        }

        let purged = store.purge_tombstones(now - self.tombstone_retention);
        if purged > 0 {
            tracing::debug!("Purged {} expired tombstones", purged);
        }

        sort_for_apply(&mut changes);
        Ok(changes)
    }
}

fn new_record(entry: FileEntry, fingerprint: Fingerprint, replica: ReplicaId) -> FileRecord {
    FileRecord {
        item_id: ItemId::new(),
        path: entry.relative_path,
        fingerprint,
        modified: entry.modified,
        size: entry.size,
        version: 1,
        deleted_at: None,
        origin: ChangeStamp {
            replica,
            version: 1,
        },
    }
}
