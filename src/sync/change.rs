use crate::error::{Result, SyncError};
use crate::store::{ChangeStamp, FileRecord, ItemId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Kind of a detected change; the derived order is the apply order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Delete,
    Rename,
    Update,
    Create,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Rename => "rename",
            Self::Update => "update",
            Self::Create => "create",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change found by a detection pass, consumed by the applier for the
/// matching direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub item_id: ItemId,
    pub kind: ChangeKind,
    pub old_path: Option<PathBuf>,
    pub new_path: Option<PathBuf>,
    /// Source record after the change (tombstone for deletes)
    pub record: FileRecord,
    /// Origin of the content this change was derived from; `None` for creates
    pub base: Option<ChangeStamp>,
}

impl ChangeEntry {
    pub fn create(record: FileRecord) -> Self {
        Self {
            item_id: record.item_id,
            kind: ChangeKind::Create,
            old_path: None,
            new_path: Some(record.path.clone()),
            record,
            base: None,
        }
    }

    pub fn update(record: FileRecord, base: ChangeStamp) -> Self {
        Self {
            item_id: record.item_id,
            kind: ChangeKind::Update,
            old_path: Some(record.path.clone()),
            new_path: Some(record.path.clone()),
            record,
            base: Some(base),
        }
    }

    pub fn rename(record: FileRecord, old_path: PathBuf) -> Self {
        Self {
            item_id: record.item_id,
            kind: ChangeKind::Rename,
            old_path: Some(old_path),
            new_path: Some(record.path.clone()),
            base: Some(record.origin),
            record,
        }
    }

    pub fn delete(tombstone: FileRecord) -> Self {
        Self {
            item_id: tombstone.item_id,
            kind: ChangeKind::Delete,
            old_path: Some(tombstone.path.clone()),
            new_path: None,
            base: Some(tombstone.origin),
            record: tombstone,
        }
    }

    /// The path the change lands on
    pub fn path(&self) -> &Path {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or(&self.record.path)
    }
}

/// Sort into apply order: deletes, renames, updates, creates; by path within
/// each group
pub fn sort_for_apply(entries: &mut [ChangeEntry]) {
    entries.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.path().cmp(b.path())));
}

/// Combine a fresh change set with entries carried over from an earlier
/// cycle
///
/// A fresh change for an item that still has queued entries is composed with
/// them, so the result describes the step from what the other replica last
/// received to the source's current state: a queued a→m rename followed by a
/// fresh m→z rename becomes a→z, and a fresh update or delete keeps the base
/// of a queued update. Entries the source has moved past are dropped at
/// apply time.
pub fn merge_retries(fresh: Vec<ChangeEntry>, retries: Vec<ChangeEntry>) -> Vec<ChangeEntry> {
    let mut queued: HashMap<ItemId, Vec<ChangeEntry>> = HashMap::new();
    for entry in retries {
        queued.entry(entry.item_id).or_default().push(entry);
    }

    let mut merged = Vec::with_capacity(fresh.len());
    for entry in fresh {
        match queued.remove(&entry.item_id) {
            Some(earlier) => merged.extend(compose(earlier, entry)),
            None => merged.push(entry),
        }
    }
    merged.extend(queued.into_values().flatten());
    sort_for_apply(&mut merged);
    merged
}

/// Fold one fresh change into the entries still queued for the same item
fn compose(earlier: Vec<ChangeEntry>, fresh: ChangeEntry) -> Vec<ChangeEntry> {
    let queued = |kind: ChangeKind| earlier.iter().find(|e| e.kind == kind);

    if queued(ChangeKind::Create).is_some() {
        // The other side never received the item
        return match fresh.kind {
            ChangeKind::Delete => Vec::new(),
            _ => vec![ChangeEntry::create(fresh.record)],
        };
    }

    let rename = queued(ChangeKind::Rename);
    let update = queued(ChangeKind::Update);
    let first_path = rename.and_then(|r| r.old_path.clone());

    match fresh.kind {
        ChangeKind::Delete => {
            let mut delete = fresh;
            if first_path.is_some() {
                delete.old_path = first_path;
            }
            if let Some(base) = update.or(rename).and_then(|e| e.base) {
                delete.base = Some(base);
            }
            vec![delete]
        }
        ChangeKind::Rename => {
            let mut moved = fresh;
            if first_path.is_some() {
                moved.old_path = first_path;
            }
            let mut composed: Vec<ChangeEntry> = update.cloned().into_iter().collect();
            // Renamed back to where the other side still has it
            if moved.old_path != moved.new_path {
                composed.push(moved);
            }
            composed
        }
        ChangeKind::Update => {
            let mut edited = fresh;
            if let Some(base) = update.and_then(|u| u.base) {
                edited.base = Some(base);
            }
            let mut composed: Vec<ChangeEntry> = rename.cloned().into_iter().collect();
            composed.push(edited);
            composed
        }
        // Fresh item ids never have queued entries
        ChangeKind::Create => {
            let mut composed = earlier;
            composed.push(fresh);
            composed
        }
    }
}

/// Read the queue of changes detected but not yet applied; a missing file is
/// an empty queue
pub fn load_pending(path: &Path) -> Result<Vec<ChangeEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SyncError::Io(e)),
    };
    serde_json::from_reader(BufReader::new(file)).map_err(|e| SyncError::Store {
        path: path.to_path_buf(),
        reason: format!("corrupt pending queue: {}", e),
    })
}

/// Save the pending queue atomically (temp file + rename)
pub fn save_pending(path: &Path, entries: &[ChangeEntry]) -> Result<()> {
    if entries.is_empty() {
        return match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(SyncError::Io(e)),
            _ => Ok(()),
        };
    }

    let temp_path = path.with_extension("json.tmp");
    let mut writer = BufWriter::new(File::create(&temp_path)?);
    serde_json::to_writer(&mut writer, entries).map_err(|e| SyncError::Store {
        path: path.to_path_buf(),
        reason: format!("cannot serialize pending queue: {}", e),
    })?;
    writer.flush()?;
    drop(writer);
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Fingerprint, ReplicaId};
    use chrono::Utc;

    fn record(path: &str) -> FileRecord {
        let replica = ReplicaId::new();
        FileRecord {
            item_id: ItemId::new(),
            path: PathBuf::from(path),
            fingerprint: Fingerprint { len: 1, hash: 1 },
            modified: Utc::now(),
            size: 1,
            version: 1,
            deleted_at: None,
            origin: ChangeStamp { replica, version: 1 },
        }
    }

    #[test]
    fn test_apply_order() {
        let mut entries = vec![
            ChangeEntry::create(record("b.txt")),
            ChangeEntry::create(record("a.txt")),
            ChangeEntry::update(record("z.txt"), record("z.txt").origin),
            ChangeEntry::rename(record("new.txt"), PathBuf::from("old.txt")),
            ChangeEntry::delete(record("gone.txt")),
        ];

        sort_for_apply(&mut entries);

        let order: Vec<(ChangeKind, &Path)> =
            entries.iter().map(|e| (e.kind, e.path())).collect();
        assert_eq!(
            order,
            vec![
                (ChangeKind::Delete, Path::new("gone.txt")),
                (ChangeKind::Rename, Path::new("new.txt")),
                (ChangeKind::Update, Path::new("z.txt")),
                (ChangeKind::Create, Path::new("a.txt")),
                (ChangeKind::Create, Path::new("b.txt")),
            ]
        );
    }

    #[test]
    fn test_paths_per_kind() {
        let delete = ChangeEntry::delete(record("gone.txt"));
        assert_eq!(delete.old_path.as_deref(), Some(Path::new("gone.txt")));
        assert!(delete.new_path.is_none());

        let rename = ChangeEntry::rename(record("new.txt"), PathBuf::from("old.txt"));
        assert_eq!(rename.old_path.as_deref(), Some(Path::new("old.txt")));
        assert_eq!(rename.path(), Path::new("new.txt"));
    }

    #[test]
    fn test_fresh_update_keeps_queued_base() {
        let rec = record("doc.txt");
        let received = rec.origin;
        let mut first_edit = rec.clone();
        first_edit.version = 2;
        first_edit.origin.version = 2;
        let stale = ChangeEntry::update(first_edit.clone(), received);
        let mut second_edit = first_edit.clone();
        second_edit.version = 3;
        second_edit.origin.version = 3;
        let fresh = ChangeEntry::update(second_edit.clone(), first_edit.origin);
        let unrelated = ChangeEntry::create(record("other.txt"));

        let merged = merge_retries(vec![fresh], vec![stale, unrelated.clone()]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].record, second_edit);
        assert_eq!(merged[0].base, Some(received));
        assert_eq!(merged[1], unrelated);
    }

    #[test]
    fn test_pending_rename_survives_later_edit() {
        let rec = record("moved.txt");
        let rename = ChangeEntry::rename(rec.clone(), PathBuf::from("orig.txt"));
        let update = ChangeEntry::update(rec.clone(), rec.origin);

        let merged = merge_retries(vec![update.clone()], vec![rename.clone()]);

        assert_eq!(merged, vec![rename, update]);
    }

    #[test]
    fn test_renames_compose_from_first_path() {
        let mut rec = record("m.txt");
        let first = ChangeEntry::rename(rec.clone(), PathBuf::from("a.txt"));
        rec.path = PathBuf::from("z.txt");
        let second = ChangeEntry::rename(rec.clone(), PathBuf::from("m.txt"));

        let merged = merge_retries(vec![second], vec![first]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].old_path.as_deref(), Some(Path::new("a.txt")));
        assert_eq!(merged[0].path(), Path::new("z.txt"));
    }

    #[test]
    fn test_rename_back_cancels_out() {
        let mut rec = record("m.txt");
        let away = ChangeEntry::rename(rec.clone(), PathBuf::from("a.txt"));
        rec.path = PathBuf::from("a.txt");
        let back = ChangeEntry::rename(rec, PathBuf::from("m.txt"));

        assert!(merge_retries(vec![back], vec![away]).is_empty());
    }

    #[test]
    fn test_delete_after_queued_changes_targets_what_was_received() {
        let rec = record("m.txt");
        let received = rec.origin;
        let rename = ChangeEntry::rename(rec.clone(), PathBuf::from("a.txt"));
        let mut edited = rec.clone();
        edited.origin.version = 3;
        let update = ChangeEntry::update(edited.clone(), received);
        let mut tombstone = edited;
        tombstone.deleted_at = Some(Utc::now());
        let delete = ChangeEntry::delete(tombstone);

        let merged = merge_retries(vec![delete], vec![rename, update]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].kind, ChangeKind::Delete);
        assert_eq!(merged[0].old_path.as_deref(), Some(Path::new("a.txt")));
        assert_eq!(merged[0].base, Some(received));
    }

    #[test]
    fn test_queued_create_absorbs_later_changes() {
        let rec = record("new.txt");
        let create = ChangeEntry::create(rec.clone());
        let mut edited = rec.clone();
        edited.origin.version = 2;
        let update = ChangeEntry::update(edited.clone(), rec.origin);

        let merged = merge_retries(vec![update], vec![create.clone()]);
        assert_eq!(merged, vec![ChangeEntry::create(edited)]);

        let mut tombstone = rec;
        tombstone.deleted_at = Some(Utc::now());
        assert!(merge_retries(vec![ChangeEntry::delete(tombstone)], vec![create]).is_empty());
    }

    #[test]
    fn test_pending_queue_persists() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("replica_a.pending.json");
        assert!(load_pending(&path).unwrap().is_empty());

        let entries = vec![
            ChangeEntry::delete(record("gone.txt")),
            ChangeEntry::rename(record("b.txt"), PathBuf::from("a.txt")),
        ];
        save_pending(&path, &entries).unwrap();
        assert_eq!(load_pending(&path).unwrap(), entries);

        // An empty queue leaves no file behind
        save_pending(&path, &[]).unwrap();
        assert!(!path.exists());
        assert!(load_pending(&path).unwrap().is_empty());
    }
}
