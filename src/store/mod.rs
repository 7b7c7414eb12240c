// Per-replica metadata store
//
// Flat table of every tracked file keyed by item id, persisted as JSON in the
// work directory. Pure data: the detector and applier decide what to write.

pub mod identity;

pub use identity::ReplicaId;

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const STORE_FORMAT_VERSION: u32 = 1;

/// Stable identity of one logical file, shared by both replicas and kept
/// across renames
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content fingerprint: xxHash3-64 of the full content plus its length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub len: u64,
    pub hash: u64,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xxh3:{:016x}/{}", self.hash, self.len)
    }
}

/// Identifies one generation of an item's content: the replica that produced
/// it and that replica's version counter at the time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStamp {
    pub replica: ReplicaId,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub item_id: ItemId,
    /// Relative to the replica root
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    pub modified: DateTime<Utc>,
    pub size: u64,
    /// Replica-local, bumped on every change to this record; never reset
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub origin: ChangeStamp,
}

impl FileRecord {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Size and mtime still describe what is on disk
    pub fn matches_metadata(&self, size: u64, modified: DateTime<Utc>) -> bool {
        self.size == size && self.modified == modified
    }
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    format_version: u32,
    replica: ReplicaId,
    #[serde(default)]
    root: PathBuf,
    saved_at: DateTime<Utc>,
    #[serde(default)]
    records: BTreeMap<ItemId, FileRecord>,
}

/// Header-only view used to recover a lost replica id file
#[derive(Deserialize)]
pub(crate) struct StoreHeader {
    pub replica: ReplicaId,
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    replica: ReplicaId,
    root: PathBuf,
    records: BTreeMap<ItemId, FileRecord>,
    /// Live records only
    by_path: HashMap<PathBuf, ItemId>,
}

impl MetadataStore {
    pub fn new(replica: ReplicaId, root: impl Into<PathBuf>) -> Self {
        Self {
            replica,
            root: root.into(),
            records: BTreeMap::new(),
            by_path: HashMap::new(),
        }
    }

    /// Load the store for `replica`; a missing file is a fresh, empty store
    pub fn load(path: &Path, replica: ReplicaId, root: &Path) -> Result<Self> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No metadata store at {}; starting empty", path.display());
                return Ok(Self::new(replica, root));
            }
            Err(e) => {
                return Err(SyncError::Store {
                    path: path.to_path_buf(),
                    reason: format!("cannot open: {}", e),
                })
            }
        };

        let stored: StoreFile =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| SyncError::Store {
                path: path.to_path_buf(),
                reason: format!("corrupt: {}", e),
            })?;

        if stored.format_version > STORE_FORMAT_VERSION {
            return Err(SyncError::Store {
                path: path.to_path_buf(),
                reason: format!(
                    "written by a newer format (v{}, this build reads up to v{})",
                    stored.format_version, STORE_FORMAT_VERSION
                ),
            });
        }

        if stored.replica != replica {
            return Err(SyncError::Store {
                path: path.to_path_buf(),
                reason: format!(
                    "belongs to replica {}, expected {}",
                    stored.replica, replica
                ),
            });
        }

        if !stored.root.as_os_str().is_empty() && stored.root != root {
            tracing::warn!(
                "Metadata store {} was recorded for {}, now used for {}",
                path.display(),
                stored.root.display(),
                root.display()
            );
        }

        let mut store = Self::new(replica, root);
        for (item_id, record) in stored.records {
            if record.item_id != item_id {
                return Err(SyncError::Store {
                    path: path.to_path_buf(),
                    reason: format!("record keyed {} claims id {}", item_id, record.item_id),
                });
            }
            if record.is_live() {
                if let Some(other) = store.by_path.insert(record.path.clone(), item_id) {
                    return Err(SyncError::Store {
                        path: path.to_path_buf(),
                        reason: format!(
                            "items {} and {} are both live at {}",
                            other,
                            item_id,
                            record.path.display()
                        ),
                    });
                }
            }
            store.records.insert(item_id, record);
        }

        tracing::debug!(
            "Loaded metadata store {}: {} records ({} live)",
            path.display(),
            store.records.len(),
            store.by_path.len()
        );

        Ok(store)
    }

    /// Save atomically (temp file + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let to_store_error = |e: std::io::Error| SyncError::Store {
            path: path.to_path_buf(),
            reason: format!("cannot write: {}", e),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(to_store_error)?;
        }

        let temp_path = path.with_extension("json.tmp");
        let stored = StoreFile {
            format_version: STORE_FORMAT_VERSION,
            replica: self.replica,
            root: self.root.clone(),
            saved_at: Utc::now(),
            records: self.records.clone(),
        };

        let file = File::create(&temp_path).map_err(to_store_error)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &stored).map_err(|e| SyncError::Store {
            path: path.to_path_buf(),
            reason: format!("cannot serialize: {}", e),
        })?;
        writer.flush().map_err(to_store_error)?;
        drop(writer);

        std::fs::rename(&temp_path, path).map_err(to_store_error)?;

        tracing::trace!("Saved metadata store {} ({} records)", path.display(), self.records.len());
        Ok(())
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Any record for the item, live or tombstoned
    pub fn get(&self, item_id: &ItemId) -> Option<&FileRecord> {
        self.records.get(item_id)
    }

    pub fn get_live(&self, item_id: &ItemId) -> Option<&FileRecord> {
        self.records.get(item_id).filter(|r| r.is_live())
    }

    pub fn live_at(&self, path: &Path) -> Option<&FileRecord> {
        self.by_path.get(path).and_then(|id| self.records.get(id))
    }

    /// Version the next change to this item should carry
    pub fn next_version(&self, item_id: &ItemId) -> u64 {
        self.records.get(item_id).map(|r| r.version + 1).unwrap_or(1)
    }

    /// Insert or replace a record
    ///
    /// Keeps at most one live record per path: a different live item already
    /// at the record's path is tombstoned.
    pub fn upsert(&mut self, record: FileRecord) {
        let item_id = record.item_id;

        if let Some(previous) = self.records.get(&item_id) {
            if previous.is_live() && self.by_path.get(&previous.path) == Some(&item_id) {
                self.by_path.remove(&previous.path);
            }
        }

        if record.is_live() {
            if let Some(&displaced) = self.by_path.get(&record.path) {
                if displaced != item_id {
                    tracing::debug!(
                        "{} displaces {} at {}",
                        item_id,
                        displaced,
                        record.path.display()
                    );
                    self.tombstone(&displaced, Utc::now());
                }
            }
            self.by_path.insert(record.path.clone(), item_id);
        }

        self.records.insert(item_id, record);
    }

    /// Mark a live item deleted, bumping its version; returns the tombstone
    pub fn tombstone(&mut self, item_id: &ItemId, at: DateTime<Utc>) -> Option<&FileRecord> {
        let record = self.records.get_mut(item_id)?;
        if record.is_live() {
            if self.by_path.get(&record.path) == Some(item_id) {
                self.by_path.remove(&record.path);
            }
            record.deleted_at = Some(at);
            record.version += 1;
        }
        Some(record)
    }

    pub fn all_live(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.values().filter(|r| r.is_live())
    }

    /// Drop tombstones older than `older_than`; returns how many were removed
    pub fn purge_tombstones(&mut self, older_than: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, r| r.deleted_at.map(|at| at >= older_than).unwrap_or(true));
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn live_count(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
