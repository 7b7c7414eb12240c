// Replica identity
//
// A random id generated the first time a replica is synced and persisted in
// a side-car file next to its metadata store.

use super::StoreHeader;
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Read the id file, creating it if needed
    ///
    /// A missing id file is only regenerated when no metadata store exists;
    /// otherwise the id recorded in the store header is restored so existing
    /// records stay attached to this replica.
    pub fn load_or_create(id_path: &Path, store_path: &Path) -> Result<Self> {
        match std::fs::read_to_string(id_path) {
            Ok(content) => {
                let line = content.lines().next().unwrap_or("").trim();
                return line.parse().map_err(|e: uuid::Error| SyncError::ReplicaId {
                    path: id_path.to_path_buf(),
                    reason: e.to_string(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SyncError::ReplicaId {
                    path: id_path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        }

        let id = match Self::from_store_header(store_path)? {
            Some(id) => {
                tracing::warn!(
                    "Replica id file {} missing; restored {} from {}",
                    id_path.display(),
                    id,
                    store_path.display()
                );
                id
            }
            None => {
                let id = Self::new();
                tracing::info!("Generated replica id {} ({})", id, id_path.display());
                id
            }
        };

        id.persist(id_path)?;
        Ok(id)
    }

    fn from_store_header(store_path: &Path) -> Result<Option<Self>> {
        let file = match File::open(store_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SyncError::ReplicaId {
                    path: store_path.to_path_buf(),
                    reason: format!("id file missing and store unreadable: {}", e),
                })
            }
        };

        let header: StoreHeader =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| SyncError::ReplicaId {
                path: store_path.to_path_buf(),
                reason: format!("id file missing and store header unreadable: {}", e),
            })?;
        Ok(Some(header.replica))
    }

    fn persist(&self, id_path: &Path) -> Result<()> {
        if let Some(parent) = id_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(id_path, format!("{}\n", self.0))?;
        Ok(())
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReplicaId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}
