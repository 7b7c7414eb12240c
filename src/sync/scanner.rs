use crate::error::{Result, SyncError};
use crate::filter::FilterEngine;
use crate::store::Fingerprint;
use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::Xxh3;

/// Prefix of the temporary files the applier stages content in
pub const TEMP_PREFIX: &str = ".duosync-";
pub const TEMP_SUFFIX: &str = ".tmp";

const HASH_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub relative_path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Result of one walk: regular files plus directories/files that could not
/// be read (their existing records must not be treated as deleted)
#[derive(Debug, Default)]
pub struct ScanResult {
    pub entries: Vec<FileEntry>,
    pub unreadable: Vec<PathBuf>,
}

impl ScanResult {
    pub fn is_unreadable(&self, relative_path: &Path) -> bool {
        self.unreadable.iter().any(|p| relative_path.starts_with(p))
    }
}

pub struct Scanner {
    root: PathBuf,
    filter: FilterEngine,
    skip: Vec<PathBuf>,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>, filter: FilterEngine) -> Self {
        Self {
            root: root.into(),
            filter,
            skip: Vec::new(),
        }
    }

    /// Never descend into `path` (absolute), e.g. a work directory kept
    /// inside a replica
    pub fn skip_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.skip.push(path.into());
        self
    }

    pub fn scan(&self) -> Result<ScanResult> {
        if !self.root.is_dir() {
            return Err(SyncError::ReplicaNotFound {
                path: self.root.clone(),
            });
        }

        let root = self.root.clone();
        let filter = self.filter.clone();
        let skip = self.skip.clone();

        let walker = WalkBuilder::new(&self.root)
            .standard_filters(false) // sync everything that is not explicitly excluded
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                if skip.iter().any(|s| entry.path() == s.as_path()) {
                    return false;
                }
                if is_temp_name(entry.file_name().to_str().unwrap_or("")) {
                    return false;
                }
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                match entry.path().strip_prefix(&root) {
                    Ok(relative) => !filter.is_excluded(relative, is_dir),
                    Err(_) => false,
                }
            })
            .build();

        let mut result = ScanResult::default();

        for walk_result in walker {
            let entry = match walk_result {
                Ok(entry) => entry,
                Err(err) => match error_path(&err) {
                    Some(path) => {
                        tracing::warn!("Cannot read {}: {}", path.display(), err);
                        result.unreadable.push(self.relative(&path)?);
                        continue;
                    }
                    None => {
                        return Err(SyncError::ReadDirError {
                            path: self.root.clone(),
                            source: io::Error::other(err.to_string()),
                        })
                    }
                },
            };

            let Some(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_file() {
                if file_type.is_symlink() {
                    tracing::debug!("Skipping symlink {}", entry.path().display());
                }
                continue;
            }

            let path = entry.path().to_path_buf();
            let relative_path = self.relative(&path)?;

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    tracing::warn!("Cannot stat {}: {}", path.display(), err);
                    result.unreadable.push(relative_path);
                    continue;
                }
            };
            let modified = match metadata.modified() {
                Ok(modified) => DateTime::<Utc>::from(modified),
                Err(err) => {
                    tracing::warn!("No modification time for {}: {}", path.display(), err);
                    result.unreadable.push(relative_path);
                    continue;
                }
            };

            result.entries.push(FileEntry {
                path,
                relative_path,
                size: metadata.len(),
                modified,
            });
        }

        tracing::debug!(
            "Scanned {}: {} files, {} unreadable",
            self.root.display(),
            result.entries.len(),
            result.unreadable.len()
        );

        Ok(result)
    }

    fn relative(&self, path: &Path) -> Result<PathBuf> {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .map_err(|_| SyncError::InvalidPath {
                path: path.to_path_buf(),
            })
    }
}

fn error_path(err: &ignore::Error) -> Option<PathBuf> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path.clone()),
        ignore::Error::WithDepth { err, .. } => error_path(err),
        ignore::Error::WithLineNumber { err, .. } => error_path(err),
        ignore::Error::Loop { child, .. } => Some(child.clone()),
        _ => None,
    }
}

pub fn is_temp_name(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)
}

/// Hash the full content of a file
pub fn fingerprint(path: &Path) -> io::Result<Fingerprint> {
    let mut file = File::open(path)?;
    let mut hasher = Xxh3::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut len = 0u64;

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        len += n as u64;
    }

    Ok(Fingerprint {
        len,
        hash: hasher.digest(),
    })
}
