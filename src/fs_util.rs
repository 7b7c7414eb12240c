use crate::store::Fingerprint;
use crate::sync::scanner::{TEMP_PREFIX, TEMP_SUFFIX};
use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use xxhash_rust::xxh3::Xxh3;

const CHUNK_SIZE: usize = 256 * 1024;

/// Size and modification time of a file as currently on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Stat a regular file; `None` if nothing is there
pub fn stat(path: &Path) -> io::Result<Option<FileStat>> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_file() => Ok(Some(FileStat {
            size: meta.len(),
            modified: DateTime::<Utc>::from(meta.modified()?),
        })),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if two paths are on the same filesystem
#[cfg(unix)]
pub fn same_filesystem(path1: &Path, path2: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let meta1 = match fs::metadata(path1) {
        Ok(m) => m,
        Err(_) => return false,
    };
    let meta2 = match fs::metadata(path2) {
        Ok(m) => m,
        Err(_) => return false,
    };

    meta1.dev() == meta2.dev()
}

#[cfg(not(unix))]
pub fn same_filesystem(path1: &Path, path2: &Path) -> bool {
    path1.components().next() == path2.components().next()
}

/// Content copied into a temporary file beside its destination, not yet
/// visible under the final name
pub struct StagedFile {
    temp: NamedTempFile,
    fingerprint: Fingerprint,
}

impl StagedFile {
    /// Fingerprint of the bytes actually copied
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Move the staged content to `dest`, replacing whatever is there
    pub fn commit(self, dest: &Path) -> io::Result<FileStat> {
        self.temp.persist(dest).map_err(|e| e.error)?;
        stat(dest)?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "file vanished right after commit")
        })
    }
}

/// Stream `source` into a temp file in `dest`'s directory, hashing on the way
/// and stamping it with `modified`
pub fn stage_copy(source: &Path, dest: &Path, modified: DateTime<Utc>) -> io::Result<StagedFile> {
    let parent = match dest.parent() {
        Some(parent) => parent,
        None => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no parent directory", dest.display()),
            ))
        }
    };
    fs::create_dir_all(parent)?;

    let mut source_file = File::open(source)?;
    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent)?;

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut hasher = Xxh3::new();
    let mut len = 0u64;

    loop {
        let bytes_read = source_file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        temp.write_all(&buffer[..bytes_read])?;
        len += bytes_read as u64;
    }
    temp.as_file().sync_all()?;

    let mtime = FileTime::from_unix_time(modified.timestamp(), modified.timestamp_subsec_nanos());
    filetime::set_file_handle_times(temp.as_file(), None, Some(mtime))?;

    let fingerprint = Fingerprint {
        len,
        hash: hasher.digest(),
    };
    tracing::trace!("Staged {} ({})", source.display(), fingerprint);

    Ok(StagedFile { temp, fingerprint })
}

/// Move a file, creating the destination's parents; falls back to
/// copy + remove across filesystems
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    let parent = to.parent().unwrap_or(Path::new(""));
    fs::create_dir_all(parent)?;

    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if !same_filesystem(from, parent) => {
            tracing::debug!(
                "Rename {} -> {} failed ({}); copying across filesystems",
                from.display(),
                to.display(),
                e
            );
            let mtime = FileTime::from_last_modification_time(&fs::metadata(from)?);
            fs::copy(from, to)?;
            filetime::set_file_mtime(to, mtime)?;
            fs::remove_file(from)
        }
        Err(e) => Err(e),
    }
}

/// Remove `dir` and its ancestors while they are empty, never touching `root`
pub fn prune_empty_dirs(root: &Path, dir: &Path) {
    let mut current = dir;
    while current != root && current.starts_with(root) {
        if fs::remove_dir(current).is_err() {
            break;
        }
        tracing::trace!("Removed empty directory {}", current.display());
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
}
