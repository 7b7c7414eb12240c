use crate::fs_util;
use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};

/// Holding area for files the sync removes or replaces on one replica
///
/// Layout: `<base>/<label>/<UTC timestamp>/<relative path>`
#[derive(Debug, Clone)]
pub struct RecycleBin {
    dir: PathBuf,
}

impl RecycleBin {
    pub fn new(base: &Path, label: &str) -> Self {
        Self {
            dir: base.join(label),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Move `absolute` (a file at `relative` inside the replica) into the bin
    pub fn recycle(&self, absolute: &Path, relative: &Path) -> io::Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let target = free_name(&self.dir.join(stamp).join(relative));

        fs_util::move_file(absolute, &target)?;
        tracing::debug!("Recycled {} to {}", absolute.display(), target.display());
        Ok(target)
    }
}

fn free_name(wanted: &Path) -> PathBuf {
    if !wanted.exists() {
        return wanted.to_path_buf();
    }
    let name = wanted
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    (1u32..)
        .map(|n| wanted.with_file_name(format!("{}.{}", name, n)))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| wanted.to_path_buf())
}
