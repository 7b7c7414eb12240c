use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Replica path not found: {path}\nMake sure the directory exists and you have read permissions.")]
    ReplicaNotFound { path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read directory: {path}\nCause: {source}\nCheck that the directory exists and you have read permissions.")]
    ReadDirError { path: PathBuf, source: io::Error },

    #[error("Metadata store {path} is unusable: {reason}\nThe replica is skipped this cycle; fix or remove the file to start fresh.")]
    Store { path: PathBuf, reason: String },

    #[error("Replica identity file {path} is unreadable: {reason}\nRestore it from a backup; regenerating it orphans all metadata for this replica.")]
    ReplicaId { path: PathBuf, reason: String },

    #[error("Invalid path: {path}\nPaths must be valid UTF-8 and stay inside the replica root.")]
    InvalidPath { path: PathBuf },

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Why a single item could not be applied
///
/// Classified from the structured `io::ErrorKind` or raw OS code, never from
/// the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    AccessDenied,
    Locked,
    PathTooLong,
    NotFound,
    /// Source content no longer matches the fingerprint it was detected with
    SourceChanged,
    Other,
}

impl ErrorClass {
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => return Self::AccessDenied,
            io::ErrorKind::NotFound => return Self::NotFound,
            _ => {}
        }

        match err.raw_os_error() {
            #[cfg(unix)]
            Some(code) if code == libc::ENAMETOOLONG => Self::PathTooLong,
            #[cfg(unix)]
            Some(code) if code == libc::ETXTBSY || code == libc::EBUSY => Self::Locked,
            // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
            #[cfg(windows)]
            Some(32) | Some(33) => Self::Locked,
            // ERROR_FILENAME_EXCED_RANGE
            #[cfg(windows)]
            Some(206) => Self::PathTooLong,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessDenied => "access denied",
            Self::Locked => "file locked",
            Self::PathTooLong => "path too long",
            Self::NotFound => "not found",
            Self::SourceChanged => "source changed since detection",
            Self::Other => "filesystem error",
        }
    }
}

/// Failure applying one change entry; never aborts the batch
#[derive(Error, Debug)]
#[error("{} ({}): {source}", path.display(), class.as_str())]
pub struct ItemError {
    pub path: PathBuf,
    pub class: ErrorClass,
    pub source: io::Error,
}

impl ItemError {
    pub fn new(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            path: path.into(),
            class: ErrorClass::classify(&source),
            source,
        }
    }

    pub fn source_changed(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            source: io::Error::new(
                io::ErrorKind::Other,
                format!("{} was modified after it was scanned", path.display()),
            ),
            path,
            class: ErrorClass::SourceChanged,
        }
    }
}

/// Format bytes for human-readable display in summaries
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_kind() {
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(ErrorClass::classify(&err), ErrorClass::AccessDenied);

        let err = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(ErrorClass::classify(&err), ErrorClass::NotFound);
    }

    #[test]
    #[cfg(unix)]
    fn test_classify_by_os_code() {
        let err = io::Error::from_raw_os_error(libc::ENAMETOOLONG);
        assert_eq!(ErrorClass::classify(&err), ErrorClass::PathTooLong);

        let err = io::Error::from_raw_os_error(libc::EBUSY);
        assert_eq!(ErrorClass::classify(&err), ErrorClass::Locked);
    }

    #[test]
    fn test_message_text_is_ignored() {
        // Message text never influences classification
        let err = io::Error::new(io::ErrorKind::Other, "HRESULT 0x80070005");
        assert_eq!(ErrorClass::classify(&err), ErrorClass::Other);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }
}
