use super::applier::{ConflictKind, SkipReason};
use super::change::ChangeKind;
use super::{CycleStats, Side};
use crate::error::{format_bytes, ErrorClass};
use colored::Colorize;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub struct AppliedChange<'a> {
    pub from: Side,
    pub kind: ChangeKind,
    pub old_path: Option<&'a Path>,
    pub new_path: Option<&'a Path>,
    pub conflict: Option<ConflictKind>,
}

impl AppliedChange<'_> {
    pub fn path(&self) -> &Path {
        self.new_path.or(self.old_path).unwrap_or(Path::new(""))
    }
}

pub struct SkippedChange<'a> {
    pub from: Side,
    pub kind: ChangeKind,
    pub path: &'a Path,
    pub reason: &'a SkipReason,
}

impl SkippedChange<'_> {
    /// Access denied while deleting: counted, never reported
    pub fn is_benign(&self) -> bool {
        self.kind == ChangeKind::Delete
            && matches!(self.reason, SkipReason::Error(e) if e.class == ErrorClass::AccessDenied)
    }

    pub fn reason_str(&self) -> String {
        match self.reason {
            SkipReason::Conflict(kind) => format!("conflict: {}", kind.as_str()),
            SkipReason::Filtered => "filtered".to_string(),
            SkipReason::UpToDate => "up to date".to_string(),
            SkipReason::Superseded => "superseded".to_string(),
            SkipReason::Error(e) => format!("error: {}", e.class.as_str()),
        }
    }
}

/// Receives one notification per change entry, plus a summary per cycle
pub trait SyncObserver: Send {
    fn applied(&mut self, change: &AppliedChange<'_>);
    fn skipped(&mut self, change: &SkippedChange<'_>);
    fn cycle_finished(&mut self, _stats: &CycleStats) {}
}

/// Human-readable lines on stdout
pub struct ConsoleObserver {
    quiet: bool,
}

impl ConsoleObserver {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl SyncObserver for ConsoleObserver {
    fn applied(&mut self, change: &AppliedChange<'_>) {
        if self.quiet {
            return;
        }
        let direction = change.from.arrow().dimmed();
        let line = match change.kind {
            ChangeKind::Rename => format!(
                "-- Applied {} for file {} as {}",
                "RENAME".cyan(),
                change.old_path.unwrap_or(Path::new("")).display(),
                change.path().display()
            ),
            ChangeKind::Create => format!("-- Applied {} for file {}", "CREATE".green(), change.path().display()),
            ChangeKind::Update => format!("-- Applied {} for file {}", "OVERWRITE".yellow(), change.path().display()),
            ChangeKind::Delete => format!("-- Applied {} for file {}", "DELETE".red(), change.path().display()),
        };
        match change.conflict {
            Some(kind) => println!("{} {} ({} resolved)", direction, line, kind.as_str()),
            None => println!("{} {}", direction, line),
        }
    }

    fn skipped(&mut self, change: &SkippedChange<'_>) {
        // Routine skips are only interesting in the log
        let detail = match change.reason {
            SkipReason::Error(e) => e.source.to_string(),
            SkipReason::Conflict(kind) => format!("{} conflict; the other side's version was kept", kind.as_str()),
            _ => return,
        };
        if self.quiet && matches!(change.reason, SkipReason::Conflict(_)) {
            return;
        }
        eprintln!(
            "{} -- Skipped applying {} for {} due to {}\n   [{}]",
            change.from.arrow().dimmed(),
            change.kind.as_str().to_uppercase(),
            change.path.display(),
            change.reason_str().bold(),
            detail
        );
    }

    fn cycle_finished(&mut self, stats: &CycleStats) {
        if self.quiet || stats.is_quiet() {
            return;
        }
        println!(
            "{} {} applied, {} conflicts, {} errors, {} copied in {:.1}s",
            "Cycle finished:".bold(),
            stats.applied,
            stats.conflicts,
            stats.errors,
            format_bytes(stats.bytes_copied),
            stats.duration_secs
        );
    }
}

/// Machine-readable sync events, one JSON object per line (NDJSON)
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Applied {
        from: Side,
        kind: ChangeKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        old_path: Option<PathBuf>,
        path: PathBuf,
        #[serde(skip_serializing_if = "Option::is_none")]
        conflict: Option<ConflictKind>,
    },
    Skipped {
        from: Side,
        kind: ChangeKind,
        path: PathBuf,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_class: Option<ErrorClass>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Summary {
        cycle: u64,
        applied: usize,
        conflicts: usize,
        errors: usize,
        benign_errors: usize,
        bytes_copied: u64,
        duration_secs: f64,
    },
}

impl SyncEvent {
    /// Emit this event as JSON to stdout
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }
}

impl From<&AppliedChange<'_>> for SyncEvent {
    fn from(change: &AppliedChange<'_>) -> Self {
        SyncEvent::Applied {
            from: change.from,
            kind: change.kind,
            old_path: match change.kind {
                ChangeKind::Rename => change.old_path.map(Path::to_path_buf),
                _ => None,
            },
            path: change.path().to_path_buf(),
            conflict: change.conflict,
        }
    }
}

impl From<&SkippedChange<'_>> for SyncEvent {
    fn from(change: &SkippedChange<'_>) -> Self {
        let (error_class, error) = match change.reason {
            SkipReason::Error(e) => (Some(e.class), Some(e.source.to_string())),
            _ => (None, None),
        };
        SyncEvent::Skipped {
            from: change.from,
            kind: change.kind,
            path: change.path.to_path_buf(),
            reason: change.reason_str(),
            error_class,
            error,
        }
    }
}

pub struct JsonObserver;

impl SyncObserver for JsonObserver {
    fn applied(&mut self, change: &AppliedChange<'_>) {
        SyncEvent::from(change).emit();
    }

    fn skipped(&mut self, change: &SkippedChange<'_>) {
        SyncEvent::from(change).emit();
    }

    fn cycle_finished(&mut self, stats: &CycleStats) {
        SyncEvent::Summary {
            cycle: stats.cycle,
            applied: stats.applied,
            conflicts: stats.conflicts,
            errors: stats.errors,
            benign_errors: stats.benign,
            bytes_copied: stats.bytes_copied,
            duration_secs: stats.duration_secs,
        }
        .emit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ItemError;
    use std::io;

    #[test]
    fn test_serialize_applied_rename() {
        let change = AppliedChange {
            from: Side::A,
            kind: ChangeKind::Rename,
            old_path: Some(Path::new("old.txt")),
            new_path: Some(Path::new("new.txt")),
            conflict: None,
        };

        let json = serde_json::to_string(&SyncEvent::from(&change)).unwrap();
        assert!(json.contains(r#""type":"applied""#));
        assert!(json.contains(r#""from":"a""#));
        assert!(json.contains(r#""kind":"rename""#));
        assert!(json.contains(r#""old_path":"old.txt""#));
        assert!(json.contains(r#""path":"new.txt""#));
        assert!(!json.contains("conflict"));
    }

    #[test]
    fn test_serialize_skipped_error() {
        let reason = SkipReason::Error(ItemError::new(
            "locked.db",
            io::Error::from(io::ErrorKind::PermissionDenied),
        ));
        let change = SkippedChange {
            from: Side::B,
            kind: ChangeKind::Update,
            path: Path::new("locked.db"),
            reason: &reason,
        };

        let json = serde_json::to_string(&SyncEvent::from(&change)).unwrap();
        assert!(json.contains(r#""type":"skipped""#));
        assert!(json.contains(r#""error_class":"access_denied""#));
        assert!(json.contains(r#""reason":"error: access denied""#));
    }

    #[test]
    fn test_serialize_summary_event() {
        let event = SyncEvent::Summary {
            cycle: 3,
            applied: 10,
            conflicts: 1,
            errors: 0,
            benign_errors: 2,
            bytes_copied: 123456,
            duration_secs: 12.5,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"summary""#));
        assert!(json.contains(r#""applied":10"#));
        assert!(json.contains(r#""duration_secs":12.5"#));
    }

    #[test]
    fn test_access_denied_delete_is_benign() {
        let denied = SkipReason::Error(ItemError::new(
            "x",
            io::Error::from(io::ErrorKind::PermissionDenied),
        ));
        let mut change = SkippedChange {
            from: Side::A,
            kind: ChangeKind::Delete,
            path: Path::new("x"),
            reason: &denied,
        };
        assert!(change.is_benign());

        change.kind = ChangeKind::Update;
        assert!(!change.is_benign());

        let missing = SkipReason::Error(ItemError::new("x", io::Error::from(io::ErrorKind::NotFound)));
        change.kind = ChangeKind::Delete;
        change.reason = &missing;
        assert!(!change.is_benign());
    }
}
