use crate::cli::{parse_duration, Cli};
use crate::error::SyncError;
use crate::filter::FilterEngine;
use crate::sync::SyncOptions;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "duosync.toml";

const DEFAULT_SETTLE: Duration = Duration::from_secs(1);
const DEFAULT_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Optional settings read from `duosync.toml`; the command line wins
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub replica_a: Option<PathBuf>,
    pub replica_b: Option<PathBuf>,
    #[serde(default)]
    pub exclude: Vec<String>,
    pub exclude_from: Option<PathBuf>,
    pub interval: Option<String>,
    pub settle: Option<String>,
    pub recycle_deleted: Option<bool>,
    pub recycle_updated: Option<bool>,
    pub tombstone_retention: Option<String>,
    pub recycle_dir: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

/// Everything the engine and orchestrator need, resolved and validated
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub replica_a: PathBuf,
    pub replica_b: PathBuf,
    pub work_dir: PathBuf,
    pub recycle_dir: PathBuf,
    pub filter: FilterEngine,
    pub options: SyncOptions,
    pub settle: Duration,
    pub interval: Duration,
    pub max_cycles: Option<u64>,
}

impl SyncConfig {
    /// Defaults for a pair of replicas sharing `work_dir`
    pub fn for_replicas(replica_a: &Path, replica_b: &Path, work_dir: &Path) -> Self {
        Self {
            replica_a: replica_a.to_path_buf(),
            replica_b: replica_b.to_path_buf(),
            work_dir: work_dir.to_path_buf(),
            recycle_dir: work_dir.join("recycle"),
            filter: FilterEngine::new(),
            options: SyncOptions::default(),
            settle: DEFAULT_SETTLE,
            interval: DEFAULT_INTERVAL,
            max_cycles: None,
        }
    }

    /// Merge command line and config file, then validate the result
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let work_dir = cli.work_dir.clone().unwrap_or_else(default_work_dir);

        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => {
                let implicit = work_dir.join(CONFIG_FILE_NAME);
                if implicit.is_file() {
                    tracing::debug!("Using config file {}", implicit.display());
                    FileConfig::load(&implicit)?
                } else {
                    FileConfig::default()
                }
            }
        };

        let replica_a = cli.replica_a.clone().or(file.replica_a).ok_or_else(|| {
            SyncError::Config("Replica A is required (argument or `replica_a` in the config file)".into())
        })?;
        let replica_b = cli.replica_b.clone().or(file.replica_b).ok_or_else(|| {
            SyncError::Config("Replica B is required (argument or `replica_b` in the config file)".into())
        })?;

        let replica_a = canonical_replica(&replica_a)?;
        let replica_b = canonical_replica(&replica_b)?;
        check_pair(&replica_a, &replica_b)?;

        fs::create_dir_all(&work_dir)
            .with_context(|| format!("Failed to create work directory: {}", work_dir.display()))?;
        let work_dir = work_dir.canonicalize()?;

        let recycle_dir = cli
            .recycle_dir
            .clone()
            .or(file.recycle_dir)
            .unwrap_or_else(|| work_dir.join("recycle"));
        fs::create_dir_all(&recycle_dir)
            .with_context(|| format!("Failed to create recycle directory: {}", recycle_dir.display()))?;
        let recycle_dir = recycle_dir.canonicalize()?;

        let mut filter = FilterEngine::from_patterns(&file.exclude)?;
        for pattern in &cli.exclude {
            for part in pattern.split(';') {
                filter.add_rule(part)?;
            }
        }
        for path in file.exclude_from.iter().chain(cli.exclude_from.iter()) {
            filter.add_rules_from_file(path)?;
        }

        let settle = pick_duration(cli.settle, file.settle.as_deref(), "settle")?.unwrap_or(DEFAULT_SETTLE);
        let interval = pick_duration(cli.interval, file.interval.as_deref(), "interval")?.unwrap_or(DEFAULT_INTERVAL);

        let tombstone_retention = match pick_duration(
            cli.tombstone_retention,
            file.tombstone_retention.as_deref(),
            "tombstone_retention",
        )? {
            Some(retention) => chrono::Duration::from_std(retention)
                .map_err(|e| SyncError::Config(format!("tombstone_retention out of range: {}", e)))?,
            None => SyncOptions::default().tombstone_retention,
        };
        let options = SyncOptions {
            recycle_deleted: !cli.no_recycle_deleted && file.recycle_deleted.unwrap_or(true),
            recycle_updated: !cli.no_recycle_updated && file.recycle_updated.unwrap_or(true),
            tombstone_retention,
        };

        Ok(Self {
            replica_a,
            replica_b,
            work_dir,
            recycle_dir,
            filter,
            options,
            settle,
            interval,
            max_cycles: cli.cycles,
        })
    }
}

/// `$DUOSYNC_WORK_DIR` is handled by clap; this is the per-user data directory
pub fn default_work_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("duosync"))
        .unwrap_or_else(|| PathBuf::from(".duosync"))
}

fn canonical_replica(path: &Path) -> std::result::Result<PathBuf, SyncError> {
    match path.canonicalize() {
        Ok(canonical) if canonical.is_dir() => Ok(canonical),
        _ => Err(SyncError::ReplicaNotFound {
            path: path.to_path_buf(),
        }),
    }
}

/// Replicas must be two distinct, non-nested directories
fn check_pair(a: &Path, b: &Path) -> std::result::Result<(), SyncError> {
    if a == b {
        return Err(SyncError::Config(format!(
            "Both replicas point to {}",
            a.display()
        )));
    }
    if a.starts_with(b) || b.starts_with(a) {
        return Err(SyncError::Config(format!(
            "Replicas must not be nested: {} and {}",
            a.display(),
            b.display()
        )));
    }
    Ok(())
}

fn pick_duration(cli: Option<Duration>, file: Option<&str>, key: &str) -> Result<Option<Duration>> {
    if cli.is_some() {
        return Ok(cli);
    }
    file.map(|s| {
        parse_duration(s).map_err(|e| anyhow::Error::from(SyncError::Config(format!("{}: {}", key, e))))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    struct Dirs {
        a: TempDir,
        b: TempDir,
        work: TempDir,
    }

    impl Dirs {
        fn new() -> Self {
            Self {
                a: TempDir::new().unwrap(),
                b: TempDir::new().unwrap(),
                work: TempDir::new().unwrap(),
            }
        }

        fn cli(&self, extra: &[&str]) -> Cli {
            let mut args = vec![
                "duosync".to_string(),
                "--work-dir".to_string(),
                self.work.path().display().to_string(),
            ];
            args.extend(extra.iter().map(|s| s.to_string()));
            Cli::try_parse_from(args).unwrap()
        }

        fn a(&self) -> String {
            self.a.path().display().to_string()
        }

        fn b(&self) -> String {
            self.b.path().display().to_string()
        }
    }

    #[test]
    fn test_resolve_defaults() {
        let dirs = Dirs::new();
        let config = SyncConfig::resolve(&dirs.cli(&[&dirs.a(), &dirs.b()])).unwrap();

        assert_eq!(config.replica_a, dirs.a.path().canonicalize().unwrap());
        assert_eq!(config.settle, Duration::from_secs(1));
        assert_eq!(config.interval, Duration::from_secs(900));
        assert!(config.options.recycle_deleted);
        assert!(config.recycle_dir.ends_with("recycle"));
        assert!(config.recycle_dir.is_dir());
        assert!(config.filter.is_empty());
        assert_eq!(config.max_cycles, None);
    }

    #[test]
    fn test_missing_replica_is_rejected() {
        let dirs = Dirs::new();
        let missing = dirs.work.path().join("nope").display().to_string();
        let err = SyncConfig::resolve(&dirs.cli(&[&dirs.a(), &missing])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::ReplicaNotFound { .. })
        ));
    }

    #[test]
    fn test_same_or_nested_replicas_are_rejected() {
        let dirs = Dirs::new();
        assert!(SyncConfig::resolve(&dirs.cli(&[&dirs.a(), &dirs.a()])).is_err());

        let inner = dirs.a.path().join("inner");
        fs::create_dir(&inner).unwrap();
        let inner = inner.display().to_string();
        assert!(SyncConfig::resolve(&dirs.cli(&[&dirs.a(), &inner])).is_err());
    }

    #[test]
    fn test_config_file_fills_gaps_and_cli_wins() {
        let dirs = Dirs::new();
        let toml = format!(
            r#"
replica_a = "{}"
replica_b = "{}"
exclude = ["*.mdb", "*.jpg"]
interval = "5m"
settle = "2s"
recycle_updated = false
tombstone_retention = "7d"
"#,
            dirs.a().replace('\\', "\\\\"),
            dirs.b().replace('\\', "\\\\")
        );
        fs::write(dirs.work.path().join(CONFIG_FILE_NAME), toml).unwrap();

        let config = SyncConfig::resolve(&dirs.cli(&["--settle", "0s", "-e", "*.tmp"])).unwrap();

        assert_eq!(config.replica_b, dirs.b.path().canonicalize().unwrap());
        assert_eq!(config.interval, Duration::from_secs(300));
        assert_eq!(config.settle, Duration::ZERO);
        assert!(!config.options.recycle_updated);
        assert!(config.options.recycle_deleted);
        assert_eq!(config.options.tombstone_retention, chrono::Duration::days(7));
        assert_eq!(config.filter.rule_count(), 3);
        assert!(config.filter.is_excluded(Path::new("Photo.JPG"), false));
    }

    #[test]
    fn test_recycle_flags_and_retention_from_cli() {
        let dirs = Dirs::new();
        let config = SyncConfig::resolve(&dirs.cli(&[&dirs.a(), &dirs.b(), "--no-recycle-deleted"])).unwrap();
        assert!(!config.options.recycle_deleted);
        assert!(config.options.recycle_updated);
        assert_eq!(config.options.tombstone_retention, chrono::Duration::days(30));

        let config = SyncConfig::resolve(&dirs.cli(&[
            &dirs.a(),
            &dirs.b(),
            "--no-recycle-updated",
            "--tombstone-retention",
            "2d",
        ]))
        .unwrap();
        assert!(config.options.recycle_deleted);
        assert!(!config.options.recycle_updated);
        assert_eq!(config.options.tombstone_retention, chrono::Duration::days(2));
    }

    #[test]
    fn test_bad_config_file_is_an_error() {
        let dirs = Dirs::new();
        let path = dirs.work.path().join("custom.toml");
        fs::write(&path, "interval = [not toml").unwrap();
        let path = path.display().to_string();

        assert!(SyncConfig::resolve(&dirs.cli(&["--config", &path, &dirs.a(), &dirs.b()])).is_err());
    }

    #[test]
    fn test_semicolon_separated_excludes() {
        let dirs = Dirs::new();
        let config = SyncConfig::resolve(&dirs.cli(&[&dirs.a(), &dirs.b(), "-e", "*.mdb;*.jpg;"])).unwrap();
        assert_eq!(config.filter.rule_count(), 2);
    }
}
