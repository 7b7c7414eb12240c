use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;

/// Parse a duration such as `500ms`, `30s`, `15m`, `2h`, `7d` or plain seconds
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim().to_lowercase();

    let (num_str, unit) = if let Some(pos) = s.find(|c: char| c.is_alphabetic()) {
        (&s[..pos], &s[pos..])
    } else {
        // No unit, assume seconds
        return s
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| format!("Invalid duration: {}", e));
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|e| format!("Invalid number '{}': {}", num_str, e))?;
    let seconds: f64 = match unit.trim() {
        "ms" => 0.001,
        "s" | "sec" => 1.0,
        "m" | "min" => 60.0,
        "h" => 3600.0,
        "d" => 86400.0,
        _ => return Err(format!("Unknown unit '{}'. Use ms, s, m, h, or d", unit)),
    };

    Duration::try_from_secs_f64(num * seconds).map_err(|e| format!("Invalid duration '{}': {}", s, e))
}

#[derive(Parser, Debug)]
#[command(name = "duosync")]
#[command(about = "Continuous two-way folder synchronization", long_about = None)]
#[command(version)]
#[command(after_help = "EXAMPLES:
    # Keep two folders in sync until Ctrl-C
    duosync /home/me/Documents /mnt/backup/Documents

    # Skip scratch files and a cache directory
    duosync ~/work /media/usb/work --exclude '*.tmp' --exclude 'cache/'

    # Sync every minute, settle 5 seconds between directions
    duosync ~/a ~/b --interval 1m --settle 5s

    # One pass, machine-readable output
    duosync ~/a ~/b --cycles 1 --json

    # Replica paths and options from <work dir>/duosync.toml
    duosync")]
pub struct Cli {
    /// First replica directory (or `replica_a` in the config file)
    pub replica_a: Option<PathBuf>,

    /// Second replica directory (or `replica_b` in the config file)
    pub replica_b: Option<PathBuf>,

    /// Exclude files matching pattern (can be repeated; `;` separates several)
    #[arg(short, long, value_name = "PATTERN")]
    pub exclude: Vec<String>,

    /// Read exclude patterns from file (one per line, # comments)
    #[arg(long, value_name = "FILE")]
    pub exclude_from: Option<PathBuf>,

    /// Config file (default: <work dir>/duosync.toml when present)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Where replica ids, metadata and the recycle area live
    #[arg(long, env = "DUOSYNC_WORK_DIR", value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Where displaced files go (default: <work dir>/recycle)
    #[arg(long, value_name = "DIR")]
    pub recycle_dir: Option<PathBuf>,

    /// Pause between cycles (default: 15m)
    #[arg(long, value_parser = parse_duration, value_name = "DURATION")]
    pub interval: Option<Duration>,

    /// Pause between the two directions of a cycle (default: 1s)
    #[arg(long, value_parser = parse_duration, value_name = "DURATION")]
    pub settle: Option<Duration>,

    /// Stop after N cycles (default: run until Ctrl-C)
    #[arg(long, value_name = "N")]
    pub cycles: Option<u64>,

    /// Remove deleted files instead of moving them to the recycle area
    #[arg(long)]
    pub no_recycle_deleted: bool,

    /// Don't keep the previous content of overwritten files
    #[arg(long)]
    pub no_recycle_updated: bool,

    /// How long deletion markers are remembered (default: 30d)
    #[arg(long, value_parser = parse_duration, value_name = "DURATION")]
    pub tombstone_retention: Option<Duration>,

    /// Output one JSON event per line
    #[arg(long)]
    pub json: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (only show errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl Cli {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.quiet && self.verbose > 0 {
            anyhow::bail!("--quiet and --verbose cannot be used together");
        }

        if self.cycles == Some(0) {
            anyhow::bail!("--cycles must be at least 1");
        }

        if self.replica_b.is_some() && self.replica_a.is_none() {
            anyhow::bail!("Replica B given without replica A");
        }

        if let Some(retention) = self.tombstone_retention {
            if retention.is_zero() {
                anyhow::bail!("--tombstone-retention must be greater than zero");
            }
        }

        Ok(())
    }

    pub fn log_level(&self) -> tracing::Level {
        if self.quiet || self.json {
            return tracing::Level::ERROR;
        }

        match self.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}
