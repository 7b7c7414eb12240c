pub mod applier;
pub mod change;
pub mod detector;
pub mod output;
pub mod recycle;
pub mod scanner;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::filter::FilterEngine;
use crate::store::{MetadataStore, ReplicaId};
use applier::{ApplyContext, ApplyReport, Applier};
use change::ChangeEntry;
use detector::Detector;
use output::SyncObserver;
use recycle::RecycleBin;
use scanner::Scanner;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    /// File-name stem for this replica's state in the work directory
    pub fn label(self) -> &'static str {
        match self {
            Side::A => "replica_a",
            Side::B => "replica_b",
        }
    }

    /// Direction of changes detected on this side
    pub fn arrow(self) -> &'static str {
        match self {
            Side::A => "A→B",
            Side::B => "B→A",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Move deleted files to the recycle area instead of removing them
    pub recycle_deleted: bool,
    /// Keep the previous content of cleanly overwritten files
    pub recycle_updated: bool,
    pub tombstone_retention: chrono::Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            recycle_deleted: true,
            recycle_updated: true,
            tombstone_retention: chrono::Duration::days(30),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleStats {
    pub cycle: u64,
    pub detected: usize,
    pub applied: usize,
    pub conflicts: usize,
    pub up_to_date: usize,
    pub filtered: usize,
    pub superseded: usize,
    pub errors: usize,
    pub benign: usize,
    /// Entries carried over to the next cycle
    pub pending: usize,
    pub bytes_copied: u64,
    pub duration_secs: f64,
    pub interrupted: bool,
}

impl CycleStats {
    fn absorb(&mut self, report: &ApplyReport) {
        self.applied += report.applied;
        self.conflicts += report.conflicts;
        self.up_to_date += report.up_to_date;
        self.filtered += report.filtered;
        self.superseded += report.superseded;
        self.errors += report.errors;
        self.benign += report.benign;
        self.bytes_copied += report.bytes_copied;
        self.interrupted |= report.interrupted;
    }

    /// Nothing happened worth a summary line
    pub fn is_quiet(&self) -> bool {
        self.detected == 0 && self.applied == 0 && self.errors == 0 && self.conflicts == 0
    }
}

struct Replica {
    side: Side,
    root: PathBuf,
    id_path: PathBuf,
    store_path: PathBuf,
    pending_path: PathBuf,
    store: Option<MetadataStore>,
    /// Changes detected on this replica, not yet applied to the other
    pending: Vec<ChangeEntry>,
    recycle: RecycleBin,
    /// Detected successfully in the current cycle
    ready: bool,
}

impl Replica {
    fn new(side: Side, root: &Path, work_dir: &Path, recycle_dir: &Path) -> Self {
        let label = side.label();
        Self {
            side,
            root: root.to_path_buf(),
            id_path: work_dir.join(format!("{}.id", label)),
            store_path: work_dir.join(format!("{}.metadata.json", label)),
            pending_path: work_dir.join(format!("{}.pending.json", label)),
            store: None,
            pending: Vec::new(),
            recycle: RecycleBin::new(recycle_dir, label),
            ready: false,
        }
    }

    /// Load identity, store and pending queue on first use (or after a
    /// failed load)
    fn ensure_loaded(&mut self) -> Result<&mut MetadataStore> {
        if let Some(store) = self.store.take() {
            return Ok(self.store.insert(store));
        }

        let replica = ReplicaId::load_or_create(&self.id_path, &self.store_path)?;
        let store = MetadataStore::load(&self.store_path, replica, &self.root)?;
        self.pending = change::load_pending(&self.pending_path).unwrap_or_else(|e| {
            tracing::warn!("{}; starting with an empty queue", e);
            Vec::new()
        });
        if store.is_empty() {
            tracing::info!("Replica {} ({}): id {}, first scan", self.side.label(), self.root.display(), replica);
        } else {
            tracing::info!(
                "Replica {} ({}): id {}, {} tracked files ({} records), {} pending changes",
                self.side.label(),
                self.root.display(),
                replica,
                store.live_count(),
                store.len(),
                self.pending.len()
            );
        }
        tracing::debug!("Displaced files from {} go to {}", self.side.label(), self.recycle.dir().display());
        Ok(self.store.insert(store))
    }

    fn save(&self) -> Result<()> {
        change::save_pending(&self.pending_path, &self.pending)?;
        if let Some(store) = &self.store {
            store.save(&self.store_path)?;
        }
        Ok(())
    }
}

/// Owns both replicas, their stores and pending queues; runs one phase at a
/// time
pub struct SyncEngine {
    a: Replica,
    b: Replica,
    filter: FilterEngine,
    options: SyncOptions,
    skip: Vec<PathBuf>,
    observer: Box<dyn SyncObserver>,
    shutdown: Arc<AtomicBool>,
    cycle: u64,
    stats: CycleStats,
    started: Instant,
}

impl SyncEngine {
    pub fn new(config: &SyncConfig, observer: Box<dyn SyncObserver>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            a: Replica::new(Side::A, &config.replica_a, &config.work_dir, &config.recycle_dir),
            b: Replica::new(Side::B, &config.replica_b, &config.work_dir, &config.recycle_dir),
            filter: config.filter.clone(),
            options: config.options.clone(),
            skip: vec![config.work_dir.clone(), config.recycle_dir.clone()],
            observer,
            shutdown,
            cycle: 0,
            stats: CycleStats::default(),
            started: Instant::now(),
        }
    }

    fn replica_mut(&mut self, side: Side) -> &mut Replica {
        match side {
            Side::A => &mut self.a,
            Side::B => &mut self.b,
        }
    }

    pub fn begin_cycle(&mut self) -> u64 {
        self.cycle += 1;
        self.a.ready = false;
        self.b.ready = false;
        self.stats = CycleStats {
            cycle: self.cycle,
            ..CycleStats::default()
        };
        self.started = Instant::now();
        self.cycle
    }

    /// Scan one replica and queue its changes for the other side
    pub fn detect(&mut self, side: Side) -> Result<usize> {
        let mut scanner = Scanner::new(self.replica_mut(side).root.clone(), self.filter.clone());
        for path in &self.skip {
            scanner = scanner.skip_path(path.clone());
        }
        let retention = self.options.tombstone_retention;

        let replica = self.replica_mut(side);
        let store = replica.ensure_loaded()?;
        let changes = Detector::new(&scanner, retention).detect(store)?;
        let found = changes.len();

        let carried = std::mem::take(&mut replica.pending);
        replica.pending = change::merge_retries(changes, carried);
        replica.save()?;
        replica.ready = true;

        tracing::info!(
            "Detected {} changes on {} ({} queued for {})",
            found,
            side.label(),
            replica.pending.len(),
            side.other().label()
        );
        self.stats.detected += found;
        Ok(found)
    }

    /// Apply the changes queued on `from` to the other replica
    pub fn apply(&mut self, from: Side) -> Result<ApplyReport> {
        let (source, dest) = match from {
            Side::A => (&mut self.a, &mut self.b),
            Side::B => (&mut self.b, &mut self.a),
        };

        if !(source.ready && dest.ready) {
            tracing::warn!(
                "Skipping {}: a replica was unavailable this cycle; {} changes stay queued",
                from.arrow(),
                source.pending.len()
            );
            return Ok(ApplyReport::default());
        }

        let entries = std::mem::take(&mut source.pending);
        let count = entries.len();
        let (Some(source_store), Some(dest_store)) = (source.store.as_ref(), dest.store.as_mut()) else {
            source.pending = entries;
            return Ok(ApplyReport::default());
        };

        let ctx = ApplyContext {
            filter: &self.filter,
            recycle: &dest.recycle,
            options: &self.options,
            shutdown: &self.shutdown,
        };
        let mut report = Applier::new(
            from,
            (&source.root, source_store),
            (&dest.root, dest_store),
            ctx,
        )
        .apply(entries, self.observer.as_mut());

        source.pending = std::mem::take(&mut report.retry);
        let carried = source.pending.len();
        dest.save()?;
        source.save()?;

        tracing::info!(
            "{}: {} of {} changes applied, {} conflicts, {} errors, {} deferred",
            from.arrow(),
            report.applied,
            count,
            report.conflicts,
            report.errors,
            carried
        );
        self.stats.absorb(&report);
        Ok(report)
    }

    pub fn finish_cycle(&mut self) -> CycleStats {
        self.stats.pending = self.a.pending.len() + self.b.pending.len();
        self.stats.duration_secs = self.started.elapsed().as_secs_f64();
        let stats = self.stats.clone();

        tracing::info!(
            "Cycle {} complete: {} detected, {} applied, {} conflicts, {} errors ({} benign), {} pending, {:.2}s",
            stats.cycle,
            stats.detected,
            stats.applied,
            stats.conflicts,
            stats.errors,
            stats.benign,
            stats.pending,
            stats.duration_secs
        );
        self.observer.cycle_finished(&stats);
        stats
    }

    /// Run a whole cycle without pauses
    #[cfg(test)]
    pub fn run_cycle(&mut self) -> CycleStats {
        self.begin_cycle();
        let a = self.detect(Side::A);
        let b = self.detect(Side::B);
        if a.is_ok() && b.is_ok() {
            self.apply(Side::A).unwrap();
            self.apply(Side::B).unwrap();
        }
        self.finish_cycle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::output::{AppliedChange, SkippedChange};
    use filetime::FileTime;
    use std::fs;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Silent;

    impl SyncObserver for Silent {
        fn applied(&mut self, _change: &AppliedChange<'_>) {}
        fn skipped(&mut self, _change: &SkippedChange<'_>) {}
    }

    struct Counting(Arc<Mutex<Vec<String>>>);

    impl SyncObserver for Counting {
        fn applied(&mut self, change: &AppliedChange<'_>) {
            self.0
                .lock()
                .unwrap()
                .push(format!("{} {}", change.kind, change.path().display()));
        }
        fn skipped(&mut self, _change: &SkippedChange<'_>) {}
    }

    struct Setup {
        a: TempDir,
        b: TempDir,
        work: TempDir,
    }

    impl Setup {
        fn new() -> Self {
            Self {
                a: TempDir::new().unwrap(),
                b: TempDir::new().unwrap(),
                work: TempDir::new().unwrap(),
            }
        }

        fn config(&self) -> SyncConfig {
            SyncConfig::for_replicas(self.a.path(), self.b.path(), self.work.path())
        }

        fn engine(&self) -> SyncEngine {
            SyncEngine::new(&self.config(), Box::new(Silent), Arc::new(AtomicBool::new(false)))
        }

        fn recycled(&self, side: Side) -> Vec<PathBuf> {
            let mut found = Vec::new();
            let dir = self.work.path().join("recycle").join(side.label());
            for entry in ignore::WalkBuilder::new(&dir).build().flatten() {
                if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    found.push(entry.path().to_path_buf());
                }
            }
            found
        }
    }

    fn live_paths(root: &Path) -> Vec<String> {
        let scan = Scanner::new(root, FilterEngine::new()).scan().unwrap();
        scan.entries
            .iter()
            .map(|e| e.relative_path.to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn test_notes_scenario() {
        let setup = Setup::new();
        let mut engine = setup.engine();
        fs::write(setup.a.path().join("notes.txt"), "v1").unwrap();

        engine.run_cycle();
        assert_eq!(fs::read_to_string(setup.b.path().join("notes.txt")).unwrap(), "v1");

        fs::remove_file(setup.a.path().join("notes.txt")).unwrap();
        engine.run_cycle();

        assert!(!setup.b.path().join("notes.txt").exists());
        let recycled = setup.recycled(Side::B);
        assert_eq!(recycled.len(), 1);
        assert!(recycled[0].ends_with("notes.txt"));
        assert_eq!(fs::read_to_string(&recycled[0]).unwrap(), "v1");
    }

    #[test]
    fn test_bidirectional_convergence() {
        let setup = Setup::new();
        let mut engine = setup.engine();
        fs::create_dir_all(setup.a.path().join("photos/2024")).unwrap();
        fs::write(setup.a.path().join("photos/2024/cat.jpg"), "meow").unwrap();
        fs::write(setup.b.path().join("todo.md"), "- sync").unwrap();
        fs::write(setup.b.path().join("empty"), "").unwrap();

        let stats = engine.run_cycle();
        assert_eq!(stats.detected, 3);
        assert_eq!(stats.applied, 3);

        assert_eq!(live_paths(setup.a.path()), live_paths(setup.b.path()));
        assert_eq!(live_paths(setup.a.path()), vec!["empty", "photos/2024/cat.jpg", "todo.md"]);

        let stats = engine.run_cycle();
        assert_eq!(stats.detected, 0);
        assert_eq!(stats.applied, 0);
    }

    #[test]
    fn test_rename_keeps_destination_history() {
        let setup = Setup::new();
        let mut engine = setup.engine();
        fs::write(setup.a.path().join("a.txt"), "unchanged bytes").unwrap();
        engine.run_cycle();

        let store_b = |engine: &SyncEngine| engine.b.store.clone().unwrap();
        let before = store_b(&engine).live_at(Path::new("a.txt")).unwrap().clone();

        fs::rename(setup.a.path().join("a.txt"), setup.a.path().join("b.txt")).unwrap();
        let stats = engine.run_cycle();

        assert_eq!(stats.detected, 1);
        let after = store_b(&engine).get_live(&before.item_id).unwrap().clone();
        assert_eq!(after.path, PathBuf::from("b.txt"));
        assert_eq!(after.version, before.version + 1);
        assert!(setup.recycled(Side::B).is_empty());
    }

    #[test]
    fn test_concurrent_edits_later_timestamp_wins() {
        let setup = Setup::new();
        let mut engine = setup.engine();
        fs::write(setup.a.path().join("plan.txt"), "base").unwrap();
        engine.run_cycle();

        fs::write(setup.a.path().join("plan.txt"), "A's later edit").unwrap();
        filetime::set_file_mtime(setup.a.path().join("plan.txt"), FileTime::from_unix_time(2_000_000_000, 0)).unwrap();
        fs::write(setup.b.path().join("plan.txt"), "B's edit").unwrap();
        filetime::set_file_mtime(setup.b.path().join("plan.txt"), FileTime::from_unix_time(1_900_000_000, 0)).unwrap();

        let stats = engine.run_cycle();

        for root in [setup.a.path(), setup.b.path()] {
            assert_eq!(fs::read_to_string(root.join("plan.txt")).unwrap(), "A's later edit");
        }
        // B's own edit is superseded once A's version lands there
        assert_eq!(stats.conflicts, 1);
        assert_eq!(stats.superseded, 1);
        let recycled = setup.recycled(Side::B);
        assert_eq!(recycled.len(), 1);
        assert_eq!(fs::read_to_string(&recycled[0]).unwrap(), "B's edit");
    }

    #[test]
    fn test_state_survives_restart() {
        let setup = Setup::new();
        fs::write(setup.a.path().join("kept.txt"), "k").unwrap();
        setup.engine().run_cycle();

        let mut restarted = setup.engine();
        let stats = restarted.run_cycle();
        assert_eq!(stats.detected, 0);

        assert!(setup.work.path().join("replica_a.id").exists());
        assert!(setup.work.path().join("replica_b.metadata.json").exists());
    }

    #[test]
    fn test_unavailable_replica_keeps_changes_queued() {
        let setup = Setup::new();
        let mut config = setup.config();
        let events = Arc::new(Mutex::new(Vec::new()));
        fs::write(setup.a.path().join("waiting.txt"), "w").unwrap();

        let missing = setup.work.path().join("unmounted");
        config.replica_b = missing.clone();
        let mut engine = SyncEngine::new(&config, Box::new(Counting(events.clone())), Arc::new(AtomicBool::new(false)));

        engine.begin_cycle();
        assert_eq!(engine.detect(Side::A).unwrap(), 1);
        assert!(engine.detect(Side::B).is_err());
        engine.apply(Side::A).unwrap();
        engine.apply(Side::B).unwrap();
        let stats = engine.finish_cycle();
        assert_eq!(stats.pending, 1);
        assert!(events.lock().unwrap().is_empty());

        // The replica comes back
        fs::create_dir(&missing).unwrap();
        engine.begin_cycle();
        engine.detect(Side::A).unwrap();
        engine.detect(Side::B).unwrap();
        engine.apply(Side::A).unwrap();
        engine.apply(Side::B).unwrap();
        engine.finish_cycle();

        assert_eq!(fs::read_to_string(missing.join("waiting.txt")).unwrap(), "w");
        assert_eq!(events.lock().unwrap().clone(), vec!["create waiting.txt"]);
    }

    /// Replica B lives under the work dir so it can be unplugged and
    /// plugged back in between cycles
    struct Removable {
        setup: Setup,
        mounted: PathBuf,
        parked: PathBuf,
    }

    impl Removable {
        fn new() -> Self {
            let setup = Setup::new();
            let mounted = setup.b.path().join("mount");
            let parked = setup.b.path().join("parked");
            fs::create_dir(&mounted).unwrap();
            Self { setup, mounted, parked }
        }

        fn engine(&self) -> SyncEngine {
            let mut config = self.setup.config();
            config.replica_b = self.mounted.clone();
            SyncEngine::new(&config, Box::new(Silent), Arc::new(AtomicBool::new(false)))
        }

        fn unplug(&self) {
            fs::rename(&self.mounted, &self.parked).unwrap();
        }

        fn plug(&self) {
            fs::rename(&self.parked, &self.mounted).unwrap();
        }
    }

    #[test]
    fn test_offline_edit_then_delete_converges() {
        let removable = Removable::new();
        let a = removable.setup.a.path().to_path_buf();
        let mut engine = removable.engine();
        fs::write(a.join("x.txt"), "v1").unwrap();
        engine.run_cycle();
        assert!(removable.mounted.join("x.txt").exists());

        removable.unplug();
        fs::write(a.join("x.txt"), "v2, edited while b was away").unwrap();
        engine.run_cycle();
        fs::remove_file(a.join("x.txt")).unwrap();
        engine.run_cycle();
        removable.plug();

        let mut last = CycleStats::default();
        for _ in 0..3 {
            last = engine.run_cycle();
        }

        assert_eq!(last.conflicts, 0);
        assert_eq!(last.pending, 0);
        assert!(live_paths(&a).is_empty());
        assert!(live_paths(&removable.mounted).is_empty());
    }

    #[test]
    fn test_offline_rename_chain_converges() {
        let removable = Removable::new();
        let a = removable.setup.a.path().to_path_buf();
        let mut engine = removable.engine();
        fs::write(a.join("a.txt"), "moving").unwrap();
        engine.run_cycle();

        removable.unplug();
        fs::rename(a.join("a.txt"), a.join("m.txt")).unwrap();
        engine.run_cycle();
        fs::rename(a.join("m.txt"), a.join("z.txt")).unwrap();
        engine.run_cycle();
        removable.plug();

        for _ in 0..3 {
            engine.run_cycle();
        }

        assert_eq!(live_paths(&a), vec!["z.txt"]);
        assert_eq!(live_paths(&removable.mounted), vec!["z.txt"]);
        assert_eq!(fs::read_to_string(removable.mounted.join("z.txt")).unwrap(), "moving");
        assert!(removable.setup.recycled(Side::B).is_empty());
    }

    #[test]
    fn test_pending_changes_survive_shutdown() {
        let setup = Setup::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        fs::write(setup.a.path().join("late.txt"), "l").unwrap();

        let mut engine = SyncEngine::new(&setup.config(), Box::new(Silent), shutdown.clone());
        engine.begin_cycle();
        engine.detect(Side::A).unwrap();
        engine.detect(Side::B).unwrap();
        shutdown.store(true, Ordering::SeqCst);
        let report = engine.apply(Side::A).unwrap();
        assert!(report.interrupted);
        drop(engine);

        assert!(setup.work.path().join("replica_a.pending.json").exists());
        assert!(!setup.b.path().join("late.txt").exists());

        // Next run picks the change up although A's scan finds nothing new
        let mut engine = setup.engine();
        let stats = engine.run_cycle();
        assert_eq!(stats.detected, 0);
        assert_eq!(stats.applied, 1);
        assert!(setup.b.path().join("late.txt").exists());
        assert!(!setup.work.path().join("replica_a.pending.json").exists());
    }

    #[test]
    fn test_work_dir_inside_replica_is_not_synced() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let work = a.path().join(".duosync");
        fs::write(a.path().join("real.txt"), "r").unwrap();

        let config = SyncConfig::for_replicas(a.path(), b.path(), &work);
        let mut engine = SyncEngine::new(&config, Box::new(Silent), Arc::new(AtomicBool::new(false)));
        engine.run_cycle();
        engine.run_cycle();

        assert_eq!(live_paths(b.path()), vec!["real.txt"]);
    }
}
