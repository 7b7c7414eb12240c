use crate::config::SyncConfig;
use crate::sync::{CycleStats, Side, SyncEngine};
use anyhow::anyhow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Where the sync loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    DetectingA,
    DetectingB,
    ApplyingAtoB,
    PauseShort,
    ApplyingBtoA,
    PauseLong,
}

impl Phase {
    /// Successor when the current phase completes normally
    pub fn next(self) -> Phase {
        match self {
            Phase::Idle => Phase::DetectingA,
            Phase::DetectingA => Phase::DetectingB,
            Phase::DetectingB => Phase::ApplyingAtoB,
            Phase::ApplyingAtoB => Phase::PauseShort,
            Phase::PauseShort => Phase::ApplyingBtoA,
            Phase::ApplyingBtoA => Phase::PauseLong,
            Phase::PauseLong => Phase::Idle,
        }
    }

    /// Between `begin_cycle` and `finish_cycle`
    pub fn in_cycle(self) -> bool {
        !matches!(self, Phase::Idle | Phase::PauseLong)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::DetectingA => "detecting A",
            Phase::DetectingB => "detecting B",
            Phase::ApplyingAtoB => "applying A→B",
            Phase::PauseShort => "settling",
            Phase::ApplyingBtoA => "applying B→A",
            Phase::PauseLong => "waiting",
        }
    }
}

/// Shutdown request shared between the signal handler, the engine and the
/// pauses
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Flag polled by the engine between items
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    pub async fn wait(&self) {
        while !self.is_requested() {
            self.notify.notified().await;
        }
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub cycles: u64,
    /// Cycles abandoned after an error or panic
    pub faults: u64,
    pub last: Option<CycleStats>,
}

/// Drives a [`SyncEngine`] through the phase loop until shutdown or the
/// cycle limit
pub struct Orchestrator {
    engine: Arc<Mutex<SyncEngine>>,
    settle: Duration,
    interval: Duration,
    max_cycles: Option<u64>,
    shutdown: Shutdown,
    phase: Phase,
}

impl Orchestrator {
    pub fn new(engine: SyncEngine, config: &SyncConfig, shutdown: Shutdown) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            settle: config.settle,
            interval: config.interval,
            max_cycles: config.max_cycles,
            shutdown,
            phase: Phase::Idle,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub async fn run(mut self) -> RunReport {
        let mut report = RunReport::default();

        loop {
            if self.shutdown.is_requested() {
                if self.phase.in_cycle() {
                    report.last = self.finish_cycle().await;
                    report.cycles += 1;
                }
                tracing::info!("Shutdown requested, stopping");
                break;
            }

            tracing::debug!("Phase: {}", self.phase.as_str());
            let outcome = match self.phase {
                Phase::Idle => self.run_phase(|engine| Ok(engine.begin_cycle())).await.map(|cycle| {
                    tracing::info!("Starting cycle {}", cycle);
                }),
                Phase::DetectingA => self.detect(Side::A).await,
                Phase::DetectingB => self.detect(Side::B).await,
                Phase::ApplyingAtoB => self.run_phase(|engine| engine.apply(Side::A)).await.map(drop),
                Phase::PauseShort => {
                    self.pause(self.settle).await;
                    Ok(())
                }
                Phase::ApplyingBtoA => self.run_phase(|engine| engine.apply(Side::B)).await.map(drop),
                Phase::PauseLong => {
                    self.pause(self.interval).await;
                    Ok(())
                }
            };

            let next = match outcome {
                Ok(()) => self.phase.next(),
                Err(e) => {
                    tracing::error!("Cycle abandoned during {}: {:#}", self.phase.as_str(), e);
                    report.faults += 1;
                    Phase::PauseLong
                }
            };

            if next == Phase::PauseLong && self.phase != Phase::PauseLong {
                report.last = self.finish_cycle().await;
                report.cycles += 1;
                if self.max_cycles.is_some_and(|max| report.cycles >= max) {
                    tracing::debug!("Cycle limit reached");
                    break;
                }
            }
            self.phase = next;
        }

        report
    }

    /// A replica that fails to scan sits out the cycle; the other side still
    /// runs
    async fn detect(&self, side: Side) -> anyhow::Result<()> {
        let joined = self.run_blocking(move |engine| engine.detect(side)).await?;
        if let Err(e) = joined {
            tracing::warn!("Skipping {} this cycle: {}", side.label(), e);
        }
        Ok(())
    }

    async fn finish_cycle(&self) -> Option<CycleStats> {
        match self.run_phase(|engine| Ok(engine.finish_cycle())).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::error!("Failed to finish cycle: {:#}", e);
                None
            }
        }
    }

    /// Run one phase on the blocking pool; errors and panics come back as
    /// `Err`
    async fn run_phase<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SyncEngine) -> crate::error::Result<T> + Send + 'static,
    {
        Ok(self.run_blocking(f).await??)
    }

    async fn run_blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SyncEngine) -> T + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || {
            // A panicked phase leaves the engine usable; its stores are on disk
            let mut engine = engine.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut engine)
        })
        .await
        .map_err(|e| anyhow!("phase panicked: {}", e))
    }

    async fn pause(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.wait() => {
                tracing::debug!("Pause interrupted");
            }
        }
    }
}
