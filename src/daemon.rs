// ABOUTME: SyncDaemon: runs sync cycles over the configured objects, once or on an interval
// ABOUTME: Guards each watermark key against overlapping runs and aborts cleanly on shutdown

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::Config;
use crate::planner::{RunSummary, SyncPlanner};
use crate::source::ObjectType;
use crate::watermark::watermark_key;

/// Configuration for the SyncDaemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Objects synced each cycle, in order
    pub objects: Vec<ObjectType>,
    /// Interval between sync cycles
    pub sync_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            objects: ObjectType::ALL.to_vec(),
            sync_interval: Duration::from_secs(300),
        }
    }
}

/// Statistics from a sync cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub runs: Vec<RunSummary>,
    /// Keys skipped because a run for them was already in flight
    pub skipped: Vec<String>,
    pub duration_ms: u64,
}

impl CycleStats {
    /// Check if every run of the cycle committed.
    pub fn is_success(&self) -> bool {
        self.runs.iter().all(RunSummary::is_success)
    }

    pub fn failed(&self) -> usize {
        self.runs.iter().filter(|r| !r.is_success()).count()
    }

    pub fn records_emitted(&self) -> u64 {
        self.runs.iter().map(|r| r.records_emitted).sum()
    }
}

/// Set of watermark keys with a run in progress.
#[derive(Debug, Default, Clone)]
pub struct InFlight {
    keys: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`; `None` if another run holds it. Released on drop.
    pub fn try_acquire(&self, key: &str) -> Option<InFlightGuard> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if !keys.insert(key.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            keys: self.keys.clone(),
            key: key.to_string(),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }
}

pub struct InFlightGuard {
    keys: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

/// SyncDaemon orchestrates repeated sync runs.
///
/// Objects within a cycle run one after another so they share the account's
/// rate-limit budget; a dropped cycle commits nothing for the run it interrupted.
pub struct SyncDaemon {
    planner: Arc<SyncPlanner>,
    settings: Arc<Config>,
    config: DaemonConfig,
    in_flight: InFlight,
}

impl SyncDaemon {
    pub fn new(planner: Arc<SyncPlanner>, settings: Arc<Config>, config: DaemonConfig) -> Self {
        Self {
            planner,
            settings,
            config,
            in_flight: InFlight::new(),
        }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Run one sync of every configured object.
    pub async fn run_cycle(&self) -> CycleStats {
        let start = std::time::Instant::now();
        let mut stats = CycleStats::default();

        for &object in &self.config.objects {
            let options = self.settings.options_for(object);
            let key = watermark_key(object, options.board_ids.as_deref());

            let Some(_guard) = self.in_flight.try_acquire(&key) else {
                tracing::warn!("Skipping {}: a run for '{}' is already in progress", object, key);
                stats.skipped.push(key);
                continue;
            };

            stats.runs.push(self.planner.run(object, &options).await);
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        stats
    }

    /// Run one cycle, aborting it if shutdown arrives first.
    pub async fn run_once(&self, mut shutdown: broadcast::Receiver<()>) -> Option<CycleStats> {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                tracing::info!("Shutdown signal received during sync cycle, aborting");
                None
            }
            stats = self.run_cycle() => Some(stats),
        }
    }

    /// Run cycles at the configured interval until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut sync_interval = interval(self.config.sync_interval);
        sync_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0u64;

        tracing::info!(
            "Starting SyncDaemon with sync_interval={:?} for {} object(s)",
            self.config.sync_interval,
            self.config.objects.len()
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping SyncDaemon");
                    break;
                }
                _ = sync_interval.tick() => {
                    cycles += 1;
                    tracing::info!("Starting sync cycle {}", cycles);

                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            tracing::info!("Shutdown signal received during sync cycle, aborting");
                            break;
                        }
                        stats = self.run_cycle() => {
                            tracing::info!(
                                "Sync cycle {} completed: {} run(s), {} record(s) in {}ms",
                                cycles,
                                stats.runs.len(),
                                stats.records_emitted(),
                                stats.duration_ms
                            );
                            if !stats.is_success() {
                                tracing::warn!("Sync cycle {} had {} failed run(s)", cycles, stats.failed());
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
