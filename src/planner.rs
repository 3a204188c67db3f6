// ABOUTME: Sync planner: decides snapshot vs incremental per run, drives fetch and emit, commits watermarks
// ABOUTME: A watermark is committed only after every record of the run was emitted and flushed

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, TryStreamExt};
use tracing::Instrument;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::ObjectOptions;
use crate::differ::{ActivityLogDiffer, DiffOutcome, DifferSettings};
use crate::error::{SyncError, SyncResult};
use crate::sink::Emitter;
use crate::source::{MondaySource, ObjectType, Record};
use crate::watermark::{watermark_key, SyncMode, Watermark, WatermarkStore};

/// Log a progress line every this many emitted records.
const PROGRESS_INTERVAL: u64 = 1000;

/// States a run moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    NoPriorWatermark,
    HasWatermark,
    DiffAttempt,
    FullSnapshot,
    Incremental,
    Committed,
    Failed,
}

impl RunPhase {
    pub fn can_transition_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        match (self, next) {
            (NoPriorWatermark, FullSnapshot) => true,
            // Snapshot-only objects skip the diff even with a watermark
            (HasWatermark, DiffAttempt) | (HasWatermark, FullSnapshot) => true,
            (DiffAttempt, Incremental) | (DiffAttempt, FullSnapshot) => true,
            (FullSnapshot, Committed) | (Incremental, Committed) => true,
            (Committed, _) | (Failed, _) => false,
            (_, Failed) => true,
            _ => false,
        }
    }
}

struct PhaseTracker {
    phase: RunPhase,
    history: Vec<RunPhase>,
}

impl PhaseTracker {
    fn start(has_watermark: bool) -> Self {
        let phase = if has_watermark {
            RunPhase::HasWatermark
        } else {
            RunPhase::NoPriorWatermark
        };
        tracing::debug!("Run phase: {:?}", phase);
        Self {
            phase,
            history: vec![phase],
        }
    }

    fn advance(&mut self, next: RunPhase) {
        if !self.phase.can_transition_to(next) {
            tracing::warn!("Unexpected run transition {:?} -> {:?}", self.phase, next);
        }
        tracing::debug!("Run phase: {:?} -> {:?}", self.phase, next);
        self.phase = next;
        self.history.push(next);
    }

    fn into_history(self) -> Vec<RunPhase> {
        self.history
    }
}

/// What a run is going to do. Computed fresh on every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub mode: SyncMode,
    /// `None` means every record; `Some(empty)` means nothing changed
    pub target_ids: Option<Vec<String>>,
    pub lookback: Duration,
    pub fallback_reason: Option<String>,
    /// Prior watermark the diff started from
    pub since: Option<DateTime<Utc>>,
}

impl SyncPlan {
    fn snapshot(lookback: Duration, fallback_reason: Option<String>) -> Self {
        Self {
            mode: SyncMode::FullSnapshot,
            target_ids: None,
            lookback,
            fallback_reason,
            since: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Committed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Committed => f.pad("COMMITTED"),
            RunStatus::Failed => f.pad("FAILED"),
        }
    }
}

/// Outcome of one run, returned whether or not it succeeded.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub object_type: ObjectType,
    pub watermark_key: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// `None` when the run failed before a mode was chosen
    pub mode_used: Option<SyncMode>,
    pub records_emitted: u64,
    /// Records dropped because the remote sent no usable id
    pub records_skipped: u64,
    /// Changed ids the remote no longer returned (deleted or inaccessible)
    pub ids_not_found: usize,
    pub fallback_reason: Option<String>,
    pub status: RunStatus,
    pub error: Option<String>,
    /// Phases the run went through, in order; empty if it failed before planning
    pub phases: Vec<RunPhase>,
}

impl RunSummary {
    fn new(object_type: ObjectType, watermark_key: String, run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            object_type,
            watermark_key,
            run_id,
            started_at,
            mode_used: None,
            records_emitted: 0,
            records_skipped: 0,
            ids_not_found: 0,
            fallback_reason: None,
            status: RunStatus::Failed,
            error: None,
            phases: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Committed
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = self
            .mode_used
            .map(|m| m.to_string())
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "{:<14} {:<10} {:<14} {:>8} records",
            self.object_type.as_str(),
            self.status,
            mode,
            self.records_emitted
        )?;
        if self.records_skipped > 0 {
            write!(f, ", {} without id skipped", self.records_skipped)?;
        }
        if self.ids_not_found > 0 {
            write!(f, ", {} id(s) not found", self.ids_not_found)?;
        }
        if let Some(reason) = &self.fallback_reason {
            write!(f, " (fallback: {})", reason)?;
        }
        if let Some(error) = &self.error {
            write!(f, " error: {}", error)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PlannerSettings {
    /// Subtracted from the prior watermark before reading the log
    pub lookback: Duration,
    pub differ: DifferSettings,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            lookback: Duration::from_secs(60),
            differ: DifferSettings::default(),
        }
    }
}

/// Orchestrates sync runs. Callers must not run the same watermark key twice
/// at once; [`crate::daemon::SyncDaemon`] enforces that.
pub struct SyncPlanner {
    source: Arc<MondaySource>,
    differ: ActivityLogDiffer,
    store: Arc<dyn WatermarkStore>,
    emitter: Arc<dyn Emitter>,
    clock: Arc<dyn Clock>,
    lookback: Duration,
}

impl SyncPlanner {
    pub fn new(
        source: Arc<MondaySource>,
        store: Arc<dyn WatermarkStore>,
        emitter: Arc<dyn Emitter>,
        clock: Arc<dyn Clock>,
        settings: PlannerSettings,
    ) -> Self {
        Self {
            source,
            differ: ActivityLogDiffer::new(clock.clone(), settings.differ),
            store,
            emitter,
            clock,
            lookback: settings.lookback,
        }
    }

    pub fn store(&self) -> &Arc<dyn WatermarkStore> {
        &self.store
    }

    /// Choose the mode for `object` given its prior watermark.
    ///
    /// Diff errors other than unavailability propagate; the run fails and the
    /// next run plans again from the same watermark.
    pub async fn plan(
        &self,
        object: ObjectType,
        boards: &[String],
        previous: Option<&Watermark>,
    ) -> SyncResult<SyncPlan> {
        let mut phase = PhaseTracker::start(previous.is_some());
        self.plan_phases(&mut phase, object, boards, previous).await
    }

    async fn plan_phases(
        &self,
        phase: &mut PhaseTracker,
        object: ObjectType,
        boards: &[String],
        previous: Option<&Watermark>,
    ) -> SyncResult<SyncPlan> {
        let previous = match previous {
            Some(previous) if object.supports_diff() => previous,
            Some(_) => {
                tracing::debug!("{} has no change log, taking a snapshot", object);
                phase.advance(RunPhase::FullSnapshot);
                return Ok(SyncPlan::snapshot(self.lookback, None));
            }
            None => {
                tracing::info!("No prior watermark for {}, taking a full snapshot", object);
                phase.advance(RunPhase::FullSnapshot);
                return Ok(SyncPlan::snapshot(self.lookback, None));
            }
        };

        phase.advance(RunPhase::DiffAttempt);
        let outcome = self
            .differ
            .diff(
                self.source.as_ref(),
                object,
                boards,
                previous.last_sync_timestamp,
                self.lookback,
            )
            .await?;

        match outcome {
            DiffOutcome::Changed(set) => {
                phase.advance(RunPhase::Incremental);
                Ok(SyncPlan {
                    mode: SyncMode::Incremental,
                    target_ids: Some(set.ids.into_iter().collect()),
                    lookback: self.lookback,
                    fallback_reason: None,
                    since: Some(previous.last_sync_timestamp),
                })
            }
            DiffOutcome::Unavailable(reason) => {
                tracing::warn!("Falling back to a full snapshot of {}: {}", object, reason);
                phase.advance(RunPhase::FullSnapshot);
                Ok(SyncPlan::snapshot(self.lookback, Some(reason)))
            }
        }
    }

    /// Run one sync of `object`. Never returns an error: failures are
    /// reported through the summary with the prior watermark left intact.
    pub async fn run(&self, object: ObjectType, options: &ObjectOptions) -> RunSummary {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("sync_run", object = %object, run_id = %run_id);

        async move {
            let started_at = self.clock.now();
            let key = watermark_key(object, options.board_ids.as_deref());
            let mut summary = RunSummary::new(object, key, run_id, started_at);

            tracing::info!("Starting sync of {} (watermark key '{}')", object, summary.watermark_key);

            let mut phase = None;
            let outcome = self.execute(object, options, &mut summary, &mut phase).await;
            match outcome {
                Ok(()) => {
                    summary.status = RunStatus::Committed;
                    tracing::info!(
                        "Committed {} run: {} record(s) emitted, watermark {}",
                        summary
                            .mode_used
                            .map(|m| m.to_string())
                            .unwrap_or_default(),
                        summary.records_emitted,
                        started_at
                    );
                }
                Err(e) => {
                    summary.status = RunStatus::Failed;
                    summary.error = Some(format!("{}: {}", e.kind(), e));
                    if let Some(phase) = phase.as_mut() {
                        phase.advance(RunPhase::Failed);
                    }
                    tracing::error!(
                        "Sync of {} failed after {} record(s), watermark left unchanged: {}",
                        object,
                        summary.records_emitted,
                        e
                    );
                }
            }
            summary.phases = phase.map(PhaseTracker::into_history).unwrap_or_default();
            summary
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        object: ObjectType,
        options: &ObjectOptions,
        summary: &mut RunSummary,
        phase: &mut Option<PhaseTracker>,
    ) -> SyncResult<()> {
        let previous = self
            .store
            .get(&summary.watermark_key)
            .await
            .map_err(SyncError::Watermark)?;
        let phase = phase.insert(PhaseTracker::start(previous.is_some()));

        let boards = if object.is_board_scoped() {
            self.source.resolve_board_ids(options).await?
        } else if object.supports_diff() && previous.is_some() {
            // Board changes are read from each board's own log; archiving a
            // board is logged on that board, so the listing follows the state filter
            let state = options.state_for(object).unwrap_or_else(|| "all".to_string());
            self.source.list_board_ids(&state).await?
        } else {
            Vec::new()
        };

        let plan = self
            .plan_phases(phase, object, &boards, previous.as_ref())
            .await?;
        summary.mode_used = Some(plan.mode);
        summary.fallback_reason = plan.fallback_reason.clone();

        match plan.target_ids {
            None => {
                let stream = self.source.snapshot(object, options, &boards);
                self.emit_all(object, stream, summary, None).await?;
            }
            Some(ids) if ids.is_empty() => {
                tracing::info!("No {} changed since {:?}", object, plan.since);
            }
            Some(ids) => {
                tracing::info!("Fetching {} changed {}", ids.len(), object);
                let wanted = ids.len();
                let mut seen = HashSet::with_capacity(wanted);
                let stream = self.source.fetch_by_ids(object, ids, options);
                self.emit_all(object, stream, summary, Some(&mut seen)).await?;
                summary.ids_not_found = wanted.saturating_sub(seen.len());
                if summary.ids_not_found > 0 {
                    tracing::warn!(
                        "{} changed {} no longer returned by the remote (deleted or inaccessible)",
                        summary.ids_not_found,
                        object
                    );
                }
            }
        }

        self.emitter
            .flush(object)
            .await
            .map_err(|source| SyncError::Emit {
                object: object.to_string(),
                source,
            })?;

        let watermark = Watermark {
            last_sync_timestamp: summary.started_at,
            mode_used: plan.mode,
            cursor_metadata: Some(serde_json::json!({
                "run_id": summary.run_id.to_string(),
                "records_emitted": summary.records_emitted,
            })),
        };
        self.store
            .put(&summary.watermark_key, watermark)
            .await
            .map_err(SyncError::Watermark)?;
        phase.advance(RunPhase::Committed);
        Ok(())
    }

    async fn emit_all(
        &self,
        object: ObjectType,
        mut stream: BoxStream<'_, SyncResult<Record>>,
        summary: &mut RunSummary,
        mut seen: Option<&mut HashSet<String>>,
    ) -> SyncResult<()> {
        while let Some(record) = stream.try_next().await? {
            if record.id.is_empty() {
                summary.records_skipped += 1;
                tracing::warn!("Skipping {} record without a usable id: {}", object, record.row);
                continue;
            }
            self.emitter
                .emit(object, &record)
                .await
                .map_err(|source| SyncError::Emit {
                    object: object.to_string(),
                    source,
                })?;
            if let Some(seen) = seen.as_deref_mut() {
                seen.insert(record.id);
            }
            summary.records_emitted += 1;
            if summary.records_emitted % PROGRESS_INTERVAL == 0 {
                tracing::info!("Emitted {} {} record(s) so far", summary.records_emitted, object);
            }
        }
        Ok(())
    }
}
