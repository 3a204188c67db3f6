// ABOUTME: Activity-log differ: turns a watermark into the set of entity ids changed since then
// ABOUTME: Applies the lookback window, deduplicates ids, and reports when history cannot cover the window

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::pager::page_based;
use crate::source::models::ActivityLogEntry;
use crate::source::{MondaySource, ObjectType};

/// Fallback reason recorded when the log cannot prove completeness.
pub const RETENTION_EXCEEDED: &str = "activity_log_retention_exceeded";

/// Pages of a board's activity log, newest window first, starting at `from`.
#[async_trait]
pub trait ActivityLogSource: Send + Sync {
    async fn log_page(
        &self,
        board_id: &str,
        from: DateTime<Utc>,
        page: u32,
        limit: usize,
    ) -> SyncResult<Vec<ActivityLogEntry>>;
}

#[async_trait]
impl ActivityLogSource for MondaySource {
    async fn log_page(
        &self,
        board_id: &str,
        from: DateTime<Utc>,
        page: u32,
        limit: usize,
    ) -> SyncResult<Vec<ActivityLogEntry>> {
        self.activity_log_page(board_id, from, page, limit).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAction {
    Create,
    Update,
    Delete,
}

impl LogAction {
    /// Classify a log event name such as `create_pulse` or `delete_board`.
    pub fn from_event(event: &str) -> Self {
        let event = event.to_ascii_lowercase();
        if event.contains("delete") || event.contains("archive") {
            LogAction::Delete
        } else if event.contains("create") || event.starts_with("add") || event.contains("duplicate")
        {
            LogAction::Create
        } else {
            LogAction::Update
        }
    }
}

/// A log entry reduced to what the differ needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityLogEvent {
    pub entity_id: String,
    pub entity_type: String,
    pub occurred_at: DateTime<Utc>,
    pub action: LogAction,
}

impl ActivityLogEvent {
    /// Interpret `entry` from `board_id`'s log as a change to `object`.
    /// `None` when the entry concerns another entity type or carries no id.
    pub fn from_entry(
        object: ObjectType,
        board_id: &str,
        entry: &ActivityLogEntry,
        default_time: DateTime<Utc>,
    ) -> Option<Self> {
        let wanted = object.log_entity()?;
        let entity = entry.entity.as_deref()?;
        if entity != wanted {
            return None;
        }

        let entity_id = match object {
            ObjectType::Boards => board_id.to_string(),
            _ => entry.item_id()?,
        };

        Some(Self {
            entity_id,
            entity_type: entity.to_string(),
            occurred_at: entry.occurred_at().unwrap_or(default_time),
            action: LogAction::from_event(entry.event.as_deref().unwrap_or_default()),
        })
    }
}

/// Distinct ids changed inside the diff window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedSet {
    pub ids: BTreeSet<String>,
    /// Matching log events before deduplication
    pub events_seen: usize,
}

impl ChangedSet {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Complete set of changed ids; may be empty
    Changed(ChangedSet),
    /// The log cannot cover the window; the caller must take a snapshot
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct DifferSettings {
    /// How far back the log still reaches
    pub retention: Duration,
    /// Entries per log request
    pub page_size: usize,
    /// Boards read concurrently
    pub workers: usize,
}

impl Default for DifferSettings {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            page_size: 1000,
            workers: 4,
        }
    }
}

pub struct ActivityLogDiffer {
    clock: Arc<dyn Clock>,
    settings: DifferSettings,
}

/// `instant - duration`, saturating instead of overflowing.
fn minus(instant: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| instant.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl ActivityLogDiffer {
    pub fn new(clock: Arc<dyn Clock>, settings: DifferSettings) -> Self {
        Self { clock, settings }
    }

    pub fn settings(&self) -> &DifferSettings {
        &self.settings
    }

    /// Ids of `object` entities changed on `boards` since `since - lookback` (inclusive).
    ///
    /// A fatal or exhausted-retry error propagates; a window older than the
    /// retention horizon, or a log the remote refuses to serve, yields
    /// [`DiffOutcome::Unavailable`] instead of a partial set.
    pub async fn diff(
        &self,
        log: &dyn ActivityLogSource,
        object: ObjectType,
        boards: &[String],
        since: DateTime<Utc>,
        lookback: Duration,
    ) -> SyncResult<DiffOutcome> {
        if object.log_entity().is_none() {
            return Ok(DiffOutcome::Unavailable(format!(
                "{}_has_no_activity_log",
                object
            )));
        }

        let effective_since = minus(since, lookback);
        let horizon = minus(self.clock.now(), self.settings.retention);
        if effective_since < horizon {
            tracing::warn!(
                "Activity log window for {} starts at {} which is before the retention horizon {}",
                object,
                effective_since,
                horizon
            );
            return Ok(DiffOutcome::Unavailable(RETENTION_EXCEEDED.to_string()));
        }

        tracing::debug!(
            "Diffing {} across {} board(s) from {} (since {} minus {:?} lookback)",
            object,
            boards.len(),
            effective_since,
            since,
            lookback
        );

        let per_board = stream::iter(boards)
            .map(|board_id| self.board_events(log, object, board_id, effective_since))
            .buffer_unordered(self.settings.workers.max(1))
            .try_fold(ChangedSet::default(), |mut set, events| async move {
                set.events_seen += events.len();
                set.ids.extend(events.into_iter().map(|e| e.entity_id));
                Ok(set)
            })
            .await;

        match per_board {
            Ok(set) => {
                tracing::info!(
                    "Activity log reports {} changed {} ({} event(s))",
                    set.len(),
                    object,
                    set.events_seen
                );
                Ok(DiffOutcome::Changed(set))
            }
            Err(SyncError::ActivityLogUnavailable(reason)) => {
                tracing::warn!("Activity log unavailable for {}: {}", object, reason);
                Ok(DiffOutcome::Unavailable(RETENTION_EXCEEDED.to_string()))
            }
            Err(err @ SyncError::PartialData { permanent: true, .. }) => {
                tracing::warn!("Activity log refused for {}: {}", object, err);
                Ok(DiffOutcome::Unavailable(RETENTION_EXCEEDED.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    async fn board_events(
        &self,
        log: &dyn ActivityLogSource,
        object: ObjectType,
        board_id: &str,
        effective_since: DateTime<Utc>,
    ) -> SyncResult<Vec<ActivityLogEvent>> {
        let page_size = self.settings.page_size.max(1);
        page_based(
            |page| log.log_page(board_id, effective_since, page, page_size),
            page_size,
        )
        .try_filter_map(|entry| async move {
            Ok(
                ActivityLogEvent::from_entry(object, board_id, &entry, effective_since)
                    .filter(|event| event.occurred_at >= effective_since),
            )
        })
        .try_collect()
        .await
    }
}
