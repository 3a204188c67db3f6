// ABOUTME: Error taxonomy for the sync engine
// ABOUTME: Every remote failure is re-classified into these variants before reaching the planner

use std::time::Duration;

use thiserror::Error;

/// Result type for sync engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// A single entry from the remote's top-level `errors` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: Option<String>,
    pub message: String,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Errors surfaced by the request client, pager, differ and planner.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Complexity, concurrency or quota budget exhausted on the remote.
    #[error("rate limited by remote (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Network failure, timeout or 5xx.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// Authentication failure or malformed query. Never retried.
    #[error("fatal remote error [{code}]: {message}")]
    Fatal { code: String, message: String },

    /// HTTP success but the body carried a non-empty `errors` list.
    #[error("partial data from remote ({} error(s), permanent: {permanent}): {}", .errors.len(), summarize(.errors))]
    PartialData {
        errors: Vec<RemoteError>,
        data: Option<serde_json::Value>,
        permanent: bool,
    },

    /// A pagination cursor outlived its validity window.
    #[error("pagination cursor expired")]
    CursorExpired,

    /// The activity log cannot cover the requested window.
    #[error("activity log unavailable: {0}")]
    ActivityLogUnavailable(String),

    /// The response body did not match the expected shape.
    #[error("failed to decode remote payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to emit {object} record: {source:#}")]
    Emit {
        object: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("watermark store failure: {0:#}")]
    Watermark(#[source] anyhow::Error),
}

impl SyncError {
    /// Whether the request client should retry the request that produced this error.
    ///
    /// Partial data is retried like a transient failure unless one of its errors
    /// marks a permanent condition.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::RateLimited { .. } | SyncError::Transient(_) => true,
            SyncError::PartialData { permanent, .. } => !permanent,
            _ => false,
        }
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Stable snake_case label used in run summaries and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::RateLimited { .. } => "rate_limited",
            SyncError::Transient(_) => "transient_error",
            SyncError::Fatal { .. } => "fatal_error",
            SyncError::PartialData { .. } => "partial_data",
            SyncError::CursorExpired => "cursor_expired",
            SyncError::ActivityLogUnavailable(_) => "activity_log_unavailable",
            SyncError::Decode(_) => "decode_error",
            SyncError::Emit { .. } => "emit_failed",
            SyncError::Watermark(_) => "watermark_store_failed",
        }
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Fatal {
            code: code.into(),
            message: message.into(),
        }
    }
}

fn summarize(errors: &[RemoteError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
