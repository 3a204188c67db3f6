// ABOUTME: Classifies raw HTTP replies into the sync error taxonomy
// ABOUTME: Inspects the body, not just the status, since query errors arrive as HTTP 200

use std::time::Duration;

use crate::error::{RemoteError, SyncError, SyncResult};

use super::models::GraphqlResponse;

/// Codes that signal complexity, concurrency or quota exhaustion.
const RATE_LIMIT_CODES: &[&str] = &[
    "COMPLEXITY_BUDGET_EXHAUSTED",
    "ComplexityException",
    "RATE_LIMIT_EXCEEDED",
    "RateLimitExceeded",
    "maxConcurrencyExceeded",
    "MAX_CONCURRENCY_EXCEEDED",
    "IP_RATE_LIMIT_EXCEEDED",
    "DAILY_LIMIT_EXCEEDED",
];

const CURSOR_EXPIRED_CODES: &[&str] = &["CursorExpiredError", "CURSOR_EXPIRED"];

/// Codes for an activity-log window older than the remote still serves.
const LOG_RANGE_CODES: &[&str] = &[
    "ActivityLogRangeUnavailable",
    "ACTIVITY_LOG_RANGE_UNAVAILABLE",
    "InvalidDateRangeException",
];

/// Authentication and malformed-query codes. These abort the run.
const FATAL_CODES: &[&str] = &[
    "Unauthorized",
    "UNAUTHENTICATED",
    "NOT_AUTHENTICATED",
    "InvalidTokenException",
    "GRAPHQL_VALIDATION_FAILED",
    "GraphQLValidationError",
    "PARSING_ERROR",
    "ParseError",
    "JsonParseException",
    "undefinedField",
    "argumentLiteralsIncompatible",
    "missingRequiredArguments",
];

/// Codes tied to a specific id (deleted, missing or not permitted). Not worth retrying.
const PERMANENT_CODES: &[&str] = &[
    "ResourceNotFoundException",
    "RESOURCE_NOT_FOUND",
    "InvalidBoardIdException",
    "InvalidItemIdException",
    "InvalidUserIdException",
    "UserUnauthorizedException",
    "USER_UNAUTHORIZED",
    "FORBIDDEN",
];

/// Raw transport-level reply, before any interpretation.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    /// Parsed `Retry-After` header, if present
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl HttpReply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn with_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }
}

/// Turn a reply into the `data` payload or a classified error.
pub fn classify(reply: HttpReply) -> SyncResult<serde_json::Value> {
    let status = reply.status;
    let success = (200..300).contains(&status);

    let parsed = serde_json::from_str::<GraphqlResponse>(&reply.body);

    match status {
        401 | 403 => {
            let message = parsed
                .as_ref()
                .ok()
                .and_then(|r| r.remote_errors().into_iter().next())
                .map(|e| e.message)
                .unwrap_or_else(|| "authentication rejected by remote".to_string());
            return Err(SyncError::fatal(format!("HTTP_{}", status), message));
        }
        429 => {
            let hint = parsed.as_ref().ok().and_then(body_retry_hint);
            return Err(SyncError::RateLimited {
                retry_after: reply.retry_after.or(hint),
            });
        }
        408 | 500..=599 => {
            return Err(SyncError::Transient(format!(
                "remote returned HTTP {}",
                status
            )));
        }
        _ => {}
    }

    let response = match parsed {
        Ok(response) => response,
        Err(e) if success => {
            // Truncated or proxy-mangled bodies usually clear up on retry
            return Err(SyncError::Transient(format!(
                "unreadable response body: {}",
                e
            )));
        }
        Err(_) => {
            return Err(SyncError::fatal(
                format!("HTTP_{}", status),
                snippet(&reply.body),
            ));
        }
    };

    if response.has_errors() {
        return Err(classify_body_errors(response, status, reply.retry_after));
    }

    if !success {
        return Err(SyncError::fatal(
            format!("HTTP_{}", status),
            snippet(&reply.body),
        ));
    }

    match response.data {
        Some(data) if !data.is_null() => Ok(data),
        _ => Err(SyncError::PartialData {
            errors: Vec::new(),
            data: None,
            permanent: false,
        }),
    }
}

fn classify_body_errors(
    response: GraphqlResponse,
    status: u16,
    header_hint: Option<Duration>,
) -> SyncError {
    let errors = response.remote_errors();

    if response.status_code == Some(429) || errors.iter().any(|e| has_code(e, RATE_LIMIT_CODES)) {
        return SyncError::RateLimited {
            retry_after: body_retry_hint(&response).or(header_hint),
        };
    }

    if errors.iter().any(is_cursor_expired) {
        return SyncError::CursorExpired;
    }

    if let Some(range) = errors.iter().find(|e| is_log_range_unavailable(e)) {
        return SyncError::ActivityLogUnavailable(range.message.clone());
    }

    if let Some(fatal) = errors.iter().find(|e| is_fatal(e)) {
        return SyncError::fatal(
            fatal.code.clone().unwrap_or_else(|| "QUERY_ERROR".to_string()),
            fatal.message.clone(),
        );
    }

    if !(200..300).contains(&status) {
        let first = &errors[0];
        return SyncError::fatal(
            first
                .code
                .clone()
                .unwrap_or_else(|| format!("HTTP_{}", status)),
            first.message.clone(),
        );
    }

    let permanent = errors.iter().any(|e| has_code(e, PERMANENT_CODES));
    SyncError::PartialData {
        errors,
        data: response.data.filter(|d| !d.is_null()),
        permanent,
    }
}

fn has_code(error: &RemoteError, codes: &[&str]) -> bool {
    error
        .code
        .as_deref()
        .map(|c| codes.contains(&c))
        .unwrap_or(false)
}

fn is_cursor_expired(error: &RemoteError) -> bool {
    if has_code(error, CURSOR_EXPIRED_CODES) {
        return true;
    }
    let message = error.message.to_ascii_lowercase();
    message.contains("cursor") && message.contains("expired")
}

fn is_log_range_unavailable(error: &RemoteError) -> bool {
    if has_code(error, LOG_RANGE_CODES) {
        return true;
    }
    let message = error.message.to_ascii_lowercase();
    (message.contains("activity log") || message.contains("activity_log"))
        && (message.contains("retention")
            || message.contains("out of range")
            || message.contains("no longer available"))
}

fn is_fatal(error: &RemoteError) -> bool {
    has_code(error, FATAL_CODES) || error.message.starts_with("Parse error on")
}

/// Wait hint from the body: extension field first, then "reset in N seconds" text.
fn body_retry_hint(response: &GraphqlResponse) -> Option<Duration> {
    if let Some(secs) = response.retry_hint_secs() {
        return Some(Duration::from_secs(secs));
    }
    response
        .remote_errors()
        .iter()
        .filter_map(|e| parse_reset_in(&e.message))
        .max()
}

/// Parse "... reset in 23 seconds" style messages.
fn parse_reset_in(message: &str) -> Option<Duration> {
    let lower = message.to_ascii_lowercase();
    let idx = lower.find("reset in ")?;
    let digits: String = lower[idx + "reset in ".len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u64>().ok().map(Duration::from_secs)
}

fn snippet(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    }
}
