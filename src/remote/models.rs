// ABOUTME: Wire structures for the GraphQL endpoint
// ABOUTME: Request body {query, variables} and the response envelope with its error list

use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

#[derive(Debug, Clone, Serialize)]
pub struct GraphqlRequest<'a> {
    pub query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<&'a serde_json::Value>,
}

impl<'a> GraphqlRequest<'a> {
    pub fn new(query: &'a str, variables: &'a serde_json::Value) -> Self {
        // An empty/null variables object is omitted from the body
        let variables = match variables {
            serde_json::Value::Null => None,
            serde_json::Value::Object(map) if map.is_empty() => None,
            other => Some(other),
        };
        Self { query, variables }
    }
}

/// Response envelope. The remote answers 200 even for query errors, so the
/// `errors` list must always be inspected.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphqlResponse {
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<GraphqlError>,
    /// Legacy top-level error fields still returned by some endpoints
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphqlError {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub extensions: Option<ErrorExtensions>,
    #[serde(default)]
    pub path: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorExtensions {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub retry_in_seconds: Option<u64>,
}

impl GraphqlResponse {
    /// All errors in the body, including the legacy top-level form.
    pub fn remote_errors(&self) -> Vec<RemoteError> {
        let mut errors: Vec<RemoteError> = self
            .errors
            .iter()
            .map(|e| RemoteError {
                code: e.code().map(str::to_string),
                message: e.message.clone(),
            })
            .collect();

        if self.error_code.is_some() || self.error_message.is_some() {
            errors.push(RemoteError {
                code: self.error_code.clone(),
                message: self.error_message.clone().unwrap_or_default(),
            });
        }

        errors
    }

    /// Whether the body reported any error in either form.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty() || self.error_code.is_some() || self.error_message.is_some()
    }

    /// The largest `retry_in_seconds` hint across all errors.
    pub fn retry_hint_secs(&self) -> Option<u64> {
        self.errors
            .iter()
            .filter_map(|e| e.extensions.as_ref().and_then(|x| x.retry_in_seconds))
            .max()
    }
}

impl GraphqlError {
    pub fn code(&self) -> Option<&str> {
        self.extensions.as_ref().and_then(|x| x.code.as_deref())
    }
}
