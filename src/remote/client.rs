// ABOUTME: Request client for the GraphQL endpoint
// ABOUTME: Retries rate-limit and transient failures with backoff, propagates fatal errors at once

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::backoff::{BackoffPolicy, RateLimitGate};
use super::classify::{classify, HttpReply};
use super::models::GraphqlRequest;
use crate::error::{SyncError, SyncResult};

/// Default Monday.com GraphQL endpoint
pub const DEFAULT_API_URL: &str = "https://api.monday.com/v2";

/// Sends one request body and returns the raw reply. Implementations map
/// network-level failures to [`SyncError::Transient`]; everything else is
/// left to [`classify`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, request: &GraphqlRequest<'_>) -> SyncResult<HttpReply>;
}

/// reqwest-backed transport. Auth is a static token header with no bearer prefix.
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    api_token: String,
    api_version: Option<String>,
}

impl HttpTransport {
    pub fn new(
        endpoint: &str,
        api_token: String,
        api_version: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        url::Url::parse(endpoint)
            .map_err(|e| anyhow::anyhow!("Invalid API endpoint '{}': {}", endpoint, e))?;

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_token,
            api_version,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: &GraphqlRequest<'_>) -> SyncResult<HttpReply> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Authorization", &self.api_token)
            .header("Content-Type", "application/json")
            .json(request);

        if let Some(ref version) = self.api_version {
            builder = builder.header("API-Version", version);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::Transient(format!("request timed out: {}", e))
            } else {
                SyncError::Transient(format!("request failed: {}", e))
            }
        })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = response
            .text()
            .await
            .map_err(|e| SyncError::Transient(format!("failed to read response body: {}", e)))?;

        Ok(HttpReply {
            status,
            retry_after,
            body,
        })
    }
}

/// Executes GraphQL queries with classification and bounded retries.
///
/// Cloning is cheap; clones share the transport and the rate-limit gate, so
/// every worker of a run observes the same pause.
#[derive(Clone)]
pub struct RequestClient {
    transport: Arc<dyn Transport>,
    policy: BackoffPolicy,
    gate: Arc<RateLimitGate>,
}

impl RequestClient {
    pub fn new(transport: Arc<dyn Transport>, policy: BackoffPolicy) -> Self {
        Self {
            transport,
            policy,
            gate: Arc::new(RateLimitGate::new()),
        }
    }

    pub fn gate(&self) -> &Arc<RateLimitGate> {
        &self.gate
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Execute one query and return its `data` payload.
    ///
    /// `RateLimited` and `TransientError` (including non-permanent partial data)
    /// are retried up to `max_attempts`; the last error is returned once the
    /// budget is spent. Anything else is returned immediately.
    pub async fn execute(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> SyncResult<serde_json::Value> {
        let request = GraphqlRequest::new(query, &variables);
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            self.gate.wait_ready().await;

            let outcome = match self.transport.post(&request).await {
                Ok(reply) => classify(reply),
                Err(e) => Err(e),
            };

            let err = match outcome {
                Ok(data) => return Ok(data),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }

            if attempt >= max_attempts {
                if let SyncError::RateLimited { retry_after } = &err {
                    // The budget is still spent for every other worker
                    self.gate
                        .observe(retry_after.unwrap_or_else(|| self.policy.delay_for(attempt)));
                }
                tracing::error!(
                    "Request failed after {} attempts: {}",
                    max_attempts,
                    err
                );
                return Err(err);
            }

            match &err {
                SyncError::RateLimited { retry_after } => {
                    let wait = retry_after.unwrap_or_else(|| self.policy.delay_for(attempt));
                    tracing::warn!(
                        "Rate limited (attempt {}/{}), pausing all workers for {:?}",
                        attempt,
                        max_attempts,
                        wait
                    );
                    self.gate.observe(wait);
                }
                _ => {
                    let wait = self.policy.jittered_delay_for(attempt);
                    tracing::warn!(
                        "Request failed (attempt {}/{}): {}, retrying in {:?}...",
                        attempt,
                        max_attempts,
                        err,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                }
            }

            attempt += 1;
        }
    }
}
