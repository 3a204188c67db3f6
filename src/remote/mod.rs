// ABOUTME: Paginated request client for the remote GraphQL endpoint
// ABOUTME: Transport, response classification, retry policy and shared rate-limit gate

pub mod backoff;
pub mod classify;
pub mod client;
pub mod models;

pub use backoff::{BackoffPolicy, RateLimitGate};
pub use classify::{classify, HttpReply};
pub use client::{HttpTransport, RequestClient, Transport, DEFAULT_API_URL};
pub use models::{GraphqlRequest, GraphqlResponse};
