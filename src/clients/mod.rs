//! Outbound adapters: event source, reputation sink, aggregation API and
//! own-address resolver.

pub mod abuseipdb;
pub mod cloudflare;
pub mod sefinek;
pub mod self_ip;

use crate::action_log::ActionLogEntry;
use crate::event::FirewallEvent;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use std::net::IpAddr;
use std::time::Duration;

/// User-agent sent with every outbound request.
pub const USER_AGENT: &str = concat!(
    "Mozilla/5.0 (compatible; waf-abuse-reporter/",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// Error from an outbound HTTP call.
#[derive(Debug)]
pub enum ClientError {
    /// HTTP transport failed.
    Http(reqwest::Error),
    /// Timeout.
    Timeout,
    /// The remote answered 429.
    RateLimited,
    /// Any other non-success status.
    Status { status: u16, body: String },
    /// Response body could not be understood.
    InvalidResponse(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Http(e) => write!(f, "HTTP error: {}", e),
            ClientError::Timeout => write!(f, "Request timed out"),
            ClientError::RateLimited => write!(f, "Rate limited"),
            ClientError::Status { status, body } => write!(f, "HTTP {}: {}", status, body),
            ClientError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Http(e)
        }
    }
}

/// One page of events from the source.
#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    pub events: Vec<FirewallEvent>,
    /// Rows dropped because a required field was missing or unparseable.
    pub quarantined: usize,
}

/// Source of recently blocked requests.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn fetch_events(&self) -> Result<EventBatch, ClientError>;
}

/// IP reputation service that receives abuse reports.
#[async_trait]
pub trait ReputationSink: Send + Sync {
    /// Report the client of `event`. A 429 must surface as `ClientError::RateLimited`.
    async fn report(&self, event: &FirewallEvent) -> Result<(), ClientError>;

    /// Sink name for logging.
    fn name(&self) -> &str;
}

/// Companion service collecting already-reported entries.
#[async_trait]
pub trait AggregationSink: Send + Sync {
    /// Forward a batch, returning the number of entries the service accepted.
    async fn submit(&self, batch: &[ActionLogEntry]) -> Result<usize, ClientError>;
}

/// Lookup of the operator's own public address.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self) -> Result<IpAddr, ClientError>;
}

/// Build an HTTP client with the shared user-agent and `timeout_ms`.
pub fn http_client(timeout_ms: u64) -> Result<Client, ClientError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(ClientError::Http)
}

/// Turn 429 into `RateLimited` and other failures into `Status`.
pub(crate) async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ClientError::RateLimited);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}
