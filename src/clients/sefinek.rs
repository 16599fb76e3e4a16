//! Aggregation API for already-reported addresses.

use super::{check_status, http_client, AggregationSink, ClientError};
use crate::action_log::ActionLogEntry;
use crate::config::SecondarySyncConfig;
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    #[serde(rename = "reportedIPs")]
    reported_ips: Vec<SyncedIp>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncedIp {
    ray_id: String,
    address: String,
    endpoint: String,
    user_agent: String,
    action: String,
    country: String,
    timestamp: String,
}

impl From<&ActionLogEntry> for SyncedIp {
    fn from(entry: &ActionLogEntry) -> Self {
        Self {
            ray_id: entry.ray_id.clone(),
            address: entry.address.to_string(),
            endpoint: entry.endpoint.clone(),
            user_agent: entry.user_agent.replace('"', ""),
            action: entry.action.to_string(),
            country: entry.country.clone(),
            timestamp: entry.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    #[serde(default)]
    count: usize,
}

/// Client for the aggregation API.
pub struct SefinekApi {
    config: SecondarySyncConfig,
    client: Client,
}

impl SefinekApi {
    /// Create a new aggregation API client.
    pub fn new(config: SecondarySyncConfig) -> Result<Self, ClientError> {
        let client = http_client(config.timeout_ms)?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl AggregationSink for SefinekApi {
    async fn submit(&self, batch: &[ActionLogEntry]) -> Result<usize, ClientError> {
        let body = SyncRequest {
            reported_ips: batch.iter().map(SyncedIp::from).collect(),
        };

        debug!(entries = batch.len(), url = %self.config.url, "Sending batch to aggregation API");

        let response = self
            .client
            .post(&self.config.url)
            .bearer_auth(&self.config.secret)
            .json(&body)
            .send()
            .await?;

        let response = check_status(response).await?;
        let parsed: SyncResponse = response.json().await.map_err(|e| {
            ClientError::InvalidResponse(format!("Failed to parse response: {}", e))
        })?;

        Ok(parsed.count)
    }
}
