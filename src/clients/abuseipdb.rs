//! AbuseIPDB report sink.

use super::{check_status, http_client, ClientError, ReputationSink};
use crate::config::AbuseIPDBConfig;
use crate::event::FirewallEvent;
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

/// Longest comment AbuseIPDB accepts.
pub const MAX_COMMENT_LENGTH: usize = 1024;

#[derive(Debug, Serialize)]
struct ReportRequest<'a> {
    ip: String,
    categories: &'a str,
    comment: String,
    /// When the attack happened, not when it is reported.
    timestamp: String,
}

fn report_request<'a>(event: &FirewallEvent, categories: &'a str) -> ReportRequest<'a> {
    ReportRequest {
        ip: event.address.to_string(),
        categories,
        comment: report_comment(event),
        timestamp: event.occurred_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

/// AbuseIPDB report sink.
pub struct AbuseIPDBSink {
    config: AbuseIPDBConfig,
    client: Client,
}

impl AbuseIPDBSink {
    /// Create a new AbuseIPDB sink.
    pub fn new(config: AbuseIPDBConfig) -> Result<Self, ClientError> {
        let client = http_client(config.timeout_ms)?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl ReputationSink for AbuseIPDBSink {
    async fn report(&self, event: &FirewallEvent) -> Result<(), ClientError> {
        let body = report_request(event, &self.config.categories);

        debug!(ip = %event.address, ray_id = %event.ray_id, "Reporting to AbuseIPDB");

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Key", &self.config.api_key)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;

        check_status(response).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "abuseipdb"
    }
}

/// Build the report comment from the event.
pub fn report_comment(event: &FirewallEvent) -> String {
    let mut lines = Vec::with_capacity(5);

    let action = if event.firewall_action.is_empty() {
        "block"
    } else {
        event.firewall_action.as_str()
    };
    if event.rule_id.is_empty() {
        lines.push(format!("Blocked by Cloudflare WAF ({})", action));
    } else {
        lines.push(format!(
            "Blocked by Cloudflare WAF ({}, rule {})",
            action, event.rule_id
        ));
    }

    let method = if event.method.is_empty() {
        "GET"
    } else {
        event.method.as_str()
    };
    lines.push(format!("Request: {} {}{}", method, event.uri(), event.query));

    if !event.country.is_empty() {
        lines.push(format!("Country: {}", event.country));
    }
    if !event.user_agent.is_empty() {
        lines.push(format!("User-Agent: {}", event.user_agent));
    }

    truncate_chars(&lines.join("\n"), MAX_COMMENT_LENGTH)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text.to_string(),
    }
}
