//! Cloudflare GraphQL firewall event source.

use super::{check_status, http_client, ClientError, EventBatch, EventSource};
use crate::config::{CloudflareConfig, MAX_LOOKBACK_SECONDS};
use crate::event::FirewallEvent;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

const QUERY: &str = r#"query ListFirewallEvents($zoneTag: string, $filter: FirewallEventsAdaptiveFilter_InputObject, $limit: Int) {
  viewer {
    zones(filter: { zoneTag: $zoneTag }) {
      firewallEventsAdaptive(filter: $filter, limit: $limit, orderBy: [datetime_DESC]) {
        action
        clientCountryName
        clientIP
        clientRequestHTTPHost
        clientRequestHTTPMethodName
        clientRequestPath
        clientRequestQuery
        datetime
        rayName
        ruleId
        userAgent
      }
    }
  }
}"#;

/// Firewall actions that did not end in a block and are never reported.
pub const BENIGN_ACTIONS: [&str; 12] = [
    "allow",
    "skip",
    "challenge_solved",
    "challenge_failed",
    "challenge_bypassed",
    "jschallenge_solved",
    "jschallenge_failed",
    "jschallenge_bypassed",
    "managed_challenge_skipped",
    "managed_challenge_non_interactive_solved",
    "managed_challenge_interactive_solved",
    "managed_challenge_bypassed",
];

#[derive(Debug, Deserialize)]
struct GraphQLResponse {
    data: Option<ViewerData>,
    #[serde(default)]
    errors: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ViewerData {
    viewer: Viewer,
}

#[derive(Debug, Deserialize)]
struct Viewer {
    zones: Vec<Zone>,
}

#[derive(Debug, Deserialize)]
struct Zone {
    #[serde(rename = "firewallEventsAdaptive", default)]
    events: Vec<RawFirewallEvent>,
}

/// Row as returned by the API. Every field may be absent.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFirewallEvent {
    action: Option<String>,
    client_country_name: Option<String>,
    #[serde(rename = "clientIP")]
    client_ip: Option<String>,
    #[serde(rename = "clientRequestHTTPHost")]
    client_request_http_host: Option<String>,
    #[serde(rename = "clientRequestHTTPMethodName")]
    client_request_http_method_name: Option<String>,
    client_request_path: Option<String>,
    client_request_query: Option<String>,
    datetime: Option<String>,
    ray_name: Option<String>,
    rule_id: Option<String>,
    user_agent: Option<String>,
}

impl RawFirewallEvent {
    /// Convert into a strict event. Rows without a ray id, a valid client IP
    /// or a valid timestamp are rejected.
    fn into_event(self) -> Option<FirewallEvent> {
        let ray_id = self.ray_name.filter(|r| !r.is_empty())?;
        let address = self.client_ip?.trim().parse().ok()?;
        let occurred_at = DateTime::parse_from_rfc3339(self.datetime.as_deref()?)
            .ok()?
            .with_timezone(&Utc);

        Some(FirewallEvent {
            ray_id,
            address,
            hostname: self.client_request_http_host.unwrap_or_default(),
            path: self.client_request_path.unwrap_or_default(),
            query: self.client_request_query.unwrap_or_default(),
            method: self.client_request_http_method_name.unwrap_or_default(),
            country: self.client_country_name.unwrap_or_default(),
            user_agent: self.user_agent.unwrap_or_default(),
            rule_id: self.rule_id.unwrap_or_default(),
            firewall_action: self.action.unwrap_or_default(),
            occurred_at,
        })
    }
}

/// Cloudflare firewall event source.
pub struct CloudflareSource {
    config: CloudflareConfig,
    client: Client,
}

impl CloudflareSource {
    /// Create a new Cloudflare source.
    pub fn new(config: CloudflareConfig) -> Result<Self, ClientError> {
        let client = http_client(config.timeout_ms)?;
        Ok(Self { config, client })
    }

    /// GraphQL request body for the window ending at `now`.
    fn payload(&self, now: DateTime<Utc>) -> Value {
        let lookback = i64::try_from(self.config.lookback_seconds.min(MAX_LOOKBACK_SECONDS))
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or_else(TimeDelta::zero);
        let since = now.checked_sub_signed(lookback).unwrap_or(now);
        let excluded: Vec<Value> = BENIGN_ACTIONS
            .iter()
            .map(|action| json!({ "action_neq": action }))
            .collect();

        json!({
            "query": QUERY,
            "variables": {
                "zoneTag": self.config.zone_id,
                "limit": self.config.page_size,
                "filter": {
                    "datetime_geq": since.to_rfc3339_opts(SecondsFormat::Secs, true),
                    "datetime_leq": now.to_rfc3339_opts(SecondsFormat::Secs, true),
                    "AND": excluded,
                }
            }
        })
    }
}

#[async_trait]
impl EventSource for CloudflareSource {
    async fn fetch_events(&self) -> Result<EventBatch, ClientError> {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_token)
            .json(&self.payload(Utc::now()));

        if let Some(email) = self.config.email.as_deref().filter(|e| !e.is_empty()) {
            request = request.header("X-Auth-Email", email);
        }

        let response = check_status(request.send().await?).await?;
        let body: GraphQLResponse = response.json().await.map_err(|e| {
            ClientError::InvalidResponse(format!("Failed to parse response: {}", e))
        })?;

        parse_response(body)
    }
}

fn parse_response(body: GraphQLResponse) -> Result<EventBatch, ClientError> {
    let Some(data) = body.data else {
        return Err(ClientError::InvalidResponse(format!(
            "no data in response (missing Zone.Analytics.Read permission?): {}",
            Value::Array(body.errors)
        )));
    };

    let rows: Vec<RawFirewallEvent> = data
        .viewer
        .zones
        .into_iter()
        .flat_map(|zone| zone.events)
        .collect();

    let mut batch = EventBatch::default();
    for row in rows {
        let ray = row.ray_name.clone();
        match row.into_event() {
            Some(event) => batch.events.push(event),
            None => {
                warn!(ray_id = ?ray, "Quarantined firewall event with missing or invalid fields");
                batch.quarantined += 1;
            }
        }
    }

    debug!(
        events = batch.events.len(),
        quarantined = batch.quarantined,
        "Fetched firewall events"
    );

    Ok(batch)
}
