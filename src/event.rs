//! Firewall events consumed from the event source.

use chrono::{DateTime, Utc};
use std::net::IpAddr;

/// One blocked request reported by the firewall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallEvent {
    /// Unique event identifier (Cloudflare "ray").
    pub ray_id: String,
    pub address: IpAddr,
    pub hostname: String,
    pub path: String,
    /// Query string including the leading `?`, or empty.
    pub query: String,
    pub method: String,
    pub country: String,
    pub user_agent: String,
    pub rule_id: String,
    /// Firewall action that was applied (e.g. `block`, `managed_challenge`).
    pub firewall_action: String,
    pub occurred_at: DateTime<Utc>,
}

impl FirewallEvent {
    /// Host and path, as validated and logged.
    pub fn uri(&self) -> String {
        format!("{}{}", self.hostname, self.path)
    }
}
