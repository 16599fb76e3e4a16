//! Configuration types for the WAF abuse reporter.

use crate::action_log::csv::HEADER;
use crate::cooldown::CooldownPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Cycle timing and classification limits.
    #[serde(default)]
    pub settings: Settings,

    /// Persisted action log.
    #[serde(default)]
    pub action_log: ActionLogConfig,

    /// Cloudflare event source.
    pub cloudflare: CloudflareConfig,

    /// AbuseIPDB reputation sink.
    pub abuseipdb: AbuseIPDBConfig,

    /// Own-address lookup.
    #[serde(default)]
    pub self_ip: SelfIpConfig,

    /// Forwarding of reported entries to the aggregation API.
    #[serde(default)]
    pub secondary_sync: SecondarySyncConfig,
}

/// Cycle timing and classification limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Sleep between poll cycles.
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_seconds: u64,

    /// Minimum time before an address may be reported again.
    #[serde(default = "default_cooldown")]
    pub reported_ip_cooldown_seconds: u64,

    /// Separate window for rate-limited attempts. Shares the report window when unset.
    #[serde(default)]
    pub rate_limited_cooldown_seconds: Option<u64>,

    /// Longest host + path accepted for a report.
    #[serde(default = "default_max_uri_length")]
    pub max_uri_length: usize,

    /// Pause after each successful report.
    #[serde(default = "default_success_cooldown")]
    pub success_cooldown_ms: u64,

    /// How often the own address is refreshed.
    #[serde(default = "default_self_ip_refresh")]
    pub self_ip_refresh_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cycle_interval_seconds: default_cycle_interval(),
            reported_ip_cooldown_seconds: default_cooldown(),
            rate_limited_cooldown_seconds: None,
            max_uri_length: default_max_uri_length(),
            success_cooldown_ms: default_success_cooldown(),
            self_ip_refresh_seconds: default_self_ip_refresh(),
        }
    }
}

impl Settings {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_seconds)
    }

    pub fn success_cooldown(&self) -> Duration {
        Duration::from_millis(self.success_cooldown_ms)
    }

    pub fn self_ip_refresh(&self) -> Duration {
        Duration::from_secs(self.self_ip_refresh_seconds)
    }

    /// Cooldown policy described by these settings.
    pub fn cooldown_policy(&self) -> CooldownPolicy {
        let policy = CooldownPolicy::new(Duration::from_secs(self.reported_ip_cooldown_seconds));
        match self.rate_limited_cooldown_seconds {
            Some(secs) => policy.with_rate_limited_window(Duration::from_secs(secs)),
            None => policy,
        }
    }
}

fn default_cycle_interval() -> u64 {
    3 * 60 * 60
}

fn default_cooldown() -> u64 {
    7 * 60 * 60
}

fn default_max_uri_length() -> usize {
    1000
}

fn default_success_cooldown() -> u64 {
    2000
}

fn default_self_ip_refresh() -> u64 {
    9 * 60
}

/// Persisted action log.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionLogConfig {
    /// Path of the CSV log.
    #[serde(default = "default_log_path")]
    pub path: PathBuf,

    /// Size ceiling; the log starts over when an append would exceed it.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

impl Default for ActionLogConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            max_bytes: default_max_bytes(),
        }
    }
}

fn default_log_path() -> PathBuf {
    PathBuf::from("reported_ips.csv")
}

fn default_max_bytes() -> u64 {
    4 * 1024 * 1024
}

/// Cloudflare GraphQL event source.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudflareConfig {
    /// API token with Zone.Analytics.Read (supports ${ENV_VAR} syntax).
    pub api_token: String,

    /// Account email, sent as X-Auth-Email when set.
    #[serde(default)]
    pub email: Option<String>,

    /// Zone to read firewall events from.
    pub zone_id: String,

    /// GraphQL endpoint.
    #[serde(default = "default_cloudflare_endpoint")]
    pub endpoint: String,

    /// How far back each poll looks.
    #[serde(default = "default_lookback")]
    pub lookback_seconds: u64,

    /// Maximum events per poll.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

fn default_cloudflare_endpoint() -> String {
    "https://api.cloudflare.com/client/v4/graphql".to_string()
}

/// Longest lookback accepted; Cloudflare keeps firewall events for about a week.
pub const MAX_LOOKBACK_SECONDS: u64 = 7 * 24 * 60 * 60;

fn default_lookback() -> u64 {
    3 * 60 * 60
}

fn default_page_size() -> u32 {
    1000
}

/// AbuseIPDB reputation sink.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AbuseIPDBConfig {
    /// API key (supports ${ENV_VAR} syntax).
    pub api_key: String,

    /// Report endpoint.
    #[serde(default = "default_abuseipdb_endpoint")]
    pub endpoint: String,

    /// Comma-separated category codes.
    #[serde(default = "default_categories")]
    pub categories: String,

    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

fn default_abuseipdb_endpoint() -> String {
    "https://api.abuseipdb.com/api/v2/report".to_string()
}

fn default_categories() -> String {
    "19".to_string()
}

/// Own-address lookup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SelfIpConfig {
    /// Endpoint returning `{"success": true, "message": "<ip>"}`.
    #[serde(default = "default_self_ip_url")]
    pub url: String,

    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

impl Default for SelfIpConfig {
    fn default() -> Self {
        Self {
            url: default_self_ip_url(),
            timeout_ms: default_timeout(),
        }
    }
}

fn default_self_ip_url() -> String {
    "https://api.sefinek.net/api/v2/ip".to_string()
}

/// Forwarding of reported entries to the aggregation API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecondarySyncConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Aggregation endpoint.
    #[serde(default = "default_sync_url")]
    pub url: String,

    /// Shared secret, sent as a bearer token (supports ${ENV_VAR} syntax).
    #[serde(default)]
    pub secret: String,

    /// Time between sync passes.
    #[serde(default = "default_sync_interval")]
    pub interval_seconds: u64,

    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

impl Default for SecondarySyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_sync_url(),
            secret: String::new(),
            interval_seconds: default_sync_interval(),
            timeout_ms: default_timeout(),
        }
    }
}

impl SecondarySyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

fn default_sync_url() -> String {
    "https://api.sefinek.net/api/v2/cloudflare-waf-abuseipdb/post".to_string()
}

fn default_sync_interval() -> u64 {
    60 * 60
}

fn default_timeout() -> u64 {
    12000
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let expanded = expand_env_vars(content)?;
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cloudflare.api_token.is_empty() {
            anyhow::bail!("cloudflare.api_token is empty");
        }
        if self.cloudflare.zone_id.is_empty() {
            anyhow::bail!("cloudflare.zone_id is empty");
        }
        if self.cloudflare.lookback_seconds == 0
            || self.cloudflare.lookback_seconds > MAX_LOOKBACK_SECONDS
        {
            anyhow::bail!(
                "cloudflare.lookback_seconds must be between 1 and {} (7 days)",
                MAX_LOOKBACK_SECONDS
            );
        }
        if self.cloudflare.page_size == 0 {
            anyhow::bail!("cloudflare.page_size must be > 0");
        }
        if self.abuseipdb.api_key.is_empty() {
            anyhow::bail!("abuseipdb.api_key is empty");
        }

        if self.settings.cycle_interval_seconds == 0 {
            anyhow::bail!("settings.cycle_interval_seconds must be > 0");
        }
        if self.settings.reported_ip_cooldown_seconds == 0 {
            anyhow::bail!("settings.reported_ip_cooldown_seconds must be > 0");
        }
        if self.settings.self_ip_refresh_seconds == 0 {
            anyhow::bail!("settings.self_ip_refresh_seconds must be > 0");
        }
        if self.settings.max_uri_length == 0 {
            anyhow::bail!("settings.max_uri_length must be > 0");
        }

        let header_len = HEADER.len() as u64 + 1;
        if self.action_log.max_bytes <= header_len {
            anyhow::bail!(
                "action_log.max_bytes ({}) must be larger than the log header ({} bytes)",
                self.action_log.max_bytes,
                header_len
            );
        }

        if self.secondary_sync.enabled {
            if self.secondary_sync.secret.is_empty() {
                anyhow::bail!("secondary_sync is enabled but secret is empty");
            }
            if self.secondary_sync.interval_seconds == 0 {
                anyhow::bail!("secondary_sync.interval_seconds must be > 0");
            }
        }

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# WAF Abuse Reporter Configuration

settings:
  cycle_interval_seconds: 10800      # Poll Cloudflare every 3 hours
  reported_ip_cooldown_seconds: 25200 # Report an address at most every 7 hours
  # rate_limited_cooldown_seconds: 43200  # Separate window after a 429 (default: same as above)
  max_uri_length: 1000               # Longer host + path is not reported
  success_cooldown_ms: 2000          # Pause after each successful report
  self_ip_refresh_seconds: 540       # Refresh own address every 9 minutes

action_log:
  path: "reported_ips.csv"
  max_bytes: 4194304                 # Start a fresh log beyond 4 MiB

cloudflare:
  api_token: "${CLOUDFLARE_API_KEY}" # Needs Zone.Analytics.Read
  email: "${CLOUDFLARE_EMAIL}"
  zone_id: "${CLOUDFLARE_ZONE_ID}"
  lookback_seconds: 10800
  page_size: 1000
  timeout_ms: 12000

abuseipdb:
  api_key: "${ABUSEIPDB_API_KEY}"
  categories: "19"                   # Bad Web Bot
  timeout_ms: 12000

self_ip:
  url: "https://api.sefinek.net/api/v2/ip"

# Forward reported addresses to the aggregation API (optional)
secondary_sync:
  enabled: false
  url: "https://api.sefinek.net/api/v2/cloudflare-waf-abuseipdb/post"
  secret: "${SEFINEK_API_SECRET}"
  interval_seconds: 3600
"#
        .to_string()
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> anyhow::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")?;
    let expanded = re.replace_all(content, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_default()
    });
    Ok(expanded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
cloudflare:
  api_token: "token"
  zone_id: "zone"
abuseipdb:
  api_key: "key"
"#
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.cycle_interval(), Duration::from_secs(10800));
        assert_eq!(settings.reported_ip_cooldown_seconds, 25200);
        assert_eq!(settings.max_uri_length, 1000);
        assert_eq!(settings.success_cooldown(), Duration::from_secs(2));
        assert_eq!(settings.self_ip_refresh(), Duration::from_secs(540));
        assert!(settings.rate_limited_cooldown_seconds.is_none());
    }

    #[test]
    fn test_default_action_log() {
        let log = ActionLogConfig::default();
        assert_eq!(log.path, PathBuf::from("reported_ips.csv"));
        assert_eq!(log.max_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn test_minimal_config() {
        let config = Config::from_yaml(minimal_yaml()).unwrap();
        assert_eq!(config.cloudflare.page_size, 1000);
        assert_eq!(config.abuseipdb.categories, "19");
        assert!(!config.secondary_sync.enabled);
        assert!(config.cloudflare.email.is_none());
    }

    #[test]
    fn test_cooldown_policy_from_settings() {
        let mut settings = Settings::default();
        let shared = settings.cooldown_policy();
        assert_eq!(
            shared.window_for(crate::action_log::LogAction::TooManyRequests),
            Some(Duration::from_secs(25200))
        );

        settings.rate_limited_cooldown_seconds = Some(60);
        let split = settings.cooldown_policy();
        assert_eq!(
            split.window_for(crate::action_log::LogAction::TooManyRequests),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("WAF_REPORTER_TEST_KEY", "secret123");
        let input = "api_key: \"${WAF_REPORTER_TEST_KEY}\"";
        let result = expand_env_vars(input).unwrap();
        assert_eq!(result, "api_key: \"secret123\"");
        std::env::remove_var("WAF_REPORTER_TEST_KEY");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let input = "api_key: \"${WAF_REPORTER_NONEXISTENT_VAR}\"";
        let result = expand_env_vars(input).unwrap();
        assert_eq!(result, "api_key: \"\"");
    }

    #[test]
    fn test_missing_secret_rejected() {
        let yaml = minimal_yaml().replace("api_key: \"key\"", "api_key: \"\"");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_sync_requires_secret() {
        let yaml = format!("{}\nsecondary_sync:\n  enabled: true\n", minimal_yaml());
        assert!(Config::from_yaml(&yaml).is_err());

        let yaml = format!(
            "{}\nsecondary_sync:\n  enabled: true\n  secret: \"s3cr3t\"\n",
            minimal_yaml()
        );
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config.secondary_sync.interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_tiny_log_ceiling_rejected() {
        let yaml = format!("{}\naction_log:\n  max_bytes: 10\n", minimal_yaml());
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_zero_cooldown_rejected() {
        let yaml = format!(
            "{}\nsettings:\n  reported_ip_cooldown_seconds: 0\n",
            minimal_yaml()
        );
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_zero_refresh_rejected() {
        let yaml = format!("{}\nsettings:\n  self_ip_refresh_seconds: 0\n", minimal_yaml());
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_lookback_bounds() {
        let with_lookback = |secs: u64| {
            minimal_yaml().replace(
                "zone_id: \"zone\"",
                &format!("zone_id: \"zone\"\n  lookback_seconds: {}", secs),
            )
        };

        assert!(Config::from_yaml(&with_lookback(0)).is_err());
        assert!(Config::from_yaml(&with_lookback(MAX_LOOKBACK_SECONDS + 1)).is_err());
        assert!(Config::from_yaml(&with_lookback(100_000_000_000_000_000)).is_err());

        let config = Config::from_yaml(&with_lookback(MAX_LOOKBACK_SECONDS)).unwrap();
        assert_eq!(config.cloudflare.lookback_seconds, MAX_LOOKBACK_SECONDS);
    }

    #[test]
    fn test_example_parses() {
        for var in ["CLOUDFLARE_API_KEY", "CLOUDFLARE_ZONE_ID", "ABUSEIPDB_API_KEY"] {
            std::env::set_var(var, "placeholder");
        }
        let config = Config::from_yaml(&Config::example()).unwrap();
        assert_eq!(config.settings.reported_ip_cooldown_seconds, 25200);
        assert_eq!(config.action_log.max_bytes, 4194304);
    }
}
