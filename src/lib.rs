//! WAF abuse reporter.
//!
//! Polls Cloudflare for recently blocked requests and reports the offending
//! client addresses to AbuseIPDB, without reporting any address more often
//! than the cooldown allows and without reporting noise.
//!
//! # Features
//!
//! - **Persisted decisions** - Every decision lands in a size-bounded CSV log,
//!   so cooldowns survive restarts
//! - **Cooldown** - Reported and rate-limited addresses are held back for a window
//! - **Noise filters** - Own address, image fetches and invalid URIs are never reported
//! - **Secondary sync** - Reported addresses can be forwarded to an aggregation API
//!
//! # Example Configuration
//!
//! ```yaml
//! settings:
//!   reported_ip_cooldown_seconds: 25200
//!
//! cloudflare:
//!   api_token: "${CLOUDFLARE_API_KEY}"
//!   zone_id: "${CLOUDFLARE_ZONE_ID}"
//!
//! abuseipdb:
//!   api_key: "${ABUSEIPDB_API_KEY}"
//! ```

pub mod action_log;
pub mod clients;
pub mod config;
pub mod cooldown;
pub mod decision;
pub mod event;
pub mod reporter;
pub mod self_address;
pub mod sync;

pub use config::Config;
pub use reporter::Reporter;
pub use sync::SyncExporter;
