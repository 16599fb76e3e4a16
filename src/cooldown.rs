//! Cooldown policy over the action log.

use crate::action_log::{ActionLogEntry, LogAction};
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::time::Duration;

/// Outcome of a cooldown lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownStatus {
    /// Whether a new report must be held back.
    pub blocked: bool,
    /// Time since the matching report-establishing entry, if one exists.
    pub elapsed: Option<Duration>,
}

impl CooldownStatus {
    fn free() -> Self {
        Self {
            blocked: false,
            elapsed: None,
        }
    }
}

/// Decides whether an address may be reported again.
///
/// `REPORTED` and `TOO_MANY_REQUESTS` entries open a window; by default both
/// share `window`. Setting a separate rate-limited window applies it to
/// `TOO_MANY_REQUESTS` entries only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    window: Duration,
    rate_limited_window: Option<Duration>,
}

impl CooldownPolicy {
    /// Create a policy where reports and rate-limited attempts share one window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            rate_limited_window: None,
        }
    }

    /// Use a separate window for rate-limited attempts.
    pub fn with_rate_limited_window(mut self, window: Duration) -> Self {
        self.rate_limited_window = Some(window);
        self
    }

    /// The window opened by `action`, or `None` if it opens no window.
    pub fn window_for(&self, action: LogAction) -> Option<Duration> {
        match action {
            LogAction::Reported => Some(self.window),
            LogAction::TooManyRequests => Some(self.rate_limited_window.unwrap_or(self.window)),
            _ => None,
        }
    }

    /// Check `address` / `ray_id` against the log at time `now`.
    ///
    /// The most recent report-establishing entry matching either the ray id or
    /// the address decides.
    pub fn check(
        &self,
        address: IpAddr,
        ray_id: &str,
        log: &[ActionLogEntry],
        now: DateTime<Utc>,
    ) -> CooldownStatus {
        let latest = log
            .iter()
            .filter(|entry| entry.action.starts_cooldown())
            .filter(|entry| entry.ray_id == ray_id || entry.address == address)
            .max_by_key(|entry| entry.timestamp);

        let Some(entry) = latest else {
            return CooldownStatus::free();
        };
        let Some(window) = self.window_for(entry.action) else {
            return CooldownStatus::free();
        };

        // Entries stamped in the future count as just written.
        let elapsed = (now - entry.timestamp).to_std().unwrap_or(Duration::ZERO);

        CooldownStatus {
            blocked: elapsed < window,
            elapsed: Some(elapsed),
        }
    }
}

/// Format a duration as "2 hours, 5 minutes, 1 second".
pub fn format_delay(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total / 60) % 60;
    let seconds = total % 60;

    let parts: Vec<String> = [(hours, "hour"), (minutes, "minute"), (seconds, "second")]
        .into_iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| {
            if value == 1 {
                format!("{} {}", value, unit)
            } else {
                format!("{} {}s", value, unit)
            }
        })
        .collect();

    if parts.is_empty() {
        "0 seconds".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const HOUR: Duration = Duration::from_secs(3600);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 3, 12, 0, 0).unwrap()
    }

    fn entry(ray_id: &str, ip: &str, action: LogAction, at: DateTime<Utc>) -> ActionLogEntry {
        ActionLogEntry {
            timestamp: at,
            ray_id: ray_id.to_string(),
            address: ip.parse().unwrap(),
            hostname: "example.com".to_string(),
            endpoint: "/admin".to_string(),
            user_agent: "curl/8.4.0".to_string(),
            action,
            country: "US".to_string(),
            secondary_synced: false,
        }
    }

    fn hours(h: i64) -> chrono::Duration {
        chrono::Duration::hours(h)
    }

    #[test]
    fn test_empty_log_is_free() {
        let policy = CooldownPolicy::new(6 * HOUR);
        let status = policy.check("1.2.3.4".parse().unwrap(), "r1", &[], t0());
        assert!(!status.blocked);
        assert!(status.elapsed.is_none());
    }

    #[test]
    fn test_reported_blocks_within_window() {
        let policy = CooldownPolicy::new(6 * HOUR);
        let log = vec![entry("r1", "1.2.3.4", LogAction::Reported, t0())];

        let status = policy.check("1.2.3.4".parse().unwrap(), "r2", &log, t0() + hours(3));
        assert!(status.blocked);
        assert_eq!(status.elapsed, Some(3 * HOUR));

        let status = policy.check("1.2.3.4".parse().unwrap(), "r2", &log, t0() + hours(7));
        assert!(!status.blocked);
        assert_eq!(status.elapsed, Some(7 * HOUR));
    }

    #[test]
    fn test_window_boundary_is_free() {
        let policy = CooldownPolicy::new(6 * HOUR);
        let log = vec![entry("r1", "1.2.3.4", LogAction::Reported, t0())];

        let just_before = t0() + hours(6) - chrono::Duration::milliseconds(1);
        assert!(policy.check("1.2.3.4".parse().unwrap(), "r2", &log, just_before).blocked);
        assert!(!policy.check("1.2.3.4".parse().unwrap(), "r2", &log, t0() + hours(6)).blocked);
    }

    #[test]
    fn test_rate_limited_blocks_like_report() {
        let policy = CooldownPolicy::new(6 * HOUR);
        let log = vec![entry("r1", "5.6.7.8", LogAction::TooManyRequests, t0())];

        assert!(policy.check("5.6.7.8".parse().unwrap(), "r2", &log, t0() + hours(1)).blocked);
    }

    #[test]
    fn test_ray_id_match_blocks_other_address() {
        let policy = CooldownPolicy::new(6 * HOUR);
        let log = vec![entry("r1", "1.2.3.4", LogAction::Reported, t0())];

        assert!(policy.check("9.9.9.9".parse().unwrap(), "r1", &log, t0() + hours(1)).blocked);
        assert!(!policy.check("9.9.9.9".parse().unwrap(), "r9", &log, t0() + hours(1)).blocked);
    }

    #[test]
    fn test_skip_actions_never_block() {
        let policy = CooldownPolicy::new(6 * HOUR);
        let log: Vec<ActionLogEntry> = [
            LogAction::MissingUri,
            LogAction::UriTooLong,
            LogAction::SelfAddress,
            LogAction::ImageSkipped,
            LogAction::AlreadyReportedSkipped,
        ]
        .into_iter()
        .map(|action| entry("r1", "1.2.3.4", action, t0()))
        .collect();

        assert!(!policy.check("1.2.3.4".parse().unwrap(), "r1", &log, t0()).blocked);
    }

    #[test]
    fn test_most_recent_entry_decides() {
        let policy = CooldownPolicy::new(6 * HOUR);
        let log = vec![
            entry("r2", "1.2.3.4", LogAction::Reported, t0() + hours(5)),
            entry("r1", "1.2.3.4", LogAction::Reported, t0()),
        ];

        let status = policy.check("1.2.3.4".parse().unwrap(), "r3", &log, t0() + hours(8));
        assert!(status.blocked);
        assert_eq!(status.elapsed, Some(3 * HOUR));
    }

    #[test]
    fn test_future_timestamp_counts_as_now() {
        let policy = CooldownPolicy::new(6 * HOUR);
        let log = vec![entry("r1", "1.2.3.4", LogAction::Reported, t0() + hours(1))];

        let status = policy.check("1.2.3.4".parse().unwrap(), "r2", &log, t0());
        assert!(status.blocked);
        assert_eq!(status.elapsed, Some(Duration::ZERO));
    }

    #[test]
    fn test_split_rate_limited_window() {
        let policy = CooldownPolicy::new(6 * HOUR).with_rate_limited_window(12 * HOUR);
        let log = vec![entry("r1", "5.6.7.8", LogAction::TooManyRequests, t0())];

        assert!(policy.check("5.6.7.8".parse().unwrap(), "r2", &log, t0() + hours(8)).blocked);
        assert!(!policy.check("5.6.7.8".parse().unwrap(), "r2", &log, t0() + hours(12)).blocked);
        assert_eq!(policy.window_for(LogAction::Reported), Some(6 * HOUR));
        assert_eq!(policy.window_for(LogAction::ImageSkipped), None);
    }

    #[test]
    fn test_format_delay() {
        assert_eq!(format_delay(Duration::ZERO), "0 seconds");
        assert_eq!(format_delay(Duration::from_secs(1)), "1 second");
        assert_eq!(format_delay(Duration::from_secs(3600 + 120)), "1 hour, 2 minutes");
        assert_eq!(format_delay(Duration::from_secs(7 * 3600 + 61)), "7 hours, 1 minute, 1 second");
        assert_eq!(format_delay(Duration::from_millis(900)), "0 seconds");
    }
}
