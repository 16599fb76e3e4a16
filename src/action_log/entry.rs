//! Action log record types.

use chrono::{DateTime, Utc};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Decision recorded for one classified event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogAction {
    /// Accepted by the reputation service.
    Reported,
    /// The reputation service answered 429.
    TooManyRequests,
    /// Host and path were both empty.
    MissingUri,
    /// Host and path exceeded the configured maximum length.
    UriTooLong,
    /// The event came from our own address.
    SelfAddress,
    /// Static image fetch.
    ImageSkipped,
    /// The address (or the event) is still under cooldown.
    AlreadyReportedSkipped,
}

impl LogAction {
    /// All actions, in log declaration order.
    pub const ALL: [LogAction; 7] = [
        LogAction::Reported,
        LogAction::TooManyRequests,
        LogAction::MissingUri,
        LogAction::UriTooLong,
        LogAction::SelfAddress,
        LogAction::ImageSkipped,
        LogAction::AlreadyReportedSkipped,
    ];

    /// Name written to the `Action` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogAction::Reported => "REPORTED",
            LogAction::TooManyRequests => "TOO_MANY_REQUESTS",
            LogAction::MissingUri => "MISSING_URI",
            LogAction::UriTooLong => "URI_TOO_LONG",
            LogAction::SelfAddress => "SELF_ADDRESS",
            LogAction::ImageSkipped => "IMAGE_SKIPPED",
            LogAction::AlreadyReportedSkipped => "ALREADY_REPORTED_SKIPPED",
        }
    }

    /// Whether this action opens a cooldown window for the address.
    pub fn starts_cooldown(&self) -> bool {
        matches!(self, LogAction::Reported | LogAction::TooManyRequests)
    }
}

impl fmt::Display for LogAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when an `Action` column holds an unknown value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAction(pub String);

impl fmt::Display for UnknownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown action: {}", self.0)
    }
}

impl std::error::Error for UnknownAction {}

impl FromStr for LogAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogAction::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

/// One persisted decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub ray_id: String,
    pub address: IpAddr,
    pub hostname: String,
    pub endpoint: String,
    pub user_agent: String,
    pub action: LogAction,
    pub country: String,
    /// Whether the entry was forwarded to the secondary aggregation API.
    pub secondary_synced: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names_parse_back() {
        for action in LogAction::ALL {
            assert_eq!(action.as_str().parse::<LogAction>(), Ok(action));
        }
    }

    #[test]
    fn test_unknown_action() {
        let err = "Reported".parse::<LogAction>().unwrap_err();
        assert_eq!(err, UnknownAction("Reported".to_string()));
    }

    #[test]
    fn test_only_report_outcomes_start_cooldown() {
        let starting: Vec<LogAction> = LogAction::ALL
            .into_iter()
            .filter(LogAction::starts_cooldown)
            .collect();
        assert_eq!(starting, vec![LogAction::Reported, LogAction::TooManyRequests]);
    }
}
