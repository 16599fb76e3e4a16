//! Classification of firewall events into reporting decisions.
//!
//! Rules are applied in a fixed order and the first match wins:
//!
//! 1. our own address is never reported
//! 2. addresses under cooldown are skipped
//! 3. static image fetches are skipped
//! 4. empty or oversized URIs are rejected
//! 5. everything else is submitted

use crate::action_log::{ActionLogEntry, LogAction};
use crate::clients::ClientError;
use crate::cooldown::CooldownPolicy;
use crate::event::FirewallEvent;
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::time::Duration;

/// Path extensions treated as static image fetches.
pub const IMAGE_EXTENSIONS: [&str; 7] = [".png", ".jpg", ".jpeg", ".gif", ".bmp", ".svg", ".webp"];

/// Whether `path` requests an image.
pub fn is_image_request(path: &str) -> bool {
    let lower = path.to_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// State shared by every classification within one poll cycle.
#[derive(Debug, Default)]
pub struct CycleState {
    image_notice_shown: bool,
}

impl CycleState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Result of classifying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    SelfAddress,
    Cooldown {
        elapsed: Duration,
    },
    Image {
        /// No `IMAGE_SKIPPED` entry exists yet for this address.
        first_for_address: bool,
        /// The once-per-cycle image notice should be emitted.
        show_notice: bool,
    },
    MissingUri,
    UriTooLong {
        length: usize,
    },
    Submit,
}

impl Classification {
    /// Entry to persist for this classification, if any.
    ///
    /// `Submit` is persisted later, from the submission result.
    pub fn log_action(&self) -> Option<LogAction> {
        match self {
            Classification::SelfAddress => Some(LogAction::SelfAddress),
            Classification::Cooldown { .. } => Some(LogAction::AlreadyReportedSkipped),
            Classification::Image {
                first_for_address: true,
                ..
            } => Some(LogAction::ImageSkipped),
            Classification::Image { .. } => None,
            Classification::MissingUri => Some(LogAction::MissingUri),
            Classification::UriTooLong { .. } => Some(LogAction::UriTooLong),
            Classification::Submit => None,
        }
    }
}

/// Outcome of a submission to the reputation sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Reported,
    RateLimited,
    /// Transport error or a non-429 failure status.
    Failed,
}

impl SubmitOutcome {
    /// Map a sink response onto an outcome.
    pub fn from_result(result: &Result<(), ClientError>) -> Self {
        match result {
            Ok(()) => SubmitOutcome::Reported,
            Err(ClientError::RateLimited) => SubmitOutcome::RateLimited,
            Err(_) => SubmitOutcome::Failed,
        }
    }

    /// Entry to persist. Failures are never persisted: they say nothing
    /// about the address and must not open a cooldown.
    pub fn log_action(&self) -> Option<LogAction> {
        match self {
            SubmitOutcome::Reported => Some(LogAction::Reported),
            SubmitOutcome::RateLimited => Some(LogAction::TooManyRequests),
            SubmitOutcome::Failed => None,
        }
    }
}

/// Applies the fixed rule order to incoming events.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    policy: CooldownPolicy,
    max_uri_length: usize,
}

impl DecisionEngine {
    pub fn new(policy: CooldownPolicy, max_uri_length: usize) -> Self {
        Self {
            policy,
            max_uri_length,
        }
    }

    /// Classify `event` against the log as of `now`.
    pub fn classify(
        &self,
        event: &FirewallEvent,
        self_address: Option<IpAddr>,
        log: &[ActionLogEntry],
        cycle: &mut CycleState,
        now: DateTime<Utc>,
    ) -> Classification {
        if self_address == Some(event.address) {
            return Classification::SelfAddress;
        }

        let cooldown = self.policy.check(event.address, &event.ray_id, log, now);
        if cooldown.blocked {
            return Classification::Cooldown {
                elapsed: cooldown.elapsed.unwrap_or_default(),
            };
        }

        if is_image_request(&event.path) {
            let first_for_address = !log
                .iter()
                .any(|e| e.action == LogAction::ImageSkipped && e.address == event.address);
            let show_notice = !cycle.image_notice_shown;
            cycle.image_notice_shown = true;
            return Classification::Image {
                first_for_address,
                show_notice,
            };
        }

        let length = event.uri().chars().count();
        if length == 0 {
            return Classification::MissingUri;
        }
        if length > self.max_uri_length {
            return Classification::UriTooLong { length };
        }

        Classification::Submit
    }
}
