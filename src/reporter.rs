//! Polling orchestrator: fetch, classify, report, record, sleep.

use crate::action_log::{ActionLogEntry, ActionLogStore, AppendOutcome, LogAction};
use crate::clients::{EventSource, ReputationSink};
use crate::cooldown::format_delay;
use crate::decision::{Classification, CycleState, DecisionEngine, SubmitOutcome};
use crate::event::FirewallEvent;
use crate::self_address::SelfAddress;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Counters for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// The event source could not be reached; nothing was processed.
    pub source_failed: bool,
    /// Rows dropped by the source for missing fields.
    pub quarantined: usize,
    pub processed: usize,
    pub submitted: usize,
    pub rate_limited: usize,
    /// Sink failures other than 429.
    pub errors: usize,
    /// Skipped events by reason, whether or not an entry was written.
    pub skipped: BTreeMap<LogAction, usize>,
    /// Entries that could not be written to the action log.
    pub log_failures: usize,
}

impl CycleSummary {
    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }

    pub fn skipped_for(&self, action: LogAction) -> usize {
        self.skipped.get(&action).copied().unwrap_or(0)
    }

    fn count_skip(&mut self, action: LogAction) {
        *self.skipped.entry(action).or_insert(0) += 1;
    }
}

/// Drives poll cycles strictly sequentially.
pub struct Reporter {
    source: Arc<dyn EventSource>,
    sink: Arc<dyn ReputationSink>,
    store: Arc<ActionLogStore>,
    self_address: Arc<SelfAddress>,
    engine: DecisionEngine,
    success_cooldown: Duration,
    cycle_interval: Duration,
}

impl Reporter {
    pub fn new(
        source: Arc<dyn EventSource>,
        sink: Arc<dyn ReputationSink>,
        store: Arc<ActionLogStore>,
        self_address: Arc<SelfAddress>,
        engine: DecisionEngine,
    ) -> Self {
        Self {
            source,
            sink,
            store,
            self_address,
            engine,
            success_cooldown: Duration::from_secs(2),
            cycle_interval: Duration::from_secs(3 * 60 * 60),
        }
    }

    /// Pause after each successful report.
    pub fn with_success_cooldown(mut self, cooldown: Duration) -> Self {
        self.success_cooldown = cooldown;
        self
    }

    /// Sleep between cycles.
    pub fn with_cycle_interval(mut self, interval: Duration) -> Self {
        self.cycle_interval = interval;
        self
    }

    /// Run cycles until `shutdown` fires. An in-flight cycle always completes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.run_cycle().await;

            if *shutdown.borrow() {
                break;
            }

            debug!(next_in = %format_delay(self.cycle_interval), "Waiting for next cycle");
            tokio::select! {
                _ = tokio::time::sleep(self.cycle_interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("Reporter stopped");
    }

    /// Run one full cycle.
    pub async fn run_cycle(&self) -> CycleSummary {
        info!("Starting reporting cycle");
        let mut summary = CycleSummary::default();

        let batch = match self.source.fetch_events().await {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "Failed to fetch firewall events, skipping cycle");
                summary.source_failed = true;
                return summary;
            }
        };
        summary.quarantined = batch.quarantined;
        info!(events = batch.events.len(), quarantined = batch.quarantined, "Fetched firewall events");

        let mut history = match self.store.read_all() {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, path = %self.store.path().display(), "Failed to read action log, skipping cycle");
                return summary;
            }
        };

        let mut cycle = CycleState::new();
        for event in &batch.events {
            summary.processed += 1;
            self.process_event(event, &mut history, &mut cycle, &mut summary).await;
        }

        info!(
            processed = summary.processed,
            submitted = summary.submitted,
            skipped = summary.skipped_total(),
            already_reported = summary.skipped_for(LogAction::AlreadyReportedSkipped),
            images = summary.skipped_for(LogAction::ImageSkipped),
            self_address = summary.skipped_for(LogAction::SelfAddress),
            invalid_uri = summary.skipped_for(LogAction::MissingUri)
                + summary.skipped_for(LogAction::UriTooLong),
            rate_limited = summary.rate_limited,
            errors = summary.errors,
            quarantined = summary.quarantined,
            "Reporting cycle finished"
        );

        summary
    }

    async fn process_event(
        &self,
        event: &FirewallEvent,
        history: &mut Vec<ActionLogEntry>,
        cycle: &mut CycleState,
        summary: &mut CycleSummary,
    ) {
        let now = Utc::now();
        let own = self.self_address.get();
        let classification = self.engine.classify(event, own, history, cycle, now);
        let uri = event.uri();

        match classification {
            Classification::SelfAddress => {
                debug!(ip = %event.address, ray_id = %event.ray_id, "Skipping own IP address");
                summary.count_skip(LogAction::SelfAddress);
            }
            Classification::Cooldown { elapsed } => {
                debug!(
                    ip = %event.address,
                    ray_id = %event.ray_id,
                    last_report = %format_delay(elapsed),
                    "Skipping, already reported recently"
                );
                summary.count_skip(LogAction::AlreadyReportedSkipped);
            }
            Classification::Image { show_notice, .. } => {
                if show_notice {
                    info!("Skipping image requests in this cycle");
                }
                debug!(ip = %event.address, uri = %uri, "Skipping image request");
                summary.count_skip(LogAction::ImageSkipped);
            }
            Classification::MissingUri => {
                debug!(ip = %event.address, ray_id = %event.ray_id, "Skipping event without URI");
                summary.count_skip(LogAction::MissingUri);
            }
            Classification::UriTooLong { length } => {
                debug!(
                    ip = %event.address,
                    ray_id = %event.ray_id,
                    length,
                    "Skipping event with oversized URI"
                );
                summary.count_skip(LogAction::UriTooLong);
            }
            Classification::Submit => {
                self.submit(event, &uri, history, summary).await;
                return;
            }
        }

        if let Some(action) = classification.log_action() {
            self.record(log_entry(event, action, now), history, summary);
        }
    }

    async fn submit(
        &self,
        event: &FirewallEvent,
        uri: &str,
        history: &mut Vec<ActionLogEntry>,
        summary: &mut CycleSummary,
    ) {
        let result = self.sink.report(event).await;
        let outcome = SubmitOutcome::from_result(&result);

        match outcome {
            SubmitOutcome::Reported => {
                info!(ip = %event.address, uri = %uri, sink = self.sink.name(), "Reported");
                summary.submitted += 1;
            }
            SubmitOutcome::RateLimited => {
                warn!(ip = %event.address, uri = %uri, sink = self.sink.name(), "Rate limited while reporting");
                summary.rate_limited += 1;
            }
            SubmitOutcome::Failed => {
                if let Err(e) = &result {
                    error!(ip = %event.address, uri = %uri, sink = self.sink.name(), error = %e, "Failed to report");
                }
                summary.errors += 1;
            }
        }

        if let Some(action) = outcome.log_action() {
            self.record(log_entry(event, action, Utc::now()), history, summary);
        }

        if outcome == SubmitOutcome::Reported && !self.success_cooldown.is_zero() {
            tokio::time::sleep(self.success_cooldown).await;
        }
    }

    /// Append to the store and to this cycle's view of the log.
    fn record(&self, entry: ActionLogEntry, history: &mut Vec<ActionLogEntry>, summary: &mut CycleSummary) {
        match self.store.append(&entry) {
            Ok(AppendOutcome::Appended) => {}
            Ok(AppendOutcome::Rotated) => history.clear(),
            Err(e) => {
                error!(error = %e, ray_id = %entry.ray_id, action = %entry.action, "Failed to write action log entry");
                summary.log_failures += 1;
            }
        }
        history.push(entry);
    }
}

fn log_entry(event: &FirewallEvent, action: LogAction, now: DateTime<Utc>) -> ActionLogEntry {
    ActionLogEntry {
        timestamp: now,
        ray_id: event.ray_id.clone(),
        address: event.address,
        hostname: event.hostname.clone(),
        endpoint: event.path.clone(),
        user_agent: event.user_agent.clone(),
        action,
        country: event.country.clone(),
        secondary_synced: false,
    }
}
