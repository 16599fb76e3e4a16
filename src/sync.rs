//! Periodic forwarding of reported entries to the aggregation API.

use crate::action_log::{ActionLogEntry, ActionLogStore, LogAction};
use crate::clients::AggregationSink;
use crate::self_address::SelfAddress;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Result of one sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing left to forward.
    Idle,
    /// The batch was accepted and its entries flagged.
    Synced {
        sent: usize,
        accepted: usize,
        marked: usize,
    },
    /// Reading the log, sending, or flagging failed; retried next pass.
    Failed,
}

/// Unsynced `REPORTED` entries, excluding our own address, one per address.
///
/// The first entry for each address wins.
pub fn select_batch(entries: &[ActionLogEntry], self_address: Option<IpAddr>) -> Vec<ActionLogEntry> {
    let mut seen = HashSet::new();
    entries
        .iter()
        .filter(|e| e.action == LogAction::Reported)
        .filter(|e| !e.secondary_synced)
        .filter(|e| Some(e.address) != self_address)
        .filter(|e| seen.insert(e.address))
        .cloned()
        .collect()
}

/// Forwards reported entries on its own timer.
pub struct SyncExporter {
    store: Arc<ActionLogStore>,
    sink: Arc<dyn AggregationSink>,
    self_address: Arc<SelfAddress>,
}

impl SyncExporter {
    pub fn new(
        store: Arc<ActionLogStore>,
        sink: Arc<dyn AggregationSink>,
        self_address: Arc<SelfAddress>,
    ) -> Self {
        Self {
            store,
            sink,
            self_address,
        }
    }

    /// Run one pass: select, send, flag.
    pub async fn sync_once(&self) -> SyncOutcome {
        let entries = match self.store.read_all() {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "Failed to read action log for sync");
                return SyncOutcome::Failed;
            }
        };

        let batch = select_batch(&entries, self.self_address.get());
        if batch.is_empty() {
            debug!("No reported entries waiting for sync");
            return SyncOutcome::Idle;
        }

        let accepted = match self.sink.submit(&batch).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, entries = batch.len(), "Failed to send entries to aggregation API");
                return SyncOutcome::Failed;
            }
        };

        let ray_ids: Vec<&str> = batch.iter().map(|e| e.ray_id.as_str()).collect();
        let marked = match self.store.mark_synced_many(&ray_ids) {
            Ok(marked) => marked,
            Err(e) => {
                error!(error = %e, "Failed to flag synced entries");
                return SyncOutcome::Failed;
            }
        };

        info!(sent = batch.len(), accepted, marked, "Entries sent to aggregation API");
        SyncOutcome::Synced {
            sent: batch.len(),
            accepted,
            marked,
        }
    }

    /// Sync immediately, then every `interval`, until `shutdown` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.sync_once().await;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("Sync exporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientError;
    use crate::self_address::tests::QueuedResolver;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn entry(ray_id: &str, ip: &str, action: LogAction, synced: bool) -> ActionLogEntry {
        ActionLogEntry {
            timestamp: Utc.with_ymd_and_hms(2024, 11, 3, 12, 0, 0).unwrap(),
            ray_id: ray_id.to_string(),
            address: ip.parse().unwrap(),
            hostname: "example.com".to_string(),
            endpoint: "/wp-login.php".to_string(),
            user_agent: "curl/8.4.0".to_string(),
            action,
            country: "NL".to_string(),
            secondary_synced: synced,
        }
    }

    struct FakeAggregator {
        batches: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    impl FakeAggregator {
        fn new(fail: bool) -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl AggregationSink for FakeAggregator {
        async fn submit(&self, batch: &[ActionLogEntry]) -> Result<usize, ClientError> {
            if self.fail {
                return Err(ClientError::Timeout);
            }
            self.batches
                .lock()
                .unwrap()
                .push(batch.iter().map(|e| e.ray_id.clone()).collect());
            Ok(batch.len())
        }
    }

    fn exporter(
        dir: &TempDir,
        entries: &[ActionLogEntry],
        aggregator: Arc<FakeAggregator>,
        own: Option<&str>,
    ) -> (Arc<ActionLogStore>, SyncExporter) {
        let store = Arc::new(ActionLogStore::open(dir.path().join("log.csv"), 1 << 20).unwrap());
        for e in entries {
            store.append(e).unwrap();
        }
        let self_address = Arc::new(SelfAddress::new(Arc::new(QueuedResolver::new(vec![]))));
        if let Some(own) = own {
            self_address.set(own.parse().unwrap());
        }
        let exporter = SyncExporter::new(store.clone(), aggregator, self_address);
        (store, exporter)
    }

    #[test]
    fn test_select_batch_filters_and_dedupes() {
        let entries = vec![
            entry("r1", "1.2.3.4", LogAction::Reported, false),
            entry("r2", "1.2.3.4", LogAction::Reported, false),
            entry("r3", "5.6.7.8", LogAction::TooManyRequests, false),
            entry("r4", "9.9.9.9", LogAction::Reported, true),
            entry("r5", "203.0.113.9", LogAction::Reported, false),
            entry("r6", "8.8.4.4", LogAction::Reported, false),
        ];

        let batch = select_batch(&entries, Some("203.0.113.9".parse().unwrap()));
        let ids: Vec<&str> = batch.iter().map(|e| e.ray_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r6"]);
    }

    #[tokio::test]
    async fn test_sync_flags_only_batch_entries() {
        let dir = TempDir::new().unwrap();
        let aggregator = Arc::new(FakeAggregator::new(false));
        let (store, exporter) = exporter(
            &dir,
            &[
                entry("r1", "1.2.3.4", LogAction::Reported, false),
                entry("r2", "1.2.3.4", LogAction::Reported, false),
                entry("r3", "5.6.7.8", LogAction::ImageSkipped, false),
            ],
            aggregator.clone(),
            None,
        );

        assert_eq!(
            exporter.sync_once().await,
            SyncOutcome::Synced {
                sent: 1,
                accepted: 1,
                marked: 1
            }
        );

        let flags: Vec<(String, bool)> = store
            .read_all()
            .unwrap()
            .into_iter()
            .map(|e| (e.ray_id, e.secondary_synced))
            .collect();
        assert_eq!(
            flags,
            vec![
                ("r1".to_string(), true),
                ("r2".to_string(), false),
                ("r3".to_string(), false),
            ]
        );

        // r2 is picked up on the next pass
        exporter.sync_once().await;
        assert_eq!(
            *aggregator.batches.lock().unwrap(),
            vec![vec!["r1".to_string()], vec!["r2".to_string()]]
        );
        assert_eq!(exporter.sync_once().await, SyncOutcome::Idle);
    }

    #[tokio::test]
    async fn test_failed_send_leaves_entries_unsynced() {
        let dir = TempDir::new().unwrap();
        let (store, exporter) = exporter(
            &dir,
            &[entry("r1", "1.2.3.4", LogAction::Reported, false)],
            Arc::new(FakeAggregator::new(true)),
            None,
        );

        assert_eq!(exporter.sync_once().await, SyncOutcome::Failed);
        assert!(!store.read_all().unwrap()[0].secondary_synced);
    }

    #[tokio::test]
    async fn test_own_address_is_not_synced() {
        let dir = TempDir::new().unwrap();
        let aggregator = Arc::new(FakeAggregator::new(false));
        let (_store, exporter) = exporter(
            &dir,
            &[entry("r1", "203.0.113.9", LogAction::Reported, false)],
            aggregator.clone(),
            Some("203.0.113.9"),
        );

        assert_eq!(exporter.sync_once().await, SyncOutcome::Idle);
        assert!(aggregator.batches.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_syncs_immediately_then_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let aggregator = Arc::new(FakeAggregator::new(false));
        let (store, exporter) = exporter(
            &dir,
            &[entry("r1", "1.2.3.4", LogAction::Reported, false)],
            aggregator.clone(),
            None,
        );
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(Arc::new(exporter).run(Duration::from_secs(3600), rx));
        while aggregator.batches.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(*aggregator.batches.lock().unwrap(), vec![vec!["r1".to_string()]]);
        assert!(store.read_all().unwrap()[0].secondary_synced);
    }
}
