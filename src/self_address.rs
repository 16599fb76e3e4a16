//! The operator's own public address.

use crate::clients::{AddressResolver, ClientError};
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Owned, periodically refreshed copy of our own address.
///
/// Readers get the last successfully resolved value; a failed refresh keeps it.
pub struct SelfAddress {
    current: RwLock<Option<IpAddr>>,
    resolver: Arc<dyn AddressResolver>,
}

impl SelfAddress {
    pub fn new(resolver: Arc<dyn AddressResolver>) -> Self {
        Self {
            current: RwLock::new(None),
            resolver,
        }
    }

    /// Last known address, if any lookup has succeeded yet.
    pub fn get(&self) -> Option<IpAddr> {
        self.current.read().ok().and_then(|current| *current)
    }

    /// Replace the known address.
    pub fn set(&self, address: IpAddr) {
        if let Ok(mut current) = self.current.write() {
            *current = Some(address);
        }
    }

    /// Resolve the address again.
    pub async fn refresh(&self) -> Result<IpAddr, ClientError> {
        let address = self.resolver.resolve().await?;
        let previous = self.get();
        self.set(address);

        if previous != Some(address) {
            info!(ip = %address, "Own IP address updated");
        } else {
            debug!(ip = %address, "Own IP address unchanged");
        }
        Ok(address)
    }

    /// Refresh every `interval` until `shutdown` fires.
    pub async fn run_refresher(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }

            if let Err(e) = self.refresh().await {
                warn!(error = %e, "Failed to refresh own IP address");
            }
        }
        debug!("Own IP refresher stopped");
    }
}
