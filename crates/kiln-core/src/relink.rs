use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use kiln_common::config::ClusterConfig;

use crate::locator::Locator;

/// Periodic cluster relink loop.
///
/// Simply tries linking the whole predefined peer list on every timer
/// tick. Ticks never overlap: the next one is scheduled only after the
/// current tick's attempts have been handed off. Endpoint failures are
/// the locator's problem.
pub struct Relinker {
    endpoints: HashMap<String, Vec<String>>,
    interval: Duration,
    locator: Arc<dyn Locator>,
}

impl Relinker {
    pub fn new(
        endpoints: HashMap<String, Vec<String>>,
        interval: Duration,
        locator: Arc<dyn Locator>,
    ) -> Self {
        Self {
            endpoints,
            interval,
            locator,
        }
    }

    pub fn from_config(config: &ClusterConfig, locator: Arc<dyn Locator>) -> Self {
        Self::new(
            config.endpoints.clone(),
            Duration::from_millis(config.interval_ms),
            locator,
        )
    }

    /// Starts the relink task. It runs until the token is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    async fn run(self, shutdown: CancellationToken) {
        if self.endpoints.is_empty() {
            return;
        }

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.announce(),
            }
        }
    }

    fn announce(&self) {
        for (label, endpoints) in &self.endpoints {
            for endpoint in endpoints {
                self.locator.link(label, endpoint);
            }
        }
    }
}
