//! Connectivity reporting.
//!
//! `NetworkMonitor` is the single source of reachability for every orchestrator. Platform
//! integrations call `report` on OS connectivity callbacks; `HttpProbe` is a fallback that polls
//! the backend health URL.

use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable,
}

impl Reachability {
    pub fn is_reachable(&self) -> bool {
        matches!(self, Reachability::Reachable)
    }
}

/// Publishes connectivity transitions to subscribed orchestrators
pub struct NetworkMonitor {
    tx: watch::Sender<Reachability>,
}

impl NetworkMonitor {
    pub fn new(initial: Reachability) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Report the current reachability. Only transitions wake subscribers.
    pub fn report(&self, reachability: Reachability) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == reachability {
                false
            } else {
                *current = reachability;
                true
            }
        });
        if changed {
            info!("Network is now {:?}", reachability);
        }
    }

    pub fn current(&self) -> Reachability {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Reachability> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(Reachability::Unreachable)
    }
}

/// Polls a health URL and reports the result into a monitor
pub struct HttpProbe {
    client: Client,
    url: String,
    interval: Duration,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, interval: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(interval.min(Duration::from_secs(10)))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            interval,
        })
    }

    /// Probe once. Any HTTP answer below 500 counts as reachable.
    pub async fn probe(&self) -> Reachability {
        match self.client.get(&self.url).send().await {
            Ok(response) if !response.status().is_server_error() => Reachability::Reachable,
            Ok(response) => {
                debug!("Health probe answered {}", response.status());
                Reachability::Unreachable
            }
            Err(e) => {
                debug!("Health probe failed: {}", e);
                Reachability::Unreachable
            }
        }
    }

    /// Run the probe loop until the returned handle is aborted.
    pub fn spawn(self, monitor: Arc<NetworkMonitor>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.report(self.probe().await);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_transitions_notify_subscribers() {
        let monitor = NetworkMonitor::new(Reachability::Unreachable);
        let mut rx = monitor.subscribe();

        monitor.report(Reachability::Unreachable);
        assert!(!rx.has_changed().unwrap());

        monitor.report(Reachability::Reachable);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Reachability::Reachable);
        assert_eq!(monitor.current(), Reachability::Reachable);
    }
}
