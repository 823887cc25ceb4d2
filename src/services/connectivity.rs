//! Network reachability, so an upload can park while the device is offline.

use std::{future::Future, sync::Arc, time::Duration};
use tokio::{net::TcpStream, sync::watch, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Answers "are we online?" and lets a caller wait until we are.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;

    /// Resolves once the network is reachable. No timeout.
    fn wait_online(&self) -> impl Future<Output = ()> + Send;
}

/// For hosts with no notion of offline.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }

    async fn wait_online(&self) {}
}

/// Online flag shared between whoever observes the network and the uploads
/// waiting on it.
#[derive(Clone, Debug)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Record a connectivity change. Waiters wake on `true`.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            info!(online, "connectivity changed");
            *current = online;
            true
        });
    }

    /// Drive the flag from a TCP probe against `host:port` every `interval`
    /// until `cancel` fires.
    pub fn spawn_probe(
        &self,
        host: String,
        port: u16,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reachable = matches!(
                            timeout(interval, TcpStream::connect((host.as_str(), port))).await,
                            Ok(Ok(_))
                        );
                        debug!(%host, port, reachable, "connectivity probe");
                        monitor.set_online(reachable);
                    }
                }
            }
        })
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for NetworkMonitor {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    async fn wait_online(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` cannot see a closed channel.
        let _ = rx.wait_for(|online| *online).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_online_resolves_after_reconnect() {
        let monitor = NetworkMonitor::new(false);
        assert!(!monitor.is_online());

        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.wait_online().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        monitor.set_online(true);
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn wait_online_is_immediate_when_online() {
        let monitor = NetworkMonitor::default();
        timeout(Duration::from_millis(100), monitor.wait_online())
            .await
            .expect("already online");
    }
}
