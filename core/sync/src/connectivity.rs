//! Online/offline signal.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Source of the device's connectivity state.
pub trait ConnectivityNotifier: Send + Sync {
    /// Current state.
    fn is_online(&self) -> bool;

    /// A receiver that observes every transition.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Update the channel only when the state actually changes.
fn publish(tx: &watch::Sender<bool>, online: bool) -> bool {
    tx.send_if_modified(|current| {
        if *current == online {
            false
        } else {
            *current = online;
            true
        }
    })
}

/// Connectivity flipped by hand. Used by tests and by hosts that learn about
/// connectivity from the platform.
#[derive(Debug)]
pub struct ManualConnectivity {
    tx: watch::Sender<bool>,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    /// Set the state, notifying subscribers if it changed.
    pub fn set_online(&self, online: bool) {
        if publish(&self.tx, online) {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
    }
}

impl ConnectivityNotifier for ManualConnectivity {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Connectivity derived from periodically opening a TCP connection to a
/// known host.
#[derive(Debug)]
pub struct ReachabilityProbe {
    target: String,
    interval: Duration,
    timeout: Duration,
    tx: watch::Sender<bool>,
}

impl ReachabilityProbe {
    /// Probe `target` (`host:port`) every `interval`. The state starts
    /// offline until the first probe succeeds.
    pub fn new(target: impl Into<String>, interval: Duration) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            target: target.into(),
            interval,
            timeout: Duration::from_secs(3),
            tx,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Probe once and publish the result.
    pub async fn check(&self) -> bool {
        let online = matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(&self.target)).await,
            Ok(Ok(_))
        );
        if publish(&self.tx, online) {
            info!(
                "{} is {}",
                self.target,
                if online { "reachable" } else { "unreachable" }
            );
        } else {
            debug!("Probe of {}: online={}", self.target, online);
        }
        online
    }

    /// Probe in the background until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.check().await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        })
    }
}

impl ConnectivityNotifier for ReachabilityProbe {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_manual_transitions_notify() {
        let connectivity = ManualConnectivity::new(false);
        let mut rx = connectivity.subscribe();

        connectivity.set_online(false);
        assert!(!rx.has_changed().unwrap());

        connectivity.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(connectivity.is_online());
    }

    #[tokio::test]
    async fn test_probe_detects_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let probe = ReachabilityProbe::new(addr.to_string(), Duration::from_secs(30));
        assert!(!probe.is_online());
        assert!(probe.check().await);
        assert!(probe.is_online());

        drop(listener);
        assert!(!probe.check().await);
        assert!(!probe.is_online());
    }
}
