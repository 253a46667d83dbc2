//! Online/offline signal.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared connectivity state. Subscribers see edges only: setting the
/// current value again does not wake them.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    sender: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.sender.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(online, "Connectivity changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Resolve once the device is online.
    pub async fn wait_online(&self) {
        let mut receiver = self.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = receiver.wait_for(|online| *online).await;
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn repeated_state_is_not_an_edge() {
        let monitor = ConnectivityMonitor::new(false);
        let mut receiver = monitor.subscribe();

        monitor.set_online(false);
        assert!(!receiver.has_changed().unwrap());

        monitor.set_online(true);
        assert!(receiver.has_changed().unwrap());
        assert!(*receiver.borrow_and_update());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_online_resolves_on_transition() {
        let monitor = ConnectivityMonitor::new(false);
        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.wait_online().await })
        };

        monitor.set_online(true);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
