use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Source of network reachability.
///
/// The queue only needs a point-in-time read and a change stream. Platform
/// events can be missed, so callers may still run `sync()` by hand.
pub trait ConnectivityMonitor: Send + Sync {
    fn is_online(&self) -> bool;

    fn subscribe(&self) -> ConnectivitySubscription;
}

impl<T: ConnectivityMonitor + ?Sized> ConnectivityMonitor for Arc<T> {
    fn is_online(&self) -> bool {
        (**self).is_online()
    }

    fn subscribe(&self) -> ConnectivitySubscription {
        (**self).subscribe()
    }
}

/// Live subscription to connectivity changes. Dropping it unsubscribes.
#[derive(Debug)]
pub struct ConnectivitySubscription {
    rx: watch::Receiver<bool>,
}

impl ConnectivitySubscription {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn current(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits for the next change and returns the new state, or `None` once
    /// the monitor is gone. Changes made while nobody is waiting collapse into
    /// the latest state.
    pub async fn changed(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    pub fn unsubscribe(self) {}
}

/// Connectivity state pushed in by the host (browser `online`/`offline`
/// events, Android `ConnectivityManager`, a reachability check...).
#[derive(Debug)]
pub struct NetworkStatus {
    tx: watch::Sender<bool>,
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    /// Records the new state. Subscribers are only woken on a transition.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });

        if changed {
            if online {
                info!("connectivity: back online");
            } else {
                info!("connectivity: went offline");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityMonitor for NetworkStatus {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> ConnectivitySubscription {
        ConnectivitySubscription::new(self.tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn subscription_sees_transitions() {
        let status = NetworkStatus::new(false);
        let mut sub = status.subscribe();
        assert!(!sub.current());

        status.set_online(true);
        assert_eq!(sub.changed().await, Some(true));
        assert!(status.is_online());
    }

    #[tokio::test]
    async fn repeated_state_does_not_wake_subscribers() {
        let status = NetworkStatus::new(true);
        let mut sub = status.subscribe();

        status.set_online(true);
        let woke = tokio::time::timeout(Duration::from_millis(20), sub.changed()).await;
        assert!(woke.is_err());
    }

    #[tokio::test]
    async fn dropping_monitor_ends_subscription() {
        let status = NetworkStatus::new(true);
        let mut sub = status.subscribe();
        drop(status);
        assert_eq!(sub.changed().await, None);
    }

    #[test]
    fn unsubscribe_releases_receiver() {
        let status = NetworkStatus::default();
        let sub = status.subscribe();
        assert_eq!(status.subscriber_count(), 1);
        sub.unsubscribe();
        assert_eq!(status.subscriber_count(), 0);
    }
}
