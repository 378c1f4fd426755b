//! Background task that flushes the offline queue.
//!
//! A pass runs whenever the connectivity monitor wakes the loop with the
//! device online (including a drop and recovery that happened during a
//! previous pass), on a periodic tick
//! while online with something queued, and on [`SyncDriver::trigger`]. Passes
//! never overlap: they all go through [`OfflineReportQueue::sync`], and the
//! loop waits for one pass to end before looking at the next signal.
use std::sync::Arc;

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::capabilities::ConnectivitySubscription;
use crate::outbox::OfflineReportQueue;

pub struct SyncDriver {
    trigger: Arc<Notify>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SyncDriver {
    /// Subscribes to the queue's connectivity monitor and starts the loop on
    /// the current tokio runtime. Runs a first pass right away when online.
    pub fn spawn(queue: Arc<OfflineReportQueue>) -> Self {
        // Subscribe before spawning so no transition after this call is missed.
        let connectivity = queue.connectivity().subscribe();
        let trigger = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(run(queue, connectivity, Arc::clone(&trigger), shutdown_rx));

        Self {
            trigger,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Requests a pass. Requests made while a pass runs collapse into one.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stops the loop once the current pass (if any) has finished and drops
    /// the connectivity subscription.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "sync driver task ended abnormally");
            }
        }
    }
}

impl Drop for SyncDriver {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn run(
    queue: Arc<OfflineReportQueue>,
    mut connectivity: ConnectivitySubscription,
    trigger: Arc<Notify>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut online = connectivity.current();
    let mut monitor_open = true;
    let mut ticker = queue.config().periodic_sync_interval().map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    info!(online, "sync driver started");
    if online {
        run_pass(&queue, "startup").await;
    }

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = connectivity.changed(), if monitor_open => match changed {
                Some(now_online) => {
                    // The watch keeps only the latest value, so an offline blip
                    // during a pass shows up as a single wake with `true`.
                    online = now_online;
                    if now_online {
                        run_pass(&queue, "reconnect").await;
                    }
                }
                None => {
                    warn!("connectivity monitor closed, reconnect trigger disabled");
                    monitor_open = false;
                }
            },
            _ = trigger.notified() => run_pass(&queue, "manual").await,
            _ = next_tick(&mut ticker) => {
                if online && queue.pending_count() > 0 {
                    run_pass(&queue, "periodic").await;
                }
            }
        }
    }

    connectivity.unsubscribe();
    info!("sync driver stopped");
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_pass(queue: &OfflineReportQueue, reason: &'static str) {
    match queue.sync().await {
        Ok(result) if result.attempted() > 0 => {
            debug!(reason, synced = result.synced, failed = result.failed, "sync pass done");
        }
        Ok(_) => {}
        Err(e) => error!(reason, error = %e, "sync pass aborted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{
        Capabilities, ErrorCategory, NetworkStatus, RemoteError, RemoteReportStore, Submission,
    };
    use crate::event::QueueEvent;
    use crate::model::{RemoteId, ReportPayload};
    use crate::offline_store::MemoryStorage;
    use crate::outbox::QueueConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct CountingRemote {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RemoteReportStore for CountingRemote {
        async fn create(&self, _submission: &Submission) -> Result<RemoteId, RemoteError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(RemoteId::new(format!("doc-{n}")).unwrap())
        }
    }

    /// Blocks every call on `gate` and fails while `failing` is set.
    struct GatedRemote {
        gate: Semaphore,
        entered: Notify,
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RemoteReportStore for GatedRemote {
        async fn create(&self, _submission: &Submission) -> Result<RemoteId, RemoteError> {
            self.entered.notify_one();
            self.gate.acquire().await.unwrap().forget();
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failing.load(Ordering::SeqCst) {
                return Err(RemoteError::new(ErrorCategory::Server, "503 from store"));
            }
            Ok(RemoteId::new(format!("doc-{n}")).unwrap())
        }
    }

    async fn queue_with(
        network: Arc<NetworkStatus>,
        interval_ms: Option<u64>,
    ) -> (Arc<OfflineReportQueue>, Arc<CountingRemote>) {
        let remote = Arc::new(CountingRemote::default());
        let caps = Capabilities::new(MemoryStorage::new(), remote.clone(), network);
        let config = QueueConfig {
            periodic_sync_interval_ms: interval_ms,
            ..Default::default()
        };
        let queue = OfflineReportQueue::open(caps, config).await.unwrap();
        (Arc::new(queue), remote)
    }

    async fn wait_until_empty(queue: &OfflineReportQueue) {
        let mut pending = queue.subscribe_pending();
        tokio::time::timeout(Duration::from_secs(5), pending.wait_for(|n| *n == 0))
            .await
            .expect("queue did not drain")
            .unwrap();
    }

    #[tokio::test]
    async fn reconnect_drains_queue() {
        let network = Arc::new(NetworkStatus::new(false));
        let (queue, remote) = queue_with(network.clone(), None).await;
        queue.enqueue(ReportPayload::new("fire", "a")).await.unwrap();
        queue.enqueue(ReportPayload::new("fire", "b")).await.unwrap();

        let driver = SyncDriver::spawn(queue.clone());
        network.set_online(true);

        wait_until_empty(&queue).await;
        assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
        driver.shutdown().await;
    }

    #[tokio::test]
    async fn manual_trigger_runs_a_pass() {
        let network = Arc::new(NetworkStatus::new(true));
        let (queue, _remote) = queue_with(network, None).await;
        let driver = SyncDriver::spawn(queue.clone());

        queue.enqueue(ReportPayload::new("crime", "theft")).await.unwrap();
        driver.trigger();

        wait_until_empty(&queue).await;
        driver.shutdown().await;
    }

    #[tokio::test]
    async fn periodic_tick_drains_while_online() {
        let network = Arc::new(NetworkStatus::new(true));
        let (queue, _remote) = queue_with(network, Some(20)).await;
        let driver = SyncDriver::spawn(queue.clone());

        queue.enqueue(ReportPayload::new("medical", "fall")).await.unwrap();

        wait_until_empty(&queue).await;
        driver.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_unsubscribes() {
        let network = Arc::new(NetworkStatus::new(false));
        let (queue, _remote) = queue_with(network.clone(), None).await;

        let driver = SyncDriver::spawn(queue);
        assert_eq!(network.subscriber_count(), 1);

        driver.shutdown().await;
        assert_eq!(network.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn offline_transition_does_not_sync() {
        let network = Arc::new(NetworkStatus::new(true));
        let (queue, remote) = queue_with(network.clone(), None).await;
        let driver = SyncDriver::spawn(queue.clone());

        network.set_online(false);
        queue.enqueue(ReportPayload::new("fire", "a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(queue.pending_count(), 1);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
        driver.shutdown().await;
    }

    #[tokio::test]
    async fn connectivity_blip_during_a_pass_triggers_another_pass() {
        let network = Arc::new(NetworkStatus::new(true));
        let remote = Arc::new(GatedRemote {
            gate: Semaphore::new(0),
            entered: Notify::new(),
            failing: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        });
        let caps = Capabilities::new(MemoryStorage::new(), remote.clone(), network.clone());
        let config = QueueConfig {
            periodic_sync_interval_ms: None,
            ..Default::default()
        };
        let queue = Arc::new(OfflineReportQueue::open(caps, config).await.unwrap());
        queue.enqueue(ReportPayload::new("fire", "a")).await.unwrap();
        let mut events = queue.subscribe_events();

        let driver = SyncDriver::spawn(queue.clone());
        remote.entered.notified().await;

        // Drop and recover while the startup pass is parked in the remote.
        network.set_online(false);
        network.set_online(true);
        remote.gate.add_permits(1);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let QueueEvent::DeliveryFailed { .. } = events.recv().await.unwrap() {
                    break;
                }
            }
        })
        .await
        .expect("startup pass did not fail");

        remote.failing.store(false, Ordering::SeqCst);
        remote.gate.add_permits(10);

        wait_until_empty(&queue).await;
        assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
        driver.shutdown().await;
    }
}
