use std::collections::{HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{AppConnectivity, Capabilities, RemoteError, StorageKey, Submission};
use crate::event::QueueEvent;
use crate::model::{LocalId, PendingReport, RemoteId, ReportPayload, SubmitOutcome, SyncResult};
use crate::offline_store::StoreError;

pub const DEFAULT_STORAGE_KEY: &str = "madadgar-offline-queue";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("report {0} is already queued")]
    DuplicateLocalId(LocalId),

    #[error("report {local_id} was already delivered as {remote_id}")]
    AlreadySynced {
        local_id: LocalId,
        remote_id: RemoteId,
    },

    #[error("queue is full ({0} entries)")]
    Full(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub storage_key: String,
    pub max_entries: usize,
    /// Capacity of the recently-synced id cache used to reject replays of
    /// already delivered reports.
    pub recently_synced_capacity: usize,
    /// Background sync period while online with a non-empty queue. `None`
    /// leaves only reconnect and manual triggers.
    pub periodic_sync_interval_ms: Option<u64>,
    pub event_buffer: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            max_entries: 10_000,
            recently_synced_capacity: 1_000,
            periodic_sync_interval_ms: Some(5_000),
            event_buffer: 64,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        StorageKey::new(self.storage_key.as_str())
            .map_err(|e| QueueError::InvalidConfig(e.to_string()))?;
        if self.max_entries == 0 {
            return Err(QueueError::InvalidConfig("max_entries must be > 0".into()));
        }
        if self.recently_synced_capacity == 0 {
            return Err(QueueError::InvalidConfig(
                "recently_synced_capacity must be > 0".into(),
            ));
        }
        if self.periodic_sync_interval_ms == Some(0) {
            return Err(QueueError::InvalidConfig(
                "periodic_sync_interval_ms must be > 0 when set".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(QueueError::InvalidConfig("event_buffer must be > 0".into()));
        }
        Ok(())
    }

    pub fn periodic_sync_interval(&self) -> Option<std::time::Duration> {
        self.periodic_sync_interval_ms
            .map(std::time::Duration::from_millis)
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub reports_queued: AtomicU64,
    pub delivered_immediately: AtomicU64,
    pub reports_synced: AtomicU64,
    pub delivery_failures: AtomicU64,
    pub storage_errors: AtomicU64,
    pub passes_completed: AtomicU64,
    pub skipped_passes: AtomicU64,
    pub entries_quarantined: AtomicU64,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reports_queued: self.reports_queued.load(Ordering::Relaxed),
            delivered_immediately: self.delivered_immediately.load(Ordering::Relaxed),
            reports_synced: self.reports_synced.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            passes_completed: self.passes_completed.load(Ordering::Relaxed),
            skipped_passes: self.skipped_passes.load(Ordering::Relaxed),
            entries_quarantined: self.entries_quarantined.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub reports_queued: u64,
    pub delivered_immediately: u64,
    pub reports_synced: u64,
    pub delivery_failures: u64,
    pub storage_errors: u64,
    pub passes_completed: u64,
    pub skipped_passes: u64,
    pub entries_quarantined: u64,
}

// ============================================================================
// Quarantine
// ============================================================================

/// A stored element that could not be loaded. Kept verbatim so nothing a
/// user submitted is silently thrown away.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantinedEntry {
    pub raw: Value,
    pub reason: String,
    pub quarantined_at: DateTime<Utc>,
}

// ============================================================================
// Queue state
// ============================================================================

struct QueueState {
    entries: VecDeque<PendingReport>,
    recently_synced: LruCache<LocalId, RemoteId>,
    quarantined: Vec<QuarantinedEntry>,
}

impl QueueState {
    fn position(&self, local_id: &LocalId) -> Option<usize> {
        self.entries.iter().position(|e| e.local_id() == local_id)
    }
}

struct Loaded {
    entries: VecDeque<PendingReport>,
    new_quarantine: Vec<QuarantinedEntry>,
}

fn decode_queue(bytes: &[u8]) -> Result<Loaded, StoreError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupted {
        reason: format!("queue is not valid JSON: {e}"),
    })?;
    let Value::Array(items) = value else {
        return Err(StoreError::Corrupted {
            reason: "queue value is not a JSON array".into(),
        });
    };

    let mut seen = HashSet::new();
    let mut entries = VecDeque::with_capacity(items.len());
    let mut new_quarantine = Vec::new();
    let now = Utc::now();

    for raw in items {
        match serde_json::from_value::<PendingReport>(raw.clone()) {
            Ok(entry) if seen.insert(entry.local_id().clone()) => entries.push_back(entry),
            Ok(entry) => new_quarantine.push(QuarantinedEntry {
                raw,
                reason: format!("duplicate local id {}", entry.local_id()),
                quarantined_at: now,
            }),
            Err(e) => new_quarantine.push(QuarantinedEntry {
                raw,
                reason: e.to_string(),
                quarantined_at: now,
            }),
        }
    }

    Ok(Loaded {
        entries,
        new_quarantine,
    })
}

// ============================================================================
// Offline report queue
// ============================================================================

/// Durable FIFO of reports not yet acknowledged by the remote store.
///
/// Every mutation rewrites the whole queue value under one storage key while
/// holding the state lock. The lock is never held across a remote call, so
/// `submit` keeps working while a sync pass is delivering.
pub struct OfflineReportQueue {
    caps: Capabilities,
    config: QueueConfig,
    key: StorageKey,
    state: Mutex<QueueState>,
    sync_gate: Mutex<()>,
    metrics: Arc<QueueMetrics>,
    pending_tx: watch::Sender<usize>,
    events: broadcast::Sender<QueueEvent>,
}

impl OfflineReportQueue {
    /// Loads the persisted queue. Undecodable or duplicated elements are moved
    /// to quarantine; a value that is not a queue at all fails the open.
    #[instrument(skip(caps, config), fields(key = %config.storage_key))]
    pub async fn open(caps: Capabilities, config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let key = StorageKey::new(config.storage_key.as_str())?;
        let cache_size = NonZeroUsize::new(config.recently_synced_capacity).ok_or_else(|| {
            QueueError::InvalidConfig("recently_synced_capacity must be > 0".into())
        })?;

        let loaded = match caps.storage.load(&key).await? {
            Some(bytes) => decode_queue(&bytes)?,
            None => Loaded {
                entries: VecDeque::new(),
                new_quarantine: Vec::new(),
            },
        };

        let mut quarantined = load_quarantine(&caps, &key).await;
        let metrics = Arc::new(QueueMetrics::new());

        if !loaded.new_quarantine.is_empty() {
            for q in &loaded.new_quarantine {
                warn!(reason = %q.reason, "quarantining stored queue entry");
            }
            metrics
                .entries_quarantined
                .fetch_add(loaded.new_quarantine.len() as u64, Ordering::Relaxed);
            quarantined.extend(loaded.new_quarantine);

            // Quarantine first so a failure between the two writes duplicates
            // rather than loses the bad elements.
            let bytes = serde_json::to_vec(&quarantined).map_err(StoreError::from)?;
            caps.storage.store(&key.quarantine(), &bytes).await?;
            let bytes = serde_json::to_vec(&loaded.entries).map_err(StoreError::from)?;
            caps.storage.store(&key, &bytes).await?;
        }

        let pending = loaded.entries.len();
        info!(
            pending,
            quarantined = quarantined.len(),
            "offline queue opened"
        );

        let (pending_tx, _) = watch::channel(pending);
        let (events, _) = broadcast::channel(config.event_buffer);

        Ok(Self {
            caps,
            config,
            key,
            state: Mutex::new(QueueState {
                entries: loaded.entries,
                recently_synced: LruCache::new(cache_size),
                quarantined,
            }),
            sync_gate: Mutex::new(()),
            metrics,
            pending_tx,
            events,
        })
    }

    /// Delivers the report directly when online, otherwise (or when delivery
    /// fails) queues it. Only a failed local write is an error.
    #[instrument(skip(self, payload), fields(report_type = %payload.report_type))]
    pub async fn submit(&self, payload: ReportPayload) -> Result<SubmitOutcome, QueueError> {
        let payload = if self.caps.connectivity.is_online() {
            let submission = Submission::immediate(payload);
            match self.caps.remote.create(&submission).await {
                Ok(remote_id) => {
                    QueueMetrics::incr(&self.metrics.delivered_immediately);
                    info!(remote_id = %remote_id, "report delivered");
                    let _ = self.events.send(QueueEvent::Delivered {
                        remote_id: remote_id.clone(),
                    });
                    return Ok(SubmitOutcome::Delivered { remote_id });
                }
                Err(e) => {
                    QueueMetrics::incr(&self.metrics.delivery_failures);
                    warn!(error = %e, "immediate delivery failed, queueing report");
                    submission.into_payload()
                }
            }
        } else {
            debug!("offline, queueing report");
            payload
        };

        let local_id = self.push(LocalId::generate(), payload).await?;
        Ok(SubmitOutcome::Queued { local_id })
    }

    /// Queues the report without trying the remote store.
    pub async fn enqueue(&self, payload: ReportPayload) -> Result<LocalId, QueueError> {
        self.push(LocalId::generate(), payload).await
    }

    /// Queues the report under a caller-chosen id. Rejects ids that are
    /// already queued or were delivered recently.
    pub async fn enqueue_with_id(
        &self,
        local_id: LocalId,
        payload: ReportPayload,
    ) -> Result<LocalId, QueueError> {
        self.push(local_id, payload).await
    }

    #[instrument(skip(self, payload), fields(local_id = %local_id))]
    async fn push(&self, local_id: LocalId, payload: ReportPayload) -> Result<LocalId, QueueError> {
        let mut state = self.state.lock().await;

        if state.entries.len() >= self.config.max_entries {
            return Err(QueueError::Full(self.config.max_entries));
        }
        if state.position(&local_id).is_some() {
            return Err(QueueError::DuplicateLocalId(local_id));
        }
        if let Some(remote_id) = state.recently_synced.peek(&local_id) {
            return Err(QueueError::AlreadySynced {
                remote_id: remote_id.clone(),
                local_id,
            });
        }

        // Memory first, then persist; roll back on failure.
        state
            .entries
            .push_back(PendingReport::new(local_id.clone(), payload, Utc::now()));

        if let Err(e) = self.persist(&state.entries).await {
            state.entries.pop_back();
            QueueMetrics::incr(&self.metrics.storage_errors);
            error!(error = %e, "failed to persist queued report");
            return Err(e.into());
        }

        let pending = state.entries.len();
        self.publish(
            pending,
            QueueEvent::Enqueued {
                local_id: local_id.clone(),
                pending,
            },
        );
        QueueMetrics::incr(&self.metrics.reports_queued);
        info!(pending, "report queued");

        Ok(local_id)
    }

    /// Replays queued reports oldest-first, one create each. Entries queued
    /// after the pass started wait for the next pass. A call made while
    /// another pass runs returns a zero result immediately.
    ///
    /// Fails only when a confirmed removal cannot be persisted; the pass
    /// stops there and the entry stays queued.
    #[instrument(skip(self))]
    pub async fn sync(&self) -> Result<SyncResult, QueueError> {
        let Ok(_gate) = self.sync_gate.try_lock() else {
            QueueMetrics::incr(&self.metrics.skipped_passes);
            debug!("sync already in progress");
            return Ok(SyncResult::default());
        };

        let snapshot: Vec<PendingReport> = {
            let state = self.state.lock().await;
            state.entries.iter().cloned().collect()
        };

        let mut result = SyncResult::default();
        if snapshot.is_empty() {
            return Ok(result);
        }

        info!(pending = snapshot.len(), "sync pass started");

        for entry in snapshot {
            let submission = Submission::replay(&entry);
            match self.caps.remote.create(&submission).await {
                Ok(remote_id) => {
                    self.confirm(entry.local_id(), remote_id).await?;
                    result.synced += 1;
                }
                Err(e) => {
                    self.record_failure(entry.local_id(), &e).await;
                    result.failed += 1;
                }
            }
        }

        QueueMetrics::incr(&self.metrics.passes_completed);
        info!(
            synced = result.synced,
            failed = result.failed,
            "sync pass finished"
        );
        let _ = self.events.send(QueueEvent::PassFinished(result));

        Ok(result)
    }

    async fn confirm(&self, local_id: &LocalId, remote_id: RemoteId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;

        if let Some(pos) = state.position(local_id) {
            let removed = state.entries.remove(pos);
            if let Err(e) = self.persist(&state.entries).await {
                if let Some(entry) = removed {
                    state.entries.insert(pos, entry);
                }
                QueueMetrics::incr(&self.metrics.storage_errors);
                error!(
                    local_id = %local_id,
                    remote_id = %remote_id,
                    error = %e,
                    "delivered report could not be removed from storage"
                );
                return Err(e.into());
            }
        }

        state.recently_synced.put(local_id.clone(), remote_id.clone());

        let pending = state.entries.len();
        self.publish(
            pending,
            QueueEvent::Synced {
                local_id: local_id.clone(),
                remote_id: remote_id.clone(),
                pending,
            },
        );
        QueueMetrics::incr(&self.metrics.reports_synced);
        info!(local_id = %local_id, remote_id = %remote_id, pending, "queued report synced");

        Ok(())
    }

    async fn record_failure(&self, local_id: &LocalId, err: &RemoteError) {
        QueueMetrics::incr(&self.metrics.delivery_failures);

        let mut state = self.state.lock().await;
        let Some(pos) = state.position(local_id) else {
            return;
        };

        let attempts = match state.entries.get_mut(pos) {
            Some(entry) => {
                entry.record_failure();
                entry.attempts()
            }
            None => return,
        };

        // The counter is informational; a failed write keeps the entry as it
        // was on disk and the pass goes on.
        if let Err(e) = self.persist(&state.entries).await {
            if let Some(entry) = state.entries.get_mut(pos) {
                entry.revert_failure();
            }
            QueueMetrics::incr(&self.metrics.storage_errors);
            error!(local_id = %local_id, error = %e, "failed to persist attempt count");
        }

        warn!(
            local_id = %local_id,
            attempts,
            category = err.category.code(),
            error = %err.message,
            "queued report delivery failed"
        );
        let _ = self.events.send(QueueEvent::DeliveryFailed {
            local_id: local_id.clone(),
            attempts,
            category: err.category,
        });
    }

    async fn persist(&self, entries: &VecDeque<PendingReport>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(entries)?;
        self.caps.storage.store(&self.key, &bytes).await
    }

    // Called with the state lock held so watchers never see counts out of
    // order.
    fn publish(&self, pending: usize, event: QueueEvent) {
        self.pending_tx.send_replace(pending);
        let _ = self.events.send(event);
    }

    pub fn pending_count(&self) -> usize {
        *self.pending_tx.borrow()
    }

    /// Read-only copy of the queue, oldest first.
    pub async fn drained_snapshot(&self) -> Vec<PendingReport> {
        self.state.lock().await.entries.iter().cloned().collect()
    }

    pub fn subscribe_pending(&self) -> watch::Receiver<usize> {
        self.pending_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.sync_gate.try_lock().is_err()
    }

    pub async fn quarantined(&self) -> Vec<QuarantinedEntry> {
        self.state.lock().await.quarantined.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn connectivity(&self) -> &AppConnectivity {
        &self.caps.connectivity
    }
}

async fn load_quarantine(caps: &Capabilities, key: &StorageKey) -> Vec<QuarantinedEntry> {
    match caps.storage.load(&key.quarantine()).await {
        Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "quarantine list unreadable, starting a new one");
                Vec::new()
            }
        },
        Ok(None) => Vec::new(),
        Err(e) => {
            warn!(error = %e, "failed to load quarantine list");
            Vec::new()
        }
    }
}
