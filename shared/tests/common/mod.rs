#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use shared::{
    Capabilities, ErrorCategory, MemoryStorage, NetworkStatus, OfflineReportQueue, QueueConfig,
    QueueStorage, RemoteError, RemoteId, RemoteReportStore, ReportPayload, StorageKey, StoreError,
    Submission,
};
use tokio::sync::{Notify, Semaphore};

/// Remote store that records every create call. Fails for descriptions in
/// `failing`; optionally parks each call until the gate hands out a permit.
#[derive(Default)]
pub struct RecordingRemote {
    calls: Mutex<Vec<Submission>>,
    failing: Mutex<HashSet<String>>,
    gate: Option<Arc<Semaphore>>,
    pub entered: Notify,
}

impl RecordingRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn fail_on(&self, description: &str) {
        self.failing.lock().unwrap().insert(description.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<Submission> {
        self.calls.lock().unwrap().clone()
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|s| s.payload.description)
            .collect()
    }
}

#[async_trait::async_trait]
impl RemoteReportStore for RecordingRemote {
    async fn create(&self, submission: &Submission) -> Result<RemoteId, RemoteError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(submission.clone());
            calls.len()
        };
        self.entered.notify_one();

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let fails = self
            .failing
            .lock()
            .unwrap()
            .contains(&submission.payload.description);
        if fails {
            return Err(RemoteError::new(ErrorCategory::Server, "503 from store"));
        }
        Ok(RemoteId::new(format!("doc-{n}")).unwrap())
    }
}

/// Shared map whose writes can be switched off, standing in for a full disk
/// or an exhausted browser quota.
#[derive(Clone, Default)]
pub struct FailableStorage {
    pub inner: MemoryStorage,
    fail_writes: Arc<AtomicBool>,
}

impl FailableStorage {
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl QueueStorage for FailableStorage {
    async fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.load(key).await
    }

    async fn store(&self, key: &StorageKey, value: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::QuotaExceeded {
                needed: value.len(),
                quota: 0,
            });
        }
        self.inner.store(key, value).await
    }

    async fn remove(&self, key: &StorageKey) -> Result<(), StoreError> {
        self.inner.remove(key).await
    }
}

pub fn report(description: &str) -> ReportPayload {
    ReportPayload::new("medical", description)
}

pub async fn open_queue(
    storage: impl QueueStorage + 'static,
    remote: Arc<RecordingRemote>,
    network: Arc<NetworkStatus>,
) -> Arc<OfflineReportQueue> {
    let caps = Capabilities::new(storage, remote, network);
    Arc::new(
        OfflineReportQueue::open(caps, QueueConfig::default())
            .await
            .unwrap(),
    )
}
