//! Collaborators the offline queue depends on.
//!
//! Everything outside the queue (durable storage, the remote document store,
//! network reachability) is reached through one of these seams so hosts can
//! plug in platform implementations and tests can plug in fakes.
mod connectivity;
mod kv;
mod remote;

use std::sync::Arc;

use crate::offline_store::QueueStorage;

pub use self::connectivity::{ConnectivityMonitor, ConnectivitySubscription, NetworkStatus};
pub use self::kv::{StorageKey, MAX_KEY_LENGTH};
pub use self::remote::{
    ErrorCategory, RemoteError, RemoteReportStore, Submission, SubmissionMeta, SubmissionOrigin,
    TimeoutStore, DEFAULT_CREATE_TIMEOUT,
};

pub type AppStorage = Arc<dyn QueueStorage>;
pub type AppRemote = Arc<dyn RemoteReportStore>;
pub type AppConnectivity = Arc<dyn ConnectivityMonitor>;

#[derive(Clone)]
pub struct Capabilities {
    pub storage: AppStorage,
    pub remote: AppRemote,
    pub connectivity: AppConnectivity,
}

impl Capabilities {
    pub fn new(
        storage: impl QueueStorage + 'static,
        remote: impl RemoteReportStore + 'static,
        connectivity: impl ConnectivityMonitor + 'static,
    ) -> Self {
        Self {
            storage: Arc::new(storage),
            remote: Arc::new(remote),
            connectivity: Arc::new(connectivity),
        }
    }
}
