//! Offline report queue for the Madad+ emergency reporting app.
//!
//! Reports go straight to the remote store when the device is online and are
//! kept in durable local storage otherwise. A [`SyncDriver`] replays them,
//! oldest first, when connectivity comes back.

#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod capabilities;
pub mod crypto;
pub mod event;
pub mod model;
pub mod offline_store;
pub mod outbox;
pub mod sync_driver;

pub use capabilities::{
    Capabilities, ConnectivityMonitor, ConnectivitySubscription, ErrorCategory, NetworkStatus,
    RemoteError, RemoteReportStore, StorageKey, Submission, SubmissionMeta, SubmissionOrigin,
    TimeoutStore,
};
pub use event::QueueEvent;
pub use model::{
    LocalId, MediaRef, PendingReport, Priority, RemoteId, ReportLocation, ReportPayload,
    SubmitOutcome, SyncResult, ValidationError,
};
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use offline_store::SqliteStorage;
pub use offline_store::{FileStorage, MemoryStorage, QueueStorage, StoreContext, StoreError};
pub use outbox::{
    MetricsSnapshot, OfflineReportQueue, QuarantinedEntry, QueueConfig, QueueError,
    DEFAULT_STORAGE_KEY,
};
pub use sync_driver::SyncDriver;
