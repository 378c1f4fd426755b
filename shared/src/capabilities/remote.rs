use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::model::{LocalId, PendingReport, RemoteId, ReportPayload};

/// Default bound on a single remote create, applied by [`TimeoutStore`].
pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Coarse classification of a remote failure. The queue retries every
/// category the same way; the category only feeds logs and events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    Unauthenticated,
    Rejected,
    QuotaExceeded,
    Server,
    Unknown,
}

impl ErrorCategory {
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Unauthenticated => "AUTH_ERROR",
            Self::Rejected => "REJECTED",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::Server => "SERVER_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Unauthenticated,
            408 | 504 => Self::Timeout,
            429 => Self::QuotaExceeded,
            400..=499 => Self::Rejected,
            500..=599 => Self::Server,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{}: {message}", .category.code())]
pub struct RemoteError {
    pub category: ErrorCategory,
    pub message: String,
}

impl RemoteError {
    const MAX_MESSAGE_LENGTH: usize = 512;

    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_utf8_safe(&mut message, Self::MAX_MESSAGE_LENGTH);
        Self { category, message }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorCategory::Timeout,
            format!("no response after {}ms", after.as_millis()),
        )
    }

    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::from_http_status(status), message)
    }
}

fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionOrigin {
    /// Sent straight from `submit` while online.
    Immediate,
    /// Replayed from the offline queue by a sync pass.
    Replay,
}

/// Metadata the queue attaches to every create call. The store decides how
/// (or whether) to merge it into the stored record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionMeta {
    pub origin: SubmissionOrigin,
    pub local_id: Option<LocalId>,
    pub enqueued_at: Option<DateTime<Utc>>,
    /// 1-based attempt number for this payload.
    pub attempt: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub payload: ReportPayload,
    pub meta: SubmissionMeta,
}

impl Submission {
    pub fn immediate(payload: ReportPayload) -> Self {
        Self {
            payload,
            meta: SubmissionMeta {
                origin: SubmissionOrigin::Immediate,
                local_id: None,
                enqueued_at: None,
                attempt: 1,
            },
        }
    }

    pub fn replay(entry: &PendingReport) -> Self {
        Self {
            payload: entry.payload().clone(),
            meta: SubmissionMeta {
                origin: SubmissionOrigin::Replay,
                local_id: Some(entry.local_id().clone()),
                enqueued_at: Some(entry.enqueued_at()),
                attempt: entry.attempts().saturating_add(1),
            },
        }
    }

    pub fn into_payload(self) -> ReportPayload {
        self.payload
    }
}

/// The remote document store reports are written to.
///
/// Implementations own their own timeouts; wrap one in [`TimeoutStore`] if
/// it has none.
#[async_trait::async_trait]
pub trait RemoteReportStore: Send + Sync {
    async fn create(&self, submission: &Submission) -> Result<RemoteId, RemoteError>;
}

#[async_trait::async_trait]
impl<T: RemoteReportStore + ?Sized> RemoteReportStore for Arc<T> {
    async fn create(&self, submission: &Submission) -> Result<RemoteId, RemoteError> {
        (**self).create(submission).await
    }
}

/// Bounds every create call of the wrapped store.
pub struct TimeoutStore<R> {
    inner: R,
    timeout: Duration,
}

impl<R: RemoteReportStore> TimeoutStore<R> {
    pub fn new(inner: R, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn with_default_timeout(inner: R) -> Self {
        Self::new(inner, DEFAULT_CREATE_TIMEOUT)
    }
}

#[async_trait::async_trait]
impl<R: RemoteReportStore> RemoteReportStore for TimeoutStore<R> {
    async fn create(&self, submission: &Submission) -> Result<RemoteId, RemoteError> {
        match tokio::time::timeout(self.timeout, self.inner.create(submission)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::timeout(self.timeout)),
        }
    }
}
