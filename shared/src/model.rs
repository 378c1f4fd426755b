use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub const MAX_DESCRIPTION_LENGTH: usize = 4096;
pub const MAX_TITLE_LENGTH: usize = 256;
pub const MAX_ADDRESS_LENGTH: usize = 512;

/// Extension key for the transcript produced by a voice report.
pub const VOICE_TRANSCRIPT_KEY: &str = "voiceTranscript";
/// Extension key for uploaded media references.
pub const MEDIA_KEY: &str = "media";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("invalid local id: {0}")]
    InvalidLocalId(String),
    #[error("invalid remote id: {0}")]
    InvalidRemoteId(String),
    #[error("invalid coordinate: lat={0}, lon={1}")]
    InvalidCoordinate(f64, f64),
    #[error("{field} is required")]
    Missing { field: &'static str },
    #[error("{field} too long ({len} > {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

// --- Identifiers ---

/// Client-side identifier of a queued report. Never shares a namespace with
/// server ids.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LocalId(String);

impl LocalId {
    const MAX_LENGTH: usize = 128;
    const PREFIX: &'static str = "offline-";

    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(ValidationError::InvalidLocalId("cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(ValidationError::InvalidLocalId(format!(
                "exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidLocalId(
                "allowed characters are a-z, A-Z, 0-9, - and _".into(),
            ));
        }
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(format!("{}{}", Self::PREFIX, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for LocalId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LocalId> for String {
    fn from(id: LocalId) -> Self {
        id.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier assigned by the remote report store on acknowledgement.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteId(String);

impl RemoteId {
    const MAX_LENGTH: usize = 256;

    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(ValidationError::InvalidRemoteId("cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(ValidationError::InvalidRemoteId(format!(
                "exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if id.chars().any(char::is_control) {
            return Err(ValidationError::InvalidRemoteId(
                "contains control characters".into(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RemoteId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RemoteId> for String {
    fn from(id: RemoteId) -> Self {
        id.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Report payload ---

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    #[default]
    High,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportLocation {
    latitude: f64,
    longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    address: Option<String>,
}

impl ReportLocation {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ValidationError> {
        if !latitude.is_finite()
            || !longitude.is_finite()
            || !(-90.0..=90.0).contains(&latitude)
            || !(-180.0..=180.0).contains(&longitude)
        {
            return Err(ValidationError::InvalidCoordinate(latitude, longitude));
        }
        Ok(Self {
            latitude,
            longitude,
            address: None,
        })
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }
}

/// Reference to media uploaded out of band. The queue never carries bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub url: String,
    pub content_type: String,
}

/// An emergency report as the UI hands it over. The queue treats it as
/// opaque; [`ReportPayload::validate`] is for the UI layer to call.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPayload {
    #[serde(rename = "type")]
    pub report_type: String,
    pub description: String,
    pub location: Option<ReportLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ReportPayload {
    pub fn new(report_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            report_type: report_type.into(),
            description: description.into(),
            location: None,
            title: None,
            priority: Priority::default(),
            is_anonymous: false,
            extensions: Map::new(),
        }
    }

    pub fn with_location(mut self, location: ReportLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.is_anonymous = true;
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    pub fn with_voice_transcript(self, transcript: impl Into<String>) -> Self {
        self.with_extension(VOICE_TRANSCRIPT_KEY, Value::String(transcript.into()))
    }

    pub fn with_media(mut self, media: MediaRef) -> Self {
        let value = serde_json::to_value(media).unwrap_or(Value::Null);
        match self.extensions.get_mut(MEDIA_KEY) {
            Some(Value::Array(items)) => items.push(value),
            _ => {
                self.extensions
                    .insert(MEDIA_KEY.to_string(), Value::Array(vec![value]));
            }
        }
        self
    }

    pub fn voice_transcript(&self) -> Option<&str> {
        self.extensions.get(VOICE_TRANSCRIPT_KEY).and_then(Value::as_str)
    }

    pub fn media(&self) -> Vec<MediaRef> {
        match self.extensions.get(MEDIA_KEY) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.report_type.trim().is_empty() {
            return Err(ValidationError::Missing { field: "type" });
        }
        if self.description.trim().is_empty() {
            return Err(ValidationError::Missing {
                field: "description",
            });
        }
        check_len("description", &self.description, MAX_DESCRIPTION_LENGTH)?;
        if let Some(title) = &self.title {
            check_len("title", title, MAX_TITLE_LENGTH)?;
        }
        if let Some(address) = self.location.as_ref().and_then(ReportLocation::address) {
            check_len("address", address, MAX_ADDRESS_LENGTH)?;
        }
        Ok(())
    }
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.len() > max {
        return Err(ValidationError::TooLong {
            field,
            len: value.len(),
            max,
        });
    }
    Ok(())
}

// Redact debug output because this can contain sensitive user-provided data.
impl fmt::Debug for ReportPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportPayload")
            .field("report_type", &self.report_type)
            .field("description_len", &self.description.len())
            .field("location_present", &self.location.is_some())
            .field("priority", &self.priority)
            .field("is_anonymous", &self.is_anonymous)
            .field("extension_keys", &self.extensions.keys().collect::<Vec<_>>())
            .finish()
    }
}

// --- Queue entries ---

/// A report accepted locally but not yet acknowledged by the remote store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PendingReport {
    local_id: LocalId,
    payload: ReportPayload,
    enqueued_at: DateTime<Utc>,
    attempts: u32,
}

impl PendingReport {
    pub fn new(local_id: LocalId, payload: ReportPayload, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            local_id,
            payload,
            enqueued_at,
            attempts: 0,
        }
    }

    pub fn local_id(&self) -> &LocalId {
        &self.local_id
    }

    pub fn payload(&self) -> &ReportPayload {
        &self.payload
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// Number of failed delivery attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn record_failure(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    pub(crate) fn revert_failure(&mut self) {
        self.attempts = self.attempts.saturating_sub(1);
    }
}

/// Outcome of a successful `submit`. Both variants mean the report is safe.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Delivered { remote_id: RemoteId },
    Queued { local_id: LocalId },
}

impl SubmitOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, SubmitOutcome::Queued { .. })
    }

    pub fn remote_id(&self) -> Option<&RemoteId> {
        match self {
            SubmitOutcome::Delivered { remote_id } => Some(remote_id),
            SubmitOutcome::Queued { .. } => None,
        }
    }

    pub fn local_id(&self) -> Option<&LocalId> {
        match self {
            SubmitOutcome::Queued { local_id } => Some(local_id),
            SubmitOutcome::Delivered { .. } => None,
        }
    }
}

/// Aggregate counts of one sync pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub synced: usize,
    pub failed: usize,
}

impl SyncResult {
    pub fn attempted(&self) -> usize {
        self.synced + self.failed
    }
}
