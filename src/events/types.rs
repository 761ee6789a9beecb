//! Event schema: entries submitted to the bus, the envelopes it delivers,
//! and the typed payloads carried in `detail`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `source` used by every event the pipeline emits.
pub const SOURCE: &str = "email-processor";

/// Envelope schema version.
pub const ENVELOPE_VERSION: &str = "0";

/// The `detail-type` values the pipeline emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetailType {
    EmailReceived,
    EmailParsed,
    SupplierMatched,
    TaskFailed,
}

impl DetailType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailReceived => "EmailReceived",
            Self::EmailParsed => "EmailParsed",
            Self::SupplierMatched => "SupplierMatched",
            Self::TaskFailed => "TaskFailed",
        }
    }
}

impl fmt::Display for DetailType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event submitted to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutEventEntry {
    pub source: String,
    #[serde(rename = "detail-type", alias = "detailType")]
    pub detail_type: String,
    pub detail: serde_json::Value,
}

impl PutEventEntry {
    pub fn new(
        source: impl Into<String>,
        detail_type: impl Into<String>,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            source: source.into(),
            detail_type: detail_type.into(),
            detail,
        }
    }

    /// A pipeline event with a typed detail payload.
    pub fn pipeline<T: Serialize>(
        detail_type: DetailType,
        detail: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(SOURCE, detail_type.as_str(), serde_json::to_value(detail)?))
    }
}

/// What the router delivers into a target queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub version: String,
    pub id: Uuid,
    pub source: String,
    #[serde(rename = "detail-type")]
    pub detail_type: String,
    pub time: DateTime<Utc>,
    pub region: String,
    #[serde(rename = "event-bus")]
    pub event_bus: String,
    #[serde(default)]
    pub resources: Vec<String>,
    pub detail: serde_json::Value,
}

impl EventEnvelope {
    pub fn is(&self, detail_type: DetailType) -> bool {
        self.detail_type == detail_type.as_str()
    }

    pub fn detail_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.detail.clone())
    }
}

/// Where an email lives and the id it is known by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailRef {
    pub bucket: String,
    pub key: String,
    pub email_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailReceivedDetail {
    #[serde(flatten)]
    pub email: EmailRef,
    pub size: u64,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailParsedDetail {
    #[serde(flatten)]
    pub email: EmailRef,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub item_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplierMatchedDetail {
    pub email_id: String,
    pub match_count: usize,
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_supplier_id: Option<String>,
}

/// Diagnostic emitted when a task fails terminally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailedDetail {
    pub handler: String,
    pub queue: String,
    pub message_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_id: Option<String>,
    pub error_kind: String,
    pub reason: String,
    pub receive_count: u32,
}

/// A queued unit of work: the envelope id plus the email it concerns.
#[derive(Debug, Clone, PartialEq)]
pub struct Task<P> {
    pub task_id: Uuid,
    pub email_ref: EmailRef,
    pub payload: P,
}

/// Parse-queue task, built from an `EmailReceived` envelope.
pub type ParseTask = Task<EmailReceivedDetail>;

/// Match-queue task, built from an `EmailParsed` envelope.
pub type MatchTask = Task<EmailParsedDetail>;

impl ParseTask {
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self, String> {
        let detail: EmailReceivedDetail = typed_detail(envelope, DetailType::EmailReceived)?;
        Ok(Self {
            task_id: envelope.id,
            email_ref: detail.email.clone(),
            payload: detail,
        })
    }
}

impl MatchTask {
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self, String> {
        let detail: EmailParsedDetail = typed_detail(envelope, DetailType::EmailParsed)?;
        Ok(Self {
            task_id: envelope.id,
            email_ref: detail.email.clone(),
            payload: detail,
        })
    }
}

fn typed_detail<T: DeserializeOwned>(
    envelope: &EventEnvelope,
    expected: DetailType,
) -> Result<T, String> {
    if !envelope.is(expected) {
        return Err(format!(
            "expected detail-type {expected}, got {}",
            envelope.detail_type
        ));
    }
    envelope
        .detail_as()
        .map_err(|e| format!("malformed {expected} detail: {e}"))
}
