//! Queue message and delivery types.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message as stored on a queue. Never mutated after `send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub message_id: Uuid,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            body: body.into(),
            sent_at: Utc::now(),
        }
    }
}

/// One delivery of a message to a consumer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub message: QueueMessage,
    /// Handle for `ack`/`release`; valid until the visibility window closes.
    #[serde(rename = "receiptHandle")]
    pub receipt: Uuid,
    /// How many times this message has been delivered, including this one.
    pub receive_count: u32,
}

impl Delivery {
    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.message.body)
    }
}

/// Point-in-time counters for a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub name: String,
    pub visible: usize,
    pub in_flight: usize,
    pub total_sent: u64,
    pub dead_lettered: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_queue: Option<String>,
}
