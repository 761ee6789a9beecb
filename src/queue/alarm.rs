//! Alarms raised when a message exhausts its deliveries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::error;
use uuid::Uuid;

/// Keep at most this many alarms in memory.
const MAX_ALARMS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    pub queue: String,
    pub dead_letter_queue: String,
    pub message_id: Uuid,
    pub receive_count: u32,
    pub raised_at: DateTime<Utc>,
}

/// Shared, append-only alarm log.
#[derive(Default)]
pub struct AlarmLog {
    alarms: RwLock<Vec<Alarm>>,
}

impl AlarmLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn raise(&self, alarm: Alarm) {
        error!(
            queue = %alarm.queue,
            dead_letter_queue = %alarm.dead_letter_queue,
            message_id = %alarm.message_id,
            receive_count = alarm.receive_count,
            "Message moved to dead-letter queue"
        );
        let mut alarms = self.alarms.write().await;
        if alarms.len() >= MAX_ALARMS {
            alarms.remove(0);
        }
        alarms.push(alarm);
    }

    /// All recorded alarms, oldest first.
    pub async fn list(&self) -> Vec<Alarm> {
        self.alarms.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.alarms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.alarms.read().await.is_empty()
    }
}
