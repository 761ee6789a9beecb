//! Diagnostics: collects `TaskFailed` events for operators.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use super::consumer::TaskHandler;
use crate::error::HandlerError;
use crate::events::{DetailType, EventEnvelope, TaskFailedDetail};
use crate::queue::Delivery;

/// Most recent failures kept in memory.
const MAX_FAILURES: usize = 500;

#[derive(Default)]
pub struct DiagnosticsLog {
    failures: RwLock<VecDeque<TaskFailedDetail>>,
}

impl DiagnosticsLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, failure: TaskFailedDetail) {
        let mut failures = self.failures.write().await;
        if failures.len() >= MAX_FAILURES {
            failures.pop_front();
        }
        failures.push_back(failure);
    }

    /// Newest first.
    pub async fn recent(&self, limit: usize) -> Vec<TaskFailedDetail> {
        self.failures.read().await.iter().rev().take(limit).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.failures.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.failures.read().await.is_empty()
    }
}

pub struct DiagnosticsHandler {
    log: Arc<DiagnosticsLog>,
}

impl DiagnosticsHandler {
    pub fn new(log: Arc<DiagnosticsLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl TaskHandler for DiagnosticsHandler {
    fn name(&self) -> &'static str {
        "diagnostics"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let envelope: EventEnvelope = delivery
            .json()
            .map_err(|e| HandlerError::Validation(format!("malformed envelope: {e}")))?;
        if !envelope.is(DetailType::TaskFailed) {
            return Err(HandlerError::Validation(format!(
                "unexpected detail-type {}",
                envelope.detail_type
            )));
        }
        let failure: TaskFailedDetail = envelope
            .detail_as()
            .map_err(|e| HandlerError::Validation(format!("malformed detail: {e}")))?;
        warn!(
            handler = %failure.handler,
            queue = %failure.queue,
            message_id = %failure.message_id,
            email_id = failure.email_id.as_deref().unwrap_or("-"),
            kind = %failure.error_kind,
            reason = %failure.reason,
            "Task failure recorded"
        );
        self.log.record(failure).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn failure(email_id: &str) -> TaskFailedDetail {
        TaskFailedDetail {
            handler: "parsing".into(),
            queue: "parse-queue".into(),
            message_id: Uuid::new_v4(),
            task_id: None,
            email_id: Some(email_id.into()),
            error_kind: "terminal".into(),
            reason: "not a MIME message".into(),
            receive_count: 1,
        }
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_bounded() {
        let log = DiagnosticsLog::new();
        for i in 0..(MAX_FAILURES + 2) {
            log.record(failure(&format!("e{i}"))).await;
        }
        assert_eq!(log.len().await, MAX_FAILURES);
        let recent = log.recent(2).await;
        assert_eq!(recent[0].email_id.as_deref(), Some(format!("e{}", MAX_FAILURES + 1).as_str()));
    }
}
