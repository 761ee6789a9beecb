//! Parsing handler: parse-queue consumer.
//!
//! Each task walks a small state machine:
//!
//! ```text
//! RECEIVED ──fetch──▶ EXTRACTING ──decode + extract──▶ PERSISTED
//!     │                   │
//!     └───────────────────┴──▶ FAILED_RETRYABLE | FAILED_TERMINAL
//! ```
//!
//! PERSISTED upserts the `ParsedEmailRecord` and emits `EmailParsed`.
//! FAILED_RETRYABLE returns a transient error so the message is redelivered.
//! FAILED_TERMINAL records a `FAILED` row and returns a terminal error, which
//! the consumer acknowledges and reports.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::consumer::TaskHandler;
use crate::error::{ExtractError, HandlerError};
use crate::events::{DetailType, EmailParsedDetail, EventEnvelope, EventRouter, ParseTask, PutEventEntry};
use crate::extract::{EmailDocument, Extractor};
use crate::queue::Delivery;
use crate::storage::ObjectStore;
use crate::store::{ParsedEmailRecord, ResultStore};

/// Where a parse task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    Received,
    Extracting,
    Persisted,
    FailedRetryable,
    FailedTerminal,
}

impl ParseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Extracting => "EXTRACTING",
            Self::Persisted => "PERSISTED",
            Self::FailedRetryable => "FAILED_RETRYABLE",
            Self::FailedTerminal => "FAILED_TERMINAL",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Received | Self::Extracting)
    }
}

impl fmt::Display for ParseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ParsingHandler {
    objects: Arc<dyn ObjectStore>,
    store: Arc<dyn ResultStore>,
    extractor: Arc<dyn Extractor>,
    router: Arc<EventRouter>,
    extraction_timeout: Duration,
}

impl ParsingHandler {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        store: Arc<dyn ResultStore>,
        extractor: Arc<dyn Extractor>,
        router: Arc<EventRouter>,
        extraction_timeout: Duration,
    ) -> Self {
        Self {
            objects,
            store,
            extractor,
            router,
            extraction_timeout,
        }
    }

    /// Run one task to a final state.
    pub async fn process(&self, task: &ParseTask) -> (ParseState, Result<(), HandlerError>) {
        let email_id = task.email_ref.email_id.as_str();
        let mut state = ParseState::Received;
        debug!(%email_id, task_id = %task.task_id, %state, "Parse task");

        let result = match self.fetch(task).await {
            Ok(raw) => {
                state = ParseState::Extracting;
                debug!(%email_id, %state, bytes = raw.len(), "Parse task");
                match self.extract_and_persist(task, &raw).await {
                    Ok(()) => {
                        state = ParseState::Persisted;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => (state, Ok(())),
            Err(e) if e.is_retryable() => {
                warn!(%email_id, from = %state, error = %e, "Parse failed, will retry");
                (ParseState::FailedRetryable, Err(e))
            }
            Err(e) => {
                warn!(%email_id, from = %state, error = %e, "Parse failed permanently");
                let recorded = self.record_failure(task, &e).await;
                match recorded {
                    Ok(()) => (ParseState::FailedTerminal, Err(e)),
                    // The FAILED row must exist before the message is acknowledged.
                    Err(db) => (ParseState::FailedRetryable, Err(db)),
                }
            }
        }
    }

    async fn fetch(&self, task: &ParseTask) -> Result<Vec<u8>, HandlerError> {
        let email = &task.email_ref;
        if email.bucket != self.objects.bucket() {
            return Err(HandlerError::Terminal(format!(
                "object {}/{} is not in bucket {}",
                email.bucket,
                email.key,
                self.objects.bucket()
            )));
        }
        Ok(self.objects.get(&email.key).await?)
    }

    async fn extract_and_persist(&self, task: &ParseTask, raw: &[u8]) -> Result<(), HandlerError> {
        let email = &task.email_ref;
        let document = EmailDocument::parse(raw)?;

        let extraction = tokio::time::timeout(self.extraction_timeout, self.extractor.extract(&document))
            .await
            .map_err(|_| ExtractError::Timeout(self.extraction_timeout))??;

        let mut record = ParsedEmailRecord::parsed(&email.email_id, &email.bucket, &email.key, extraction);
        record.sender = document.sender.clone();
        record.subject = document.subject.clone();
        record.received_at = Some(task.payload.received_at);
        self.store.upsert_parsed_email(&record).await?;

        let (categories, item_count) = record
            .extraction
            .as_ref()
            .map(|x| (x.categories.clone(), x.items.len()))
            .unwrap_or_default();
        let detail = EmailParsedDetail {
            email: email.clone(),
            categories,
            item_count,
        };
        let entry = PutEventEntry::pipeline(DetailType::EmailParsed, &detail)
            .map_err(|e| HandlerError::Validation(e.to_string()))?;
        let routed = self.router.put_event(entry).await?;

        info!(
            email_id = %email.email_id,
            extractor = %self.extractor.name(),
            items = item_count,
            event_id = %routed.event_id,
            "Email parsed"
        );
        Ok(())
    }

    async fn record_failure(&self, task: &ParseTask, failure: &HandlerError) -> Result<(), HandlerError> {
        let email = &task.email_ref;
        let mut record = ParsedEmailRecord::failed(&email.email_id, &email.bucket, &email.key, failure.to_string());
        record.received_at = Some(task.payload.received_at);
        self.store.upsert_parsed_email(&record).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for ParsingHandler {
    fn name(&self) -> &'static str {
        "parsing"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let envelope: EventEnvelope = delivery
            .json()
            .map_err(|e| HandlerError::Validation(format!("malformed envelope: {e}")))?;
        let task = ParseTask::from_envelope(&envelope).map_err(HandlerError::Validation)?;
        let (_state, result) = self.process(&task).await;
        result
    }
}
