//! Ingestion: object-creation notification → `EmailReceived` event.

use std::sync::Arc;

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{Error, HandlerError};
use crate::events::{
    DetailType, EmailReceivedDetail, EmailRef, EventRouter, PutEventEntry, PutEventResult, TaskFailedDetail,
};
use crate::storage::{EMAIL_EXTENSION, ObjectCreated, ObjectStore, email_id_from_key};
use crate::store::{EmailStatus, ResultStore};

/// Name reported as the queue of ingestion failures.
pub const NOTIFICATION_CHANNEL: &str = "object-notifications";

/// Stateless: one notification in, at most one event out.
pub struct IngestionHandler {
    router: Arc<EventRouter>,
    prefix: String,
}

impl IngestionHandler {
    pub fn new(router: Arc<EventRouter>, prefix: impl Into<String>) -> Self {
        Self {
            router,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Emit `EmailReceived` for a landed object.
    ///
    /// Returns `Ok(None)` for objects outside the ingest prefix and for
    /// objects that are not `.eml` files.
    pub async fn handle(&self, created: &ObjectCreated) -> Result<Option<PutEventResult>, HandlerError> {
        if !created.key.starts_with(&self.prefix) {
            debug!(key = %created.key, prefix = %self.prefix, "Object outside ingest prefix, skipped");
            return Ok(None);
        }
        if !created.key.ends_with(EMAIL_EXTENSION) {
            debug!(key = %created.key, "Not an email object, skipped");
            return Ok(None);
        }
        let email_id = email_id_from_key(&created.key, &self.prefix).ok_or_else(|| {
            HandlerError::Validation(format!("cannot derive an email id from key '{}'", created.key))
        })?;

        let detail = EmailReceivedDetail {
            email: EmailRef {
                bucket: created.bucket.clone(),
                key: created.key.clone(),
                email_id: email_id.clone(),
            },
            size: created.size,
            received_at: created.event_time,
        };
        let entry = PutEventEntry::pipeline(DetailType::EmailReceived, &detail)
            .map_err(|e| HandlerError::Validation(e.to_string()))?;
        let result = self.router.put_event(entry).await?;

        info!(
            %email_id,
            key = %created.key,
            event_id = %result.event_id,
            rules = result.matched_rules.len(),
            "Email received"
        );
        Ok(Some(result))
    }

    /// Handle one notification, reporting a failure as `TaskFailed`.
    pub async fn ingest(&self, created: &ObjectCreated) {
        let Err(failure) = self.handle(created).await else {
            return;
        };
        error!(
            bucket = %created.bucket,
            key = %created.key,
            kind = failure.label(),
            error = %failure,
            "Ingestion failed"
        );

        let detail = TaskFailedDetail {
            handler: "ingestion".to_string(),
            queue: NOTIFICATION_CHANNEL.to_string(),
            message_id: Uuid::new_v4(),
            task_id: None,
            email_id: email_id_from_key(&created.key, &self.prefix),
            error_kind: failure.label().to_string(),
            reason: failure.to_string(),
            receive_count: 1,
        };
        let reported = match PutEventEntry::pipeline(DetailType::TaskFailed, &detail) {
            Ok(entry) => self.router.put_event(entry).await.map(|_| ()).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = reported {
            error!(key = %created.key, error = %e, "Failed to emit ingestion diagnostic");
        }
    }

    /// Re-ingest landed emails the result store has no outcome for.
    ///
    /// Covers objects whose notification was lost while the pipeline was
    /// down: no record at all, or a `PARSED` record whose match task never
    /// completed. Returns how many objects were re-ingested.
    pub async fn reconcile(&self, objects: &dyn ObjectStore, store: &dyn ResultStore) -> Result<usize, Error> {
        let mut reingested = 0;
        for created in objects.list(&self.prefix).await? {
            let Some(email_id) = email_id_from_key(&created.key, &self.prefix) else {
                continue;
            };
            let pending = match store.get_parsed_email(&email_id).await? {
                None => true,
                Some(record) => record.status == EmailStatus::Parsed,
            };
            if pending {
                self.ingest(&created).await;
                reingested += 1;
            }
        }
        if reingested > 0 {
            info!(count = reingested, prefix = %self.prefix, "Re-ingested unfinished emails");
        }
        Ok(reingested)
    }
}

/// Consume object notifications until stopped or every sender is dropped.
///
/// Returns the loop's `JoinHandle` and its stop signal. On stop the channel
/// is closed and every notification already buffered is still ingested.
pub fn spawn_ingestion(
    mut notifications: mpsc::Receiver<ObjectCreated>,
    handler: Arc<IngestionHandler>,
) -> (JoinHandle<()>, Arc<Notify>) {
    let stop = Arc::new(Notify::new());
    let stop_signal = Arc::clone(&stop);
    let handle = tokio::spawn(async move {
        info!(prefix = %handler.prefix, "Ingestion started");
        loop {
            tokio::select! {
                next = notifications.recv() => match next {
                    Some(created) => handler.ingest(&created).await,
                    None => break,
                },
                _ = stop.notified() => {
                    notifications.close();
                    let mut drained = 0usize;
                    while let Some(created) = notifications.recv().await {
                        handler.ingest(&created).await;
                        drained += 1;
                    }
                    debug!(drained, "Ingestion drained");
                    break;
                }
            }
        }
        info!("Ingestion stopped");
    });
    (handle, stop_signal)
}
