//! Queue consumer loop shared by every queue-triggered handler.
//!
//! The loop long-polls one queue and hands each delivery to a spawned
//! invocation holding a semaphore permit, so at most `max_concurrency`
//! invocations of a handler run at once. The outcome decides the message's fate:
//!
//! While an invocation runs, its message's visibility window is extended
//! every half window, so only a crash or a timeout lets it be redelivered.
//!
//! - `Ok` acknowledges
//! - a transient error, an invocation timeout or a panic leaves the message
//!   for redelivery once its visibility window closes
//! - a validation or terminal error acknowledges and emits a `TaskFailed`
//!   diagnostic event

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::HandlerLimits;
use crate::error::HandlerError;
use crate::events::{DetailType, EventEnvelope, EventRouter, PutEventEntry, TaskFailedDetail};
use crate::queue::{Delivery, WorkQueue};

/// A handler invoked once per queue delivery.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Handler name used in logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Process one delivery. Must be idempotent: the same message can be
    /// delivered more than once.
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

struct Consumer {
    queue: Arc<WorkQueue>,
    handler: Arc<dyn TaskHandler>,
    router: Arc<EventRouter>,
    limits: HandlerLimits,
}

/// Spawn a consumer for `queue`.
///
/// Returns the loop's `JoinHandle` and a shutdown flag. Once the flag is set
/// the loop stops receiving, waits for in-flight invocations and exits.
pub fn spawn_consumer(
    queue: Arc<WorkQueue>,
    handler: Arc<dyn TaskHandler>,
    router: Arc<EventRouter>,
    limits: HandlerLimits,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let consumer = Arc::new(Consumer {
        queue,
        handler,
        router,
        limits,
    });

    let handle = tokio::spawn(async move {
        let max = consumer.limits.max_concurrency.max(1);
        let permits = Arc::new(Semaphore::new(max));
        info!(
            handler = consumer.handler.name(),
            queue = consumer.queue.name(),
            max_concurrency = max,
            "Consumer started"
        );

        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let wait = consumer.queue.policy().receive_wait;
            let Some(delivery) = consumer.queue.receive(wait).await else {
                continue;
            };
            let consumer = Arc::clone(&consumer);
            tokio::spawn(async move {
                consumer.invoke(delivery).await;
                drop(permit);
            });
        }

        // Wait for in-flight invocations to finish.
        let _ = permits.acquire_many(max as u32).await;
        info!(handler = consumer.handler.name(), "Consumer stopped");
    });

    (handle, shutdown_flag)
}

impl Consumer {
    async fn invoke(&self, delivery: Delivery) {
        let name = self.handler.name();
        let message_id = delivery.message.message_id;
        let receipt = delivery.receipt;
        let receive_count = delivery.receive_count;

        let handler = Arc::clone(&self.handler);
        let timeout = self.limits.invocation_timeout;
        let task_delivery = delivery.clone();
        // Run on its own task so a panic surfaces as a JoinError.
        let mut invocation = tokio::spawn(async move {
            tokio::time::timeout(timeout, handler.handle(&task_delivery)).await
        });

        // Keep the message invisible for as long as the invocation runs.
        let heartbeat = (self.queue.policy().visibility_timeout / 2).max(Duration::from_millis(1));
        let outcome = loop {
            tokio::select! {
                outcome = &mut invocation => break outcome,
                _ = tokio::time::sleep(heartbeat) => {
                    if let Err(e) = self.queue.extend_visibility(receipt).await {
                        warn!(handler = name, %message_id, error = %e, "Could not extend visibility");
                    }
                }
            }
        };

        match outcome {
            Ok(Ok(Ok(()))) => {
                if let Err(e) = self.queue.ack(receipt).await {
                    warn!(handler = name, %message_id, error = %e, "Ack failed; message will be redelivered");
                } else {
                    debug!(handler = name, %message_id, "Task completed");
                }
            }
            Ok(Ok(Err(e))) if e.is_retryable() => {
                warn!(
                    handler = name,
                    %message_id,
                    receive_count,
                    error = %e,
                    "Transient failure; leaving message for redelivery"
                );
            }
            Ok(Ok(Err(e))) => self.fail_terminally(&delivery, e).await,
            Ok(Err(_elapsed)) => {
                warn!(
                    handler = name,
                    %message_id,
                    receive_count,
                    timeout = ?timeout,
                    "Invocation timed out; leaving message for redelivery"
                );
            }
            Err(join_error) => {
                error!(
                    handler = name,
                    %message_id,
                    receive_count,
                    error = %join_error,
                    "Invocation panicked; leaving message for redelivery"
                );
            }
        }
    }

    /// Acknowledge and report. If the diagnostic cannot be emitted the message
    /// is left on the queue so the failure still surfaces, via the DLQ alarm.
    async fn fail_terminally(&self, delivery: &Delivery, failure: HandlerError) {
        let name = self.handler.name();
        let message_id = delivery.message.message_id;
        let envelope = delivery.json::<EventEnvelope>().ok();

        let detail = TaskFailedDetail {
            handler: name.to_string(),
            queue: self.queue.name().to_string(),
            message_id,
            task_id: envelope.as_ref().map(|e| e.id),
            email_id: envelope.as_ref().and_then(|e| {
                e.detail
                    .get("emailId")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            }),
            error_kind: failure.label().to_string(),
            reason: failure.to_string(),
            receive_count: delivery.receive_count,
        };

        error!(
            handler = name,
            %message_id,
            email_id = detail.email_id.as_deref().unwrap_or("-"),
            kind = failure.label(),
            error = %failure,
            "Task failed terminally"
        );

        let reported = match PutEventEntry::pipeline(DetailType::TaskFailed, &detail) {
            Ok(entry) => self.router.put_event(entry).await.map(|_| ()).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = reported {
            error!(handler = name, %message_id, error = %e, "Failed to emit diagnostic event");
            return;
        }

        if let Err(e) = self.queue.ack(delivery.receipt).await {
            warn!(handler = name, %message_id, error = %e, "Ack after terminal failure failed");
        }
    }
}
