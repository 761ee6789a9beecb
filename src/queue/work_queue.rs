//! Work queue with visibility windows and a dead-letter redrive policy.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::alarm::{Alarm, AlarmLog};
use super::message::{Delivery, QueueMessage, QueueStats};
use crate::config::QueuePolicy;
use crate::error::QueueError;

struct Entry {
    message: QueueMessage,
    receive_count: u32,
}

struct InFlight {
    entry: Entry,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    visible: VecDeque<Entry>,
    in_flight: HashMap<Uuid, InFlight>,
    total_sent: u64,
    dead_lettered: u64,
}

/// At-least-once message queue.
///
/// A received message stays invisible for the policy's visibility window.
/// If it is not acknowledged in time it becomes visible again. Once a message
/// has been received `max_receive_count` times and comes due again, it is
/// moved unchanged to the dead-letter queue and an alarm is raised. Queues
/// without a dead-letter queue redeliver indefinitely.
pub struct WorkQueue {
    name: String,
    policy: QueuePolicy,
    dead_letter: Option<Arc<WorkQueue>>,
    alarms: Arc<AlarmLog>,
    state: Mutex<QueueState>,
    ready: Notify,
}

impl WorkQueue {
    pub fn new(
        name: impl Into<String>,
        policy: QueuePolicy,
        dead_letter: Option<Arc<WorkQueue>>,
        alarms: Arc<AlarmLog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            policy,
            dead_letter,
            alarms,
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    pub fn dead_letter_queue(&self) -> Option<&Arc<WorkQueue>> {
        self.dead_letter.as_ref()
    }

    /// Enqueue a message with a fresh id.
    pub async fn send(&self, body: impl Into<String>) -> QueueMessage {
        let message = QueueMessage::new(body);
        debug!(queue = %self.name, message_id = %message.message_id, "Message sent");
        self.enqueue(message.clone()).await;
        message
    }

    /// Serialize `value` as JSON and enqueue it.
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<QueueMessage, QueueError> {
        let body = serde_json::to_string(value)?;
        Ok(self.send(body).await)
    }

    async fn enqueue(&self, message: QueueMessage) {
        {
            let mut state = self.state.lock().await;
            state.visible.push_back(Entry {
                message,
                receive_count: 0,
            });
            state.total_sent += 1;
        }
        self.ready.notify_one();
    }

    /// Receive one message, waiting up to `wait` for one to become visible.
    pub async fn receive(&self, wait: Duration) -> Option<Delivery> {
        let until = Instant::now() + wait;
        loop {
            let (delivery, exhausted, next_deadline) = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let mut exhausted = self.reclaim(&mut state, now);

                let mut delivery = None;
                while let Some(mut entry) = state.visible.pop_front() {
                    if self.is_exhausted(&entry) {
                        exhausted.push(entry);
                        continue;
                    }
                    entry.receive_count += 1;
                    let receipt = Uuid::new_v4();
                    delivery = Some(Delivery {
                        message: entry.message.clone(),
                        receipt,
                        receive_count: entry.receive_count,
                    });
                    state.in_flight.insert(
                        receipt,
                        InFlight {
                            entry,
                            deadline: now + self.policy.visibility_timeout,
                        },
                    );
                    break;
                }
                state.dead_lettered += exhausted.len() as u64;

                let next_deadline = state.in_flight.values().map(|f| f.deadline).min();
                (delivery, exhausted, next_deadline)
            };

            self.move_to_dead_letter(exhausted).await;

            if let Some(delivery) = delivery {
                debug!(
                    queue = %self.name,
                    message_id = %delivery.message.message_id,
                    receive_count = delivery.receive_count,
                    "Message received"
                );
                return Some(delivery);
            }

            if Instant::now() >= until {
                return None;
            }
            let wake = next_deadline.map_or(until, |deadline| deadline.min(until));
            let _ = tokio::time::timeout_at(wake, self.ready.notified()).await;
        }
    }

    /// Delete an in-flight message. Fails if the receipt expired or was already used.
    pub async fn ack(&self, receipt: Uuid) -> Result<(), QueueError> {
        let (result, exhausted) = {
            let mut state = self.state.lock().await;
            let exhausted = self.reclaim(&mut state, Instant::now());
            state.dead_lettered += exhausted.len() as u64;
            let result = match state.in_flight.remove(&receipt) {
                Some(flight) => {
                    debug!(
                        queue = %self.name,
                        message_id = %flight.entry.message.message_id,
                        "Message acknowledged"
                    );
                    Ok(())
                }
                None => Err(self.unknown_receipt(receipt)),
            };
            (result, exhausted)
        };
        self.move_to_dead_letter(exhausted).await;
        result
    }

    /// Make an in-flight message visible again right away.
    pub async fn release(&self, receipt: Uuid) -> Result<(), QueueError> {
        let (result, exhausted) = {
            let mut state = self.state.lock().await;
            let exhausted = self.reclaim(&mut state, Instant::now());
            state.dead_lettered += exhausted.len() as u64;
            let result = match state.in_flight.remove(&receipt) {
                Some(flight) => {
                    state.visible.push_front(flight.entry);
                    Ok(())
                }
                None => Err(self.unknown_receipt(receipt)),
            };
            (result, exhausted)
        };
        self.move_to_dead_letter(exhausted).await;
        if result.is_ok() {
            self.ready.notify_one();
        }
        result
    }

    /// Restart the visibility window of an in-flight message.
    pub async fn extend_visibility(&self, receipt: Uuid) -> Result<(), QueueError> {
        let (result, exhausted) = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let exhausted = self.reclaim(&mut state, now);
            state.dead_lettered += exhausted.len() as u64;
            let result = match state.in_flight.get_mut(&receipt) {
                Some(flight) => {
                    flight.deadline = now + self.policy.visibility_timeout;
                    Ok(())
                }
                None => Err(self.unknown_receipt(receipt)),
            };
            (result, exhausted)
        };
        self.move_to_dead_letter(exhausted).await;
        result
    }

    pub async fn stats(&self) -> QueueStats {
        let (stats, exhausted) = {
            let mut state = self.state.lock().await;
            let exhausted = self.reclaim(&mut state, Instant::now());
            state.dead_lettered += exhausted.len() as u64;
            let stats = QueueStats {
                name: self.name.clone(),
                visible: state.visible.len(),
                in_flight: state.in_flight.len(),
                total_sent: state.total_sent,
                dead_lettered: state.dead_lettered,
                dead_letter_queue: self.dead_letter.as_ref().map(|q| q.name.clone()),
            };
            (stats, exhausted)
        };
        self.move_to_dead_letter(exhausted).await;
        stats
    }

    /// Visible messages, oldest first, without receiving them.
    pub async fn peek(&self, limit: usize) -> Vec<QueueMessage> {
        let state = self.state.lock().await;
        state
            .visible
            .iter()
            .take(limit)
            .map(|e| e.message.clone())
            .collect()
    }

    /// Remove and return every visible message.
    pub async fn drain(&self) -> Vec<QueueMessage> {
        let mut state = self.state.lock().await;
        state.visible.drain(..).map(|e| e.message).collect()
    }

    /// Remove and return every message waiting in this queue's dead-letter queue.
    pub async fn drain_dead_letters(&self) -> Result<Vec<QueueMessage>, QueueError> {
        let dlq = self.require_dead_letter()?;
        Ok(dlq.drain().await)
    }

    /// Move dead-lettered messages back onto this queue with a fresh receive count.
    pub async fn redrive(&self) -> Result<usize, QueueError> {
        let messages = self.drain_dead_letters().await?;
        let count = messages.len();
        for message in messages {
            self.enqueue(message).await;
        }
        if count > 0 {
            info!(queue = %self.name, count, "Redrove dead-lettered messages");
        }
        Ok(count)
    }

    fn require_dead_letter(&self) -> Result<&Arc<WorkQueue>, QueueError> {
        self.dead_letter
            .as_ref()
            .ok_or_else(|| QueueError::NoDeadLetterQueue {
                queue: self.name.clone(),
            })
    }

    fn unknown_receipt(&self, receipt: Uuid) -> QueueError {
        QueueError::UnknownReceipt {
            queue: self.name.clone(),
            receipt,
        }
    }

    fn is_exhausted(&self, entry: &Entry) -> bool {
        self.dead_letter.is_some() && entry.receive_count >= self.policy.max_receive_count
    }

    /// Return expired in-flight messages to the visible list; exhausted ones are handed back.
    fn reclaim(&self, state: &mut QueueState, now: Instant) -> Vec<Entry> {
        let expired: Vec<Uuid> = state
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.deadline <= now)
            .map(|(receipt, _)| *receipt)
            .collect();

        let mut exhausted = Vec::new();
        for receipt in expired {
            let Some(flight) = state.in_flight.remove(&receipt) else {
                continue;
            };
            if self.is_exhausted(&flight.entry) {
                exhausted.push(flight.entry);
            } else {
                debug!(
                    queue = %self.name,
                    message_id = %flight.entry.message.message_id,
                    receive_count = flight.entry.receive_count,
                    "Visibility window expired, message visible again"
                );
                state.visible.push_back(flight.entry);
            }
        }
        exhausted
    }

    async fn move_to_dead_letter(&self, exhausted: Vec<Entry>) {
        if exhausted.is_empty() {
            return;
        }
        let Some(dlq) = self.dead_letter.as_ref() else {
            warn!(queue = %self.name, "Exhausted messages without a dead-letter queue");
            return;
        };
        for entry in exhausted {
            let alarm = Alarm {
                queue: self.name.clone(),
                dead_letter_queue: dlq.name.clone(),
                message_id: entry.message.message_id,
                receive_count: entry.receive_count,
                raised_at: Utc::now(),
            };
            dlq.enqueue(entry.message).await;
            self.alarms.raise(alarm).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(20);
    const NO_WAIT: Duration = Duration::ZERO;

    fn policy(max_receive_count: u32) -> QueuePolicy {
        QueuePolicy {
            visibility_timeout: WINDOW,
            max_receive_count,
            receive_wait: Duration::from_millis(50),
        }
    }

    fn queue_with_dlq(max_receive_count: u32) -> (Arc<WorkQueue>, Arc<WorkQueue>, Arc<AlarmLog>) {
        let alarms = Arc::new(AlarmLog::new());
        let dlq = WorkQueue::new("parse-dead-letter-queue", policy(1), None, alarms.clone());
        let queue = WorkQueue::new(
            "parse-queue",
            policy(max_receive_count),
            Some(dlq.clone()),
            alarms.clone(),
        );
        (queue, dlq, alarms)
    }

    async fn pass_window() {
        tokio::time::sleep(WINDOW + Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn send_receive_ack() {
        let (queue, _, _) = queue_with_dlq(5);
        let sent = queue.send("hello").await;

        let delivery = queue.receive(NO_WAIT).await.unwrap();
        assert_eq!(delivery.message, sent);
        assert_eq!(delivery.receive_count, 1);

        // Invisible while in flight.
        assert!(queue.receive(NO_WAIT).await.is_none());

        queue.ack(delivery.receipt).await.unwrap();
        assert!(matches!(
            queue.ack(delivery.receipt).await,
            Err(QueueError::UnknownReceipt { .. })
        ));

        pass_window().await;
        assert!(queue.receive(NO_WAIT).await.is_none());
    }

    #[tokio::test]
    async fn unacked_message_is_redelivered() {
        let (queue, _, _) = queue_with_dlq(5);
        let sent = queue.send("retry me").await;

        let first = queue.receive(NO_WAIT).await.unwrap();
        pass_window().await;
        let second = queue.receive(NO_WAIT).await.unwrap();

        assert_eq!(second.message.message_id, sent.message_id);
        assert_eq!(second.receive_count, 2);
        assert_ne!(first.receipt, second.receipt);
    }

    #[tokio::test]
    async fn ack_after_window_is_rejected() {
        let (queue, _, _) = queue_with_dlq(5);
        queue.send("late").await;
        let delivery = queue.receive(NO_WAIT).await.unwrap();
        pass_window().await;

        assert!(queue.ack(delivery.receipt).await.is_err());
        // The message is still there for the next consumer.
        assert!(queue.receive(NO_WAIT).await.is_some());
    }

    #[tokio::test]
    async fn extending_visibility_keeps_message_in_flight() {
        let policy = QueuePolicy {
            visibility_timeout: Duration::from_millis(100),
            ..policy(2)
        };
        let queue = WorkQueue::new("slow-queue", policy, None, Arc::new(AlarmLog::new()));
        queue.send("slow").await;
        let delivery = queue.receive(NO_WAIT).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        queue.extend_visibility(delivery.receipt).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Past the first window, inside the extended one.
        assert!(queue.receive(NO_WAIT).await.is_none());
        queue.ack(delivery.receipt).await.unwrap();
        assert!(queue.extend_visibility(delivery.receipt).await.is_err());
    }

    #[tokio::test]
    async fn release_makes_message_visible_immediately() {
        let (queue, _, _) = queue_with_dlq(5);
        queue.send("x").await;
        let delivery = queue.receive(NO_WAIT).await.unwrap();
        queue.release(delivery.receipt).await.unwrap();

        let again = queue.receive(NO_WAIT).await.unwrap();
        assert_eq!(again.receive_count, 2);
    }

    #[tokio::test]
    async fn exhausted_message_moves_verbatim_to_dead_letter_queue() {
        let (queue, dlq, alarms) = queue_with_dlq(2);
        let body = r#"{"detail":{"emailId":"rfq-001"}}"#;
        let sent = queue.send(body).await;

        for _ in 0..2 {
            assert!(queue.receive(NO_WAIT).await.is_some());
            pass_window().await;
        }
        assert!(queue.receive(NO_WAIT).await.is_none());

        let dead = dlq.receive(NO_WAIT).await.unwrap();
        assert_eq!(dead.message.message_id, sent.message_id);
        assert_eq!(dead.message.body.as_bytes(), body.as_bytes());
        assert_eq!(dead.message.sent_at, sent.sent_at);

        let raised = alarms.list().await;
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].message_id, sent.message_id);
        assert_eq!(raised[0].receive_count, 2);

        let stats = queue.stats().await;
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.visible + stats.in_flight, 0);
    }

    #[tokio::test]
    async fn queue_without_dead_letter_redelivers_forever() {
        let alarms = Arc::new(AlarmLog::new());
        let queue = WorkQueue::new("diagnostics-queue", policy(1), None, alarms.clone());
        queue.send("x").await;
        for n in 1..=3 {
            let delivery = queue.receive(NO_WAIT).await.unwrap();
            assert_eq!(delivery.receive_count, n);
            pass_window().await;
        }
        assert!(alarms.is_empty().await);
    }

    #[tokio::test]
    async fn long_poll_wakes_on_send() {
        let (queue, _, _) = queue_with_dlq(5);
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.send("wake").await;

        let delivery = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.body, "wake");
    }

    #[tokio::test]
    async fn long_poll_times_out_empty() {
        let (queue, _, _) = queue_with_dlq(5);
        let started = Instant::now();
        assert!(queue.receive(Duration::from_millis(30)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn redrive_resets_receive_count() {
        let (queue, dlq, _) = queue_with_dlq(1);
        let sent = queue.send("poison").await;
        queue.receive(NO_WAIT).await.unwrap();
        pass_window().await;
        assert!(queue.receive(NO_WAIT).await.is_none());
        assert_eq!(dlq.peek(10).await.len(), 1);

        assert_eq!(queue.redrive().await.unwrap(), 1);
        assert!(dlq.peek(10).await.is_empty());

        let delivery = queue.receive(NO_WAIT).await.unwrap();
        assert_eq!(delivery.message.message_id, sent.message_id);
        assert_eq!(delivery.receive_count, 1);
    }

    #[tokio::test]
    async fn drain_requires_dead_letter_queue() {
        let queue = WorkQueue::new("solo", policy(1), None, Arc::new(AlarmLog::new()));
        assert!(matches!(
            queue.drain_dead_letters().await,
            Err(QueueError::NoDeadLetterQueue { .. })
        ));
    }

    #[tokio::test]
    async fn send_json_encodes_body() {
        let (queue, _, _) = queue_with_dlq(5);
        queue
            .send_json(&serde_json::json!({"emailId": "rfq-001"}))
            .await
            .unwrap();
        let delivery = queue.receive(NO_WAIT).await.unwrap();
        let value: serde_json::Value = delivery.json().unwrap();
        assert_eq!(value["emailId"], "rfq-001");
    }
}
