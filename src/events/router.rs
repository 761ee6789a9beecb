//! Named event bus routing events to queues through pattern rules.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::pattern::EventPattern;
use super::types::{ENVELOPE_VERSION, EventEnvelope, PutEventEntry};
use crate::error::RouterError;
use crate::queue::WorkQueue;

/// Maximum encoded size of a single event entry.
pub const MAX_EVENT_SIZE: usize = 256 * 1024;

struct Rule {
    name: String,
    pattern: EventPattern,
    target: Arc<WorkQueue>,
}

/// Rule description for listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleInfo {
    pub name: String,
    pub pattern: EventPattern,
    pub target: String,
}

/// Outcome of `put_event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PutEventResult {
    pub event_id: Uuid,
    /// Names of the rules that delivered the event, in evaluation order.
    pub matched_rules: Vec<String>,
}

impl PutEventResult {
    pub fn delivered(&self) -> bool {
        !self.matched_rules.is_empty()
    }
}

pub struct EventRouter {
    bus_name: String,
    region: String,
    rules: RwLock<Vec<Rule>>,
}

impl EventRouter {
    pub fn new(bus_name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bus_name: bus_name.into(),
            region: region.into(),
            rules: RwLock::new(Vec::new()),
        }
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    /// Register a rule. Rules are evaluated in registration order.
    pub async fn add_rule(
        &self,
        name: impl Into<String>,
        pattern: EventPattern,
        target: Arc<WorkQueue>,
    ) -> Result<(), RouterError> {
        let name = name.into();
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.name == name) {
            return Err(RouterError::DuplicateRule(name));
        }
        info!(
            bus = %self.bus_name,
            rule = %name,
            target = %target.name(),
            "Event rule registered"
        );
        rules.push(Rule {
            name,
            pattern,
            target,
        });
        Ok(())
    }

    /// Remove a rule by name. Returns whether it existed.
    pub async fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.name != name);
        before != rules.len()
    }

    pub async fn rules(&self) -> Vec<RuleInfo> {
        self.rules
            .read()
            .await
            .iter()
            .map(|r| RuleInfo {
                name: r.name.clone(),
                pattern: r.pattern.clone(),
                target: r.target.name().to_string(),
            })
            .collect()
    }

    /// Validate an event, wrap it in an envelope and deliver it to every matching rule's queue.
    ///
    /// An event that matches no rule is accepted with an empty `matched_rules`.
    pub async fn put_event(&self, entry: PutEventEntry) -> Result<PutEventResult, RouterError> {
        validate(&entry)?;

        let envelope = EventEnvelope {
            version: ENVELOPE_VERSION.to_string(),
            id: Uuid::new_v4(),
            source: entry.source.clone(),
            detail_type: entry.detail_type.clone(),
            time: Utc::now(),
            region: self.region.clone(),
            event_bus: self.bus_name.clone(),
            resources: Vec::new(),
            detail: entry.detail.clone(),
        };
        let body = serde_json::to_string(&envelope).map_err(|e| RouterError::Validation {
            field: "detail".to_string(),
            reason: format!("cannot be encoded: {e}"),
        })?;

        let mut matched_rules = Vec::new();
        let rules = self.rules.read().await;
        for rule in rules.iter().filter(|r| r.pattern.matches(&entry)) {
            rule.target.send(body.clone()).await;
            matched_rules.push(rule.name.clone());
        }
        drop(rules);

        debug!(
            bus = %self.bus_name,
            event_id = %envelope.id,
            detail_type = %entry.detail_type,
            matched = matched_rules.len(),
            "Event routed"
        );

        Ok(PutEventResult {
            event_id: envelope.id,
            matched_rules,
        })
    }
}

fn validate(entry: &PutEventEntry) -> Result<(), RouterError> {
    if entry.source.trim().is_empty() {
        return Err(field_error("source", "must not be empty"));
    }
    if entry.detail_type.trim().is_empty() {
        return Err(field_error("detail-type", "must not be empty"));
    }
    if !entry.detail.is_object() {
        return Err(field_error("detail", "must be a JSON object"));
    }
    let size = serde_json::to_vec(entry)
        .map_err(|e| field_error("detail", &format!("cannot be encoded: {e}")))?
        .len();
    if size > MAX_EVENT_SIZE {
        return Err(RouterError::PayloadTooLarge {
            size,
            max: MAX_EVENT_SIZE,
        });
    }
    Ok(())
}

fn field_error(field: &str, reason: &str) -> RouterError {
    RouterError::Validation {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
