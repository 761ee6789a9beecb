//! Matching handler: match-queue consumer.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::consumer::TaskHandler;
use crate::config::MatchingConfig;
use crate::error::HandlerError;
use crate::events::{DetailType, EventEnvelope, EventRouter, MatchTask, PutEventEntry, SupplierMatchedDetail};
use crate::matching::{MatchStrategy, rank_suppliers};
use crate::queue::Delivery;
use crate::store::{EmailStatus, MatchRecord, ResultStore};

pub struct MatchingHandler {
    store: Arc<dyn ResultStore>,
    strategy: Arc<dyn MatchStrategy>,
    router: Arc<EventRouter>,
    config: MatchingConfig,
}

impl MatchingHandler {
    pub fn new(
        store: Arc<dyn ResultStore>,
        strategy: Arc<dyn MatchStrategy>,
        router: Arc<EventRouter>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            store,
            strategy,
            router,
            config,
        }
    }

    /// Score the catalog for one parsed email and persist the qualifying matches.
    ///
    /// Returns the records written, best first. The stored set for the email is
    /// replaced as a whole. An email whose parsed record
    /// does not exist yet is a transient failure: the parse may still be in
    /// flight, and no match may be written before it lands.
    pub async fn process(&self, task: &MatchTask) -> Result<Vec<MatchRecord>, HandlerError> {
        let email_id = task.email_ref.email_id.as_str();
        let parsed = self
            .store
            .get_parsed_email(email_id)
            .await?
            .ok_or_else(|| HandlerError::Transient(format!("parsed record for {email_id} does not exist yet")))?;
        if parsed.status == EmailStatus::Failed {
            return Err(HandlerError::Terminal(format!("email {email_id} failed parsing")));
        }
        let Some(extraction) = parsed.extraction.as_ref() else {
            return Err(HandlerError::Terminal(format!("email {email_id} has no extraction")));
        };

        let suppliers = self.store.list_suppliers(true).await?;
        let ranked = rank_suppliers(
            self.strategy.as_ref(),
            extraction,
            &suppliers,
            self.config.min_confidence,
            self.config.top_k,
        );

        let strategy = self.strategy.kind().to_string();
        let matched_at = Utc::now();
        let records: Vec<MatchRecord> = ranked
            .into_iter()
            .enumerate()
            .map(|(i, scored)| MatchRecord {
                email_id: email_id.to_string(),
                supplier_id: scored.supplier_id,
                supplier_name: scored.supplier_name,
                confidence: scored.confidence,
                rank: i as u32 + 1,
                strategy: strategy.clone(),
                matched_at,
            })
            .collect();
        // A re-match replaces the previous set, including suppliers that no longer qualify.
        self.store.replace_matches(email_id, &records).await?;

        let detail = SupplierMatchedDetail {
            email_id: email_id.to_string(),
            match_count: records.len(),
            strategy: strategy.clone(),
            top_supplier_id: records.first().map(|r| r.supplier_id.clone()),
        };
        let entry = PutEventEntry::pipeline(DetailType::SupplierMatched, &detail)
            .map_err(|e| HandlerError::Validation(e.to_string()))?;
        self.router.put_event(entry).await?;

        info!(
            %email_id,
            %strategy,
            candidates = suppliers.len(),
            matches = records.len(),
            top = records.first().map(|r| r.supplier_id.as_str()).unwrap_or("-"),
            "Suppliers matched"
        );
        Ok(records)
    }
}

#[async_trait]
impl TaskHandler for MatchingHandler {
    fn name(&self) -> &'static str {
        "matching"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let envelope: EventEnvelope = delivery
            .json()
            .map_err(|e| HandlerError::Validation(format!("malformed envelope: {e}")))?;
        let task = MatchTask::from_envelope(&envelope).map_err(HandlerError::Validation)?;
        self.process(&task).await.map(|_| ())
    }
}
