//! Result finalizer: result-queue consumer that closes out an email.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::consumer::TaskHandler;
use crate::error::HandlerError;
use crate::events::{DetailType, EventEnvelope, SupplierMatchedDetail};
use crate::queue::Delivery;
use crate::store::ResultStore;

/// Marks the parsed record `MATCHED` with its match count.
pub struct ResultFinalizer {
    store: Arc<dyn ResultStore>,
}

impl ResultFinalizer {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self { store }
    }

    pub async fn finalize(&self, detail: &SupplierMatchedDetail) -> Result<(), HandlerError> {
        let count = u32::try_from(detail.match_count)
            .map_err(|_| HandlerError::Validation(format!("match count {} out of range", detail.match_count)))?;
        if !self.store.mark_matched(&detail.email_id, count).await? {
            return Err(HandlerError::Transient(format!(
                "parsed record for {} does not exist yet",
                detail.email_id
            )));
        }
        info!(email_id = %detail.email_id, matches = count, "Email matched");
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for ResultFinalizer {
    fn name(&self) -> &'static str {
        "finalizer"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let envelope: EventEnvelope = delivery
            .json()
            .map_err(|e| HandlerError::Validation(format!("malformed envelope: {e}")))?;
        if !envelope.is(DetailType::SupplierMatched) {
            return Err(HandlerError::Validation(format!(
                "expected detail-type {}, got {}",
                DetailType::SupplierMatched,
                envelope.detail_type
            )));
        }
        let detail: SupplierMatchedDetail = envelope
            .detail_as()
            .map_err(|e| HandlerError::Validation(format!("malformed detail: {e}")))?;
        self.finalize(&detail).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableNames;
    use crate::extract::Extraction;
    use crate::store::{EmailStatus, LibSqlStore, ParsedEmailRecord};

    fn detail(email_id: &str, count: usize) -> SupplierMatchedDetail {
        SupplierMatchedDetail {
            email_id: email_id.into(),
            match_count: count,
            strategy: "fuzzy".into(),
            top_supplier_id: None,
        }
    }

    #[tokio::test]
    async fn marks_record_matched_idempotently() {
        let store = Arc::new(LibSqlStore::new_memory(TableNames::default()).await.unwrap());
        let record = ParsedEmailRecord::parsed("rfq-001", "inbound", "emails/rfq-001.eml", Extraction::default());
        store.upsert_parsed_email(&record).await.unwrap();
        let finalizer = ResultFinalizer::new(store.clone());

        finalizer.finalize(&detail("rfq-001", 3)).await.unwrap();
        finalizer.finalize(&detail("rfq-001", 3)).await.unwrap();

        let record = store.get_parsed_email("rfq-001").await.unwrap().unwrap();
        assert_eq!(record.status, EmailStatus::Matched);
        assert_eq!(record.match_count, Some(3));
    }

    #[tokio::test]
    async fn unknown_email_is_retryable() {
        let store = Arc::new(LibSqlStore::new_memory(TableNames::default()).await.unwrap());
        let err = ResultFinalizer::new(store).finalize(&detail("nope", 0)).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
