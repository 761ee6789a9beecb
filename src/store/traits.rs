//! `ResultStore` trait: the single async interface to the three result tables.

use async_trait::async_trait;

use super::models::{EmailStatus, MatchRecord, ParsedEmailRecord, SupplierRecord};
use crate::error::DatabaseError;

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Parsed emails ───────────────────────────────────────────────

    /// Insert or replace the record for `record.email_id`.
    ///
    /// A re-parse never moves a `MATCHED` record back to `PARSED`.
    async fn upsert_parsed_email(&self, record: &ParsedEmailRecord) -> Result<(), DatabaseError>;

    async fn get_parsed_email(&self, email_id: &str)
    -> Result<Option<ParsedEmailRecord>, DatabaseError>;

    /// Newest first, optionally filtered by status.
    async fn list_parsed_emails(
        &self,
        status: Option<EmailStatus>,
        limit: usize,
    ) -> Result<Vec<ParsedEmailRecord>, DatabaseError>;

    /// Mark an email `MATCHED` with its match count. Returns false if the email is unknown.
    async fn mark_matched(&self, email_id: &str, match_count: u32) -> Result<bool, DatabaseError>;

    // ── Suppliers ───────────────────────────────────────────────────

    async fn upsert_supplier(&self, supplier: &SupplierRecord) -> Result<(), DatabaseError>;

    async fn get_supplier(&self, supplier_id: &str)
    -> Result<Option<SupplierRecord>, DatabaseError>;

    /// Ordered by supplier id.
    async fn list_suppliers(&self, active_only: bool) -> Result<Vec<SupplierRecord>, DatabaseError>;

    // ── Match history ───────────────────────────────────────────────

    /// Insert or refresh the row for `(email_id, supplier_id)`.
    async fn upsert_match(&self, record: &MatchRecord) -> Result<(), DatabaseError>;

    /// Atomically replace every match row of `email_id` with `matches`.
    async fn replace_matches(&self, email_id: &str, matches: &[MatchRecord]) -> Result<(), DatabaseError>;

    /// Matches for one email, best rank first.
    async fn list_matches(&self, email_id: &str) -> Result<Vec<MatchRecord>, DatabaseError>;
}
