//! libSQL backend: async `ResultStore` implementation.
//!
//! Supports local file and in-memory databases. All SQL is rendered once at
//! construction against the configured table names.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::TableNames;
use crate::error::DatabaseError;
use crate::extract::Extraction;
use crate::store::migrations::{self, render};
use crate::store::models::{EmailStatus, MatchRecord, ParsedEmailRecord, SupplierRecord};
use crate::store::traits::ResultStore;

const EMAIL_COLUMNS: &str = "email_id, bucket, object_key, status, sender, subject, received_at, extraction, failure_reason, match_count, created_at, updated_at";

const SUPPLIER_COLUMNS: &str =
    "supplier_id, name, contact_email, categories, products, description, region, active";

const MATCH_COLUMNS: &str =
    "email_id, supplier_id, supplier_name, confidence, rank, strategy, matched_at";

/// SQL statements rendered for one set of table names.
struct Statements {
    upsert_email: String,
    get_email: String,
    list_emails: String,
    mark_matched: String,
    upsert_supplier: String,
    get_supplier: String,
    list_suppliers: String,
    upsert_match: String,
    delete_matches: String,
    list_matches: String,
}

impl Statements {
    fn new(tables: &TableNames) -> Self {
        let sql = |template: String| render(&template, tables);
        Self {
            // A re-parse keeps MATCHED status and the match count.
            upsert_email: sql(format!(
                "INSERT INTO {{parsed_emails}} ({EMAIL_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT (email_id) DO UPDATE SET
                    bucket = excluded.bucket,
                    object_key = excluded.object_key,
                    status = CASE
                        WHEN {{parsed_emails}}.status = 'MATCHED' AND excluded.status = 'PARSED'
                        THEN {{parsed_emails}}.status
                        ELSE excluded.status
                    END,
                    sender = excluded.sender,
                    subject = excluded.subject,
                    received_at = excluded.received_at,
                    extraction = excluded.extraction,
                    failure_reason = excluded.failure_reason,
                    match_count = CASE
                        WHEN excluded.status = 'FAILED' THEN NULL
                        ELSE COALESCE(excluded.match_count, {{parsed_emails}}.match_count)
                    END,
                    updated_at = excluded.updated_at"
            )),
            get_email: sql(format!(
                "SELECT {EMAIL_COLUMNS} FROM {{parsed_emails}} WHERE email_id = ?1"
            )),
            list_emails: sql(format!(
                "SELECT {EMAIL_COLUMNS} FROM {{parsed_emails}}
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY updated_at DESC, email_id
                 LIMIT ?2"
            )),
            mark_matched: sql(
                "UPDATE {parsed_emails}
                 SET status = 'MATCHED', match_count = ?2, updated_at = ?3
                 WHERE email_id = ?1"
                    .to_string(),
            ),
            upsert_supplier: sql(format!(
                "INSERT INTO {{suppliers}} ({SUPPLIER_COLUMNS}, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (supplier_id) DO UPDATE SET
                    name = excluded.name,
                    contact_email = excluded.contact_email,
                    categories = excluded.categories,
                    products = excluded.products,
                    description = excluded.description,
                    region = excluded.region,
                    active = excluded.active,
                    updated_at = excluded.updated_at"
            )),
            get_supplier: sql(format!(
                "SELECT {SUPPLIER_COLUMNS} FROM {{suppliers}} WHERE supplier_id = ?1"
            )),
            list_suppliers: sql(format!(
                "SELECT {SUPPLIER_COLUMNS} FROM {{suppliers}}
                 WHERE (?1 = 0 OR active = 1)
                 ORDER BY supplier_id"
            )),
            upsert_match: sql(format!(
                "INSERT INTO {{match_history}} ({MATCH_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (email_id, supplier_id) DO UPDATE SET
                    supplier_name = excluded.supplier_name,
                    confidence = excluded.confidence,
                    rank = excluded.rank,
                    strategy = excluded.strategy,
                    matched_at = excluded.matched_at"
            )),
            delete_matches: sql("DELETE FROM {match_history} WHERE email_id = ?1".to_string()),
            list_matches: sql(format!(
                "SELECT {MATCH_COLUMNS} FROM {{match_history}}
                 WHERE email_id = ?1
                 ORDER BY rank, supplier_id"
            )),
        }
    }
}

/// libSQL result store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
/// Writes hold `writes` so no statement lands inside another caller's
/// transaction on the shared connection.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    writes: Mutex<()>,
    tables: TableNames,
    sql: Statements,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path, tables: TableNames) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db, tables)?;
        store.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory(tables: TableNames) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let store = Self::from_database(db, tables)?;
        store.init_schema().await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase, tables: TableNames) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        let sql = Statements::new(&tables);
        Ok(Self {
            db: Arc::new(db),
            conn,
            writes: Mutex::new(()),
            tables,
            sql,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

fn column<T>(name: &str, value: libsql::Result<T>) -> Result<T, DatabaseError> {
    value.map_err(|e| DatabaseError::Query(format!("column {name}: {e}")))
}

/// Map a libsql Row to a ParsedEmailRecord. Column order matches EMAIL_COLUMNS.
fn row_to_email(row: &libsql::Row) -> Result<ParsedEmailRecord, DatabaseError> {
    let status_str: String = column("status", row.get(3))?;
    let status = status_str
        .parse::<EmailStatus>()
        .map_err(|e| DatabaseError::Serialization(format!("status: {e}")))?;
    let received_str: Option<String> = column("received_at", row.get(6))?;
    let extraction_str: Option<String> = column("extraction", row.get(7))?;
    let match_count: Option<i64> = column("match_count", row.get(9))?;
    let created_str: String = column("created_at", row.get(10))?;
    let updated_str: String = column("updated_at", row.get(11))?;

    let extraction = extraction_str
        .map(|raw| from_json::<Extraction>("extraction", &raw))
        .transpose()?;
    let match_count = match_count
        .map(|n| {
            u32::try_from(n).map_err(|_| DatabaseError::Serialization(format!("match_count: {n} out of range")))
        })
        .transpose()?;

    Ok(ParsedEmailRecord {
        email_id: column("email_id", row.get(0))?,
        bucket: column("bucket", row.get(1))?,
        object_key: column("object_key", row.get(2))?,
        status,
        sender: column("sender", row.get(4))?,
        subject: column("subject", row.get(5))?,
        received_at: parse_optional_datetime(&received_str),
        extraction,
        failure_reason: column("failure_reason", row.get(8))?,
        match_count,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a SupplierRecord. Column order matches SUPPLIER_COLUMNS.
fn row_to_supplier(row: &libsql::Row) -> Result<SupplierRecord, DatabaseError> {
    let categories: String = column("categories", row.get(3))?;
    let products: String = column("products", row.get(4))?;
    let active: i64 = column("active", row.get(7))?;
    Ok(SupplierRecord {
        supplier_id: column("supplier_id", row.get(0))?,
        name: column("name", row.get(1))?,
        contact_email: column("contact_email", row.get(2))?,
        categories: from_json("categories", &categories)?,
        products: from_json("products", &products)?,
        description: column("description", row.get(5))?,
        region: column("region", row.get(6))?,
        active: active != 0,
    })
}

/// Map a libsql Row to a MatchRecord. Column order matches MATCH_COLUMNS.
fn row_to_match(row: &libsql::Row) -> Result<MatchRecord, DatabaseError> {
    let rank: i64 = column("rank", row.get(4))?;
    let matched_str: String = column("matched_at", row.get(6))?;
    Ok(MatchRecord {
        email_id: column("email_id", row.get(0))?,
        supplier_id: column("supplier_id", row.get(1))?,
        supplier_name: column("supplier_name", row.get(2))?,
        confidence: column("confidence", row.get(3))?,
        rank: u32::try_from(rank).map_err(|_| DatabaseError::Serialization(format!("rank: {rank} out of range")))?,
        strategy: column("strategy", row.get(5))?,
        matched_at: parse_datetime(&matched_str),
    })
}

/// Advance a result set, surfacing fetch errors.
async fn next_row(rows: &mut libsql::Rows, op: &str) -> Result<Option<libsql::Row>, DatabaseError> {
    rows.next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))
}

fn match_params(record: &MatchRecord) -> Vec<libsql::Value> {
    vec![
        libsql::Value::Text(record.email_id.clone()),
        libsql::Value::Text(record.supplier_id.clone()),
        libsql::Value::Text(record.supplier_name.clone()),
        libsql::Value::Real(record.confidence),
        libsql::Value::Integer(i64::from(record.rank)),
        libsql::Value::Text(record.strategy.clone()),
        libsql::Value::Text(record.matched_at.to_rfc3339()),
    ]
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl ResultStore for LibSqlStore {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn(), &self.tables).await
    }

    // ── Parsed emails ───────────────────────────────────────────────

    async fn upsert_parsed_email(&self, record: &ParsedEmailRecord) -> Result<(), DatabaseError> {
        let extraction = record.extraction.as_ref().map(to_json).transpose()?;
        let _write = self.writes.lock().await;
        self.conn()
            .execute(
                &self.sql.upsert_email,
                params![
                    record.email_id.as_str(),
                    record.bucket.as_str(),
                    record.object_key.as_str(),
                    record.status.as_str(),
                    opt_text(record.sender.as_deref()),
                    opt_text(record.subject.as_deref()),
                    opt_text_owned(record.received_at.map(|t| t.to_rfc3339())),
                    opt_text_owned(extraction),
                    opt_text(record.failure_reason.as_deref()),
                    match record.match_count {
                        Some(n) => libsql::Value::Integer(i64::from(n)),
                        None => libsql::Value::Null,
                    },
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_parsed_email: {e}")))?;

        debug!(email_id = %record.email_id, status = %record.status, "Parsed email upserted");
        Ok(())
    }

    async fn get_parsed_email(
        &self,
        email_id: &str,
    ) -> Result<Option<ParsedEmailRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(&self.sql.get_email, params![email_id])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_parsed_email: {e}")))?;

        next_row(&mut rows, "get_parsed_email")
            .await?
            .map(|row| row_to_email(&row))
            .transpose()
    }

    async fn list_parsed_emails(
        &self,
        status: Option<EmailStatus>,
        limit: usize,
    ) -> Result<Vec<ParsedEmailRecord>, DatabaseError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = self
            .conn()
            .query(
                &self.sql.list_emails,
                params![opt_text(status.as_ref().map(EmailStatus::as_str)), limit],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_parsed_emails: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_parsed_emails").await? {
            records.push(row_to_email(&row)?);
        }
        Ok(records)
    }

    async fn mark_matched(&self, email_id: &str, match_count: u32) -> Result<bool, DatabaseError> {
        let _write = self.writes.lock().await;
        let updated = self
            .conn()
            .execute(
                &self.sql.mark_matched,
                params![email_id, i64::from(match_count), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_matched: {e}")))?;
        Ok(updated > 0)
    }

    // ── Suppliers ───────────────────────────────────────────────────

    async fn upsert_supplier(&self, supplier: &SupplierRecord) -> Result<(), DatabaseError> {
        let _write = self.writes.lock().await;
        self.conn()
            .execute(
                &self.sql.upsert_supplier,
                params![
                    supplier.supplier_id.as_str(),
                    supplier.name.as_str(),
                    opt_text(supplier.contact_email.as_deref()),
                    to_json(&supplier.categories)?,
                    to_json(&supplier.products)?,
                    supplier.description.as_str(),
                    opt_text(supplier.region.as_deref()),
                    i64::from(supplier.active),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_supplier: {e}")))?;
        Ok(())
    }

    async fn get_supplier(&self, supplier_id: &str) -> Result<Option<SupplierRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(&self.sql.get_supplier, params![supplier_id])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_supplier: {e}")))?;

        next_row(&mut rows, "get_supplier")
            .await?
            .map(|row| row_to_supplier(&row))
            .transpose()
    }

    async fn list_suppliers(&self, active_only: bool) -> Result<Vec<SupplierRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(&self.sql.list_suppliers, params![i64::from(active_only)])
            .await
            .map_err(|e| DatabaseError::Query(format!("list_suppliers: {e}")))?;

        let mut suppliers = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_suppliers").await? {
            suppliers.push(row_to_supplier(&row)?);
        }
        Ok(suppliers)
    }

    // ── Match history ───────────────────────────────────────────────

    async fn upsert_match(&self, record: &MatchRecord) -> Result<(), DatabaseError> {
        let _write = self.writes.lock().await;
        self.conn()
            .execute(&self.sql.upsert_match, match_params(record))
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_match: {e}")))?;
        Ok(())
    }

    async fn replace_matches(&self, email_id: &str, matches: &[MatchRecord]) -> Result<(), DatabaseError> {
        if let Some(stray) = matches.iter().find(|m| m.email_id != email_id) {
            return Err(DatabaseError::Query(format!(
                "replace_matches: match for {} in the set of {email_id}",
                stray.email_id
            )));
        }
        let query = |e: libsql::Error| DatabaseError::Query(format!("replace_matches: {e}"));

        let _write = self.writes.lock().await;
        // Dropped without commit, the transaction rolls back.
        let tx = self.conn().transaction().await.map_err(query)?;
        tx.execute(&self.sql.delete_matches, params![email_id])
            .await
            .map_err(query)?;
        for record in matches {
            tx.execute(&self.sql.upsert_match, match_params(record))
                .await
                .map_err(query)?;
        }
        tx.commit().await.map_err(query)?;

        debug!(%email_id, count = matches.len(), "Match set replaced");
        Ok(())
    }

    async fn list_matches(&self, email_id: &str) -> Result<Vec<MatchRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(&self.sql.list_matches, params![email_id])
            .await
            .map_err(|e| DatabaseError::Query(format!("list_matches: {e}")))?;

        let mut matches = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_matches").await? {
            matches.push(row_to_match(&row)?);
        }
        Ok(matches)
    }
}
