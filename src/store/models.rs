//! Records held by the result store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::extract::Extraction;

/// Lifecycle status of a parsed email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailStatus {
    Parsed,
    Matched,
    Failed,
}

impl EmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parsed => "PARSED",
            Self::Matched => "MATCHED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmailStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PARSED" => Ok(Self::Parsed),
            "MATCHED" => Ok(Self::Matched),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown email status '{other}'")),
        }
    }
}

/// One row per email id, upserted by the parsing handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedEmailRecord {
    pub email_id: String,
    pub bucket: String,
    pub object_key: String,
    pub status: EmailStatus,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub extraction: Option<Extraction>,
    pub failure_reason: Option<String>,
    /// Set once matching has finished.
    pub match_count: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ParsedEmailRecord {
    /// A successfully parsed email.
    pub fn parsed(
        email_id: impl Into<String>,
        bucket: impl Into<String>,
        object_key: impl Into<String>,
        extraction: Extraction,
    ) -> Self {
        let now = Utc::now();
        Self {
            email_id: email_id.into(),
            bucket: bucket.into(),
            object_key: object_key.into(),
            status: EmailStatus::Parsed,
            sender: None,
            subject: None,
            received_at: None,
            extraction: Some(extraction),
            failure_reason: None,
            match_count: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// An email that could not be parsed.
    pub fn failed(
        email_id: impl Into<String>,
        bucket: impl Into<String>,
        object_key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            email_id: email_id.into(),
            bucket: bucket.into(),
            object_key: object_key.into(),
            status: EmailStatus::Failed,
            sender: None,
            subject: None,
            received_at: None,
            extraction: None,
            failure_reason: Some(reason.into()),
            match_count: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A supplier in the curated catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplierRecord {
    #[serde(alias = "id")]
    pub supplier_id: String,
    pub name: String,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub products: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// A scored supplier for one email; keyed by `(email_id, supplier_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRecord {
    pub email_id: String,
    pub supplier_id: String,
    pub supplier_name: String,
    pub confidence: f64,
    /// 1-based position in the ranked result.
    pub rank: u32,
    pub strategy: String,
    pub matched_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn status_wire_form() {
        assert_eq!(serde_json::to_value(EmailStatus::Matched).unwrap(), json!("MATCHED"));
        assert_eq!("parsed".parse::<EmailStatus>().unwrap(), EmailStatus::Parsed);
        assert!("DONE".parse::<EmailStatus>().is_err());
    }

    #[test]
    fn supplier_catalog_entry_defaults() {
        let supplier: SupplierRecord = serde_json::from_value(json!({
            "id": "sup-001",
            "name": "Acme Valves",
            "categories": ["valves"]
        }))
        .unwrap();
        assert_eq!(supplier.supplier_id, "sup-001");
        assert!(supplier.active);
        assert!(supplier.products.is_empty());
    }
}
