//! Structured extraction from decoded emails.
//!
//! An `Extractor` turns an `EmailDocument` into an `Extraction`: what is being
//! requested, by whom, in what quantities and by when. Two implementations
//! exist: `LlmExtractor` (generative) and `KeywordExtractor` (deterministic).

pub mod email;
pub mod keyword;
pub mod llm;

pub use email::EmailDocument;
pub use keyword::KeywordExtractor;
pub use llm::LlmExtractor;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ExtractError;

/// One requested item.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Structured view of a request-for-quote email.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Extraction {
    pub summary: String,
    pub requester_name: Option<String>,
    pub requester_company: Option<String>,
    /// Product categories, lowercase.
    pub categories: Vec<String>,
    pub items: Vec<LineItem>,
    pub delivery_location: Option<String>,
    /// Requested delivery date as written in the email.
    pub needed_by: Option<String>,
    /// Which extractor produced this.
    pub extractor: String,
}

impl Extraction {
    /// Whether anything usable for matching was found.
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty() && self.items.is_empty()
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Short name recorded on each extraction.
    fn name(&self) -> String;

    async fn extract(&self, email: &EmailDocument) -> Result<Extraction, ExtractError>;
}

/// Lowercase, trim and de-duplicate category names, keeping first-seen order.
pub(crate) fn normalize_categories<I, S>(categories: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for category in categories {
        let category = category.as_ref().trim().to_lowercase();
        if !category.is_empty() && !out.contains(&category) {
            out.push(category);
        }
    }
    out
}
