//! Bag-of-words cosine similarity.
//!
//! The request text (summary, categories and item descriptions) and the
//! supplier profile (categories, products and description) are tokenized,
//! stripped of stop-words, lightly stemmed and compared as term-frequency
//! vectors.

use std::collections::{HashMap, HashSet};

use super::{MatchStrategy, StrategyKind};
use crate::extract::Extraction;
use crate::store::SupplierRecord;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "in", "is",
    "it", "of", "on", "or", "our", "that", "the", "their", "this", "to", "we", "with", "you",
    "your", "all", "any", "can", "per", "please", "need", "needed", "quote", "request", "rfq",
    "supply", "supplier", "pcs", "each", "unit", "units",
];

pub struct SemanticMatch {
    stop_words: HashSet<&'static str>,
}

impl SemanticMatch {
    pub fn new() -> Self {
        Self {
            stop_words: STOP_WORDS.iter().copied().collect(),
        }
    }

    fn vector<'a>(&self, texts: impl Iterator<Item = &'a str>) -> HashMap<String, f64> {
        let mut tf = HashMap::new();
        for text in texts {
            for token in text
                .split(|c: char| !c.is_alphanumeric())
                .map(str::to_lowercase)
                .filter(|t| t.len() > 1 && !t.chars().all(|c| c.is_ascii_digit()))
                .filter(|t| !self.stop_words.contains(t.as_str()))
            {
                *tf.entry(stem(&token)).or_insert(0.0) += 1.0;
            }
        }
        tf
    }
}

impl Default for SemanticMatch {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchStrategy for SemanticMatch {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Semantic
    }

    fn score(&self, extraction: &Extraction, supplier: &SupplierRecord) -> f64 {
        let request = self.vector(
            std::iter::once(extraction.summary.as_str())
                .chain(extraction.categories.iter().map(String::as_str))
                .chain(extraction.items.iter().map(|i| i.description.as_str())),
        );
        let profile = self.vector(
            supplier
                .categories
                .iter()
                .chain(supplier.products.iter())
                .map(String::as_str)
                .chain(std::iter::once(supplier.description.as_str())),
        );
        cosine(&request, &profile)
    }
}

/// Strips at most one plural or verb suffix.
fn stem(token: &str) -> String {
    if let Some(base) = token.strip_suffix("ies").filter(|b| b.len() >= 2) {
        return format!("{base}y");
    }
    for suffix in ["sses", "shes", "ches", "xes"] {
        if token.len() > suffix.len() + 1 && token.ends_with(suffix) {
            return token[..token.len() - 2].to_string();
        }
    }
    if let Some(base) = token.strip_suffix("ing").filter(|b| b.len() >= 3) {
        return base.to_string();
    }
    if let Some(base) = token.strip_suffix("ed").filter(|b| b.len() >= 3) {
        return base.to_string();
    }
    if !token.ends_with("ss")
        && let Some(base) = token.strip_suffix('s').filter(|b| b.len() >= 3)
    {
        return base.to_string();
    }
    token.to_string()
}

fn cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let dot: f64 = a
        .iter()
        .filter_map(|(term, x)| b.get(term).map(|y| x * y))
        .sum();
    let norm_a = a.values().map(|v| v * v).sum::<f64>().sqrt();
    let norm_b = b.values().map(|v| v * v).sum::<f64>().sqrt();
    if norm_a > 0.0 && norm_b > 0.0 {
        dot / (norm_a * norm_b)
    } else {
        0.0
    }
}
