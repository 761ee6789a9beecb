//! Supplier matching.
//!
//! A `MatchStrategy` scores one extraction against one supplier, returning a
//! confidence in `[0, 1]`. The strategy is chosen once from configuration and
//! shared as a trait object; `rank_suppliers` applies the threshold, ordering
//! and top-K cut that every strategy shares.

pub mod exact;
pub mod fuzzy;
pub mod semantic;

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::extract::Extraction;
use crate::store::SupplierRecord;

pub use exact::ExactMatch;
pub use fuzzy::FuzzyMatch;
pub use semantic::SemanticMatch;

/// Which scoring strategy the matching handler uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Exact,
    #[default]
    Fuzzy,
    Semantic,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Fuzzy => "fuzzy",
            Self::Semantic => "semantic",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "exact" | "exactmatch" => Ok(Self::Exact),
            "fuzzy" | "fuzzymatch" => Ok(Self::Fuzzy),
            "semantic" | "semanticmatch" => Ok(Self::Semantic),
            other => Err(format!(
                "unknown match strategy '{other}' (expected exact, fuzzy or semantic)"
            )),
        }
    }
}

/// Scores how well a supplier fits a request.
pub trait MatchStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Confidence in `[0, 1]`.
    fn score(&self, extraction: &Extraction, supplier: &SupplierRecord) -> f64;
}

/// Build the configured strategy.
pub fn build_strategy(kind: StrategyKind) -> Arc<dyn MatchStrategy> {
    match kind {
        StrategyKind::Exact => Arc::new(ExactMatch),
        StrategyKind::Fuzzy => Arc::new(FuzzyMatch),
        StrategyKind::Semantic => Arc::new(SemanticMatch::new()),
    }
}

/// A supplier that cleared the confidence threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSupplier {
    pub supplier_id: String,
    pub supplier_name: String,
    pub confidence: f64,
}

/// Score every active supplier and keep the best `top_k` at or above
/// `min_confidence`, ordered by confidence then supplier id.
pub fn rank_suppliers(
    strategy: &dyn MatchStrategy,
    extraction: &Extraction,
    suppliers: &[SupplierRecord],
    min_confidence: f64,
    top_k: usize,
) -> Vec<ScoredSupplier> {
    let mut scored: Vec<ScoredSupplier> = suppliers
        .iter()
        .filter(|s| s.active)
        .filter_map(|supplier| {
            let confidence = clamp_confidence(strategy.score(extraction, supplier));
            (confidence >= min_confidence && confidence > 0.0).then(|| ScoredSupplier {
                supplier_id: supplier.supplier_id.clone(),
                supplier_name: supplier.name.clone(),
                confidence,
            })
        })
        .collect();

    scored.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.supplier_id.cmp(&b.supplier_id))
    });
    scored.truncate(top_k);
    scored
}

fn clamp_confidence(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Lowercase, replace punctuation with spaces and collapse whitespace.
pub(crate) fn normalize_term(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Categories and item descriptions, normalized and de-duplicated.
pub(crate) fn requested_terms(extraction: &Extraction) -> Vec<String> {
    let raw = extraction
        .categories
        .iter()
        .map(String::as_str)
        .chain(extraction.items.iter().map(|i| i.description.as_str()));
    dedup_terms(raw)
}

/// Categories and products, normalized and de-duplicated.
pub(crate) fn supplier_terms(supplier: &SupplierRecord) -> Vec<String> {
    let raw = supplier
        .categories
        .iter()
        .chain(supplier.products.iter())
        .map(String::as_str);
    dedup_terms(raw)
}

fn dedup_terms<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for term in raw.map(normalize_term) {
        if !term.is_empty() && !out.contains(&term) {
            out.push(term);
        }
    }
    out
}
