//! Verbatim term overlap.

use super::{MatchStrategy, StrategyKind, requested_terms, supplier_terms};
use crate::extract::Extraction;
use crate::store::SupplierRecord;

/// Share of requested terms that appear verbatim among the supplier's
/// categories and products.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatch;

impl MatchStrategy for ExactMatch {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Exact
    }

    fn score(&self, extraction: &Extraction, supplier: &SupplierRecord) -> f64 {
        let requested = requested_terms(extraction);
        if requested.is_empty() {
            return 0.0;
        }
        let offered = supplier_terms(supplier);
        let hits = requested.iter().filter(|t| offered.contains(t)).count();
        hits as f64 / requested.len() as f64
    }
}
