//! Character-trigram similarity.

use std::collections::HashSet;

use super::{MatchStrategy, StrategyKind, requested_terms, supplier_terms};
use crate::extract::Extraction;
use crate::store::SupplierRecord;

/// Mean, over requested terms, of the best trigram Dice coefficient against
/// any supplier term.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuzzyMatch;

impl MatchStrategy for FuzzyMatch {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Fuzzy
    }

    fn score(&self, extraction: &Extraction, supplier: &SupplierRecord) -> f64 {
        let requested = requested_terms(extraction);
        let offered: Vec<HashSet<[char; 3]>> =
            supplier_terms(supplier).iter().map(|t| trigrams(t)).collect();
        if requested.is_empty() || offered.is_empty() {
            return 0.0;
        }

        let total: f64 = requested
            .iter()
            .map(|term| {
                let grams = trigrams(term);
                offered
                    .iter()
                    .map(|other| dice(&grams, other))
                    .fold(0.0, f64::max)
            })
            .sum();
        total / requested.len() as f64
    }
}

/// Trigrams of the term padded with one space on each side.
fn trigrams(term: &str) -> HashSet<[char; 3]> {
    let padded: Vec<char> = std::iter::once(' ')
        .chain(term.chars())
        .chain(std::iter::once(' '))
        .collect();
    padded.windows(3).map(|w| [w[0], w[1], w[2]]).collect()
}

fn dice(a: &HashSet<[char; 3]>, b: &HashSet<[char; 3]>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    2.0 * shared as f64 / (a.len() + b.len()) as f64
}
