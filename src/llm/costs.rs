//! Per-token pricing for the models the extractor is run with.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// (input, output) price per token in USD. Unknown models are priced as Sonnet.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    if model.contains("haiku") {
        (dec!(0.0000008), dec!(0.000004))
    } else if model.contains("opus") {
        (dec!(0.000015), dec!(0.000075))
    } else {
        (dec!(0.000003), dec!(0.000015))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pricing_depends_on_model() {
        assert!(model_cost("claude-3-5-haiku-latest").0 < model_cost("claude-sonnet-4").0);
        assert!(model_cost("claude-opus-4").1 > model_cost("claude-sonnet-4").1);
    }
}
