//! Per-token pricing for known models (USD).

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// (input, output) cost per token. Unknown models cost zero.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    let m = model.to_lowercase();
    if m.contains("opus") {
        (dec!(0.000015), dec!(0.000075))
    } else if m.contains("sonnet") {
        (dec!(0.000003), dec!(0.000015))
    } else if m.contains("haiku") {
        (dec!(0.0000008), dec!(0.000004))
    } else if m.starts_with("gpt-4o-mini") {
        (dec!(0.00000015), dec!(0.0000006))
    } else if m.starts_with("gpt-4o") {
        (dec!(0.0000025), dec!(0.00001))
    } else {
        (Decimal::ZERO, Decimal::ZERO)
    }
}
