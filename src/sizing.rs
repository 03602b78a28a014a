// ===============================
// src/sizing.rs (quantity & fee derivation)
// ===============================
//
// Fees are never a configured percentage here: they are read off the balance
// movement around the order, so each venue's commission schedule shows up on
// its own.
//

/// Round `value` down to `digits` decimals. The small nudge absorbs binary
/// representation error (1.9999999999999998 -> 2.0) without rounding up any
/// value that is genuinely below the next step.
pub fn floor_to_precision(value: f64, digits: u32) -> f64 {
    if !value.is_finite() || value <= 0.0 {
        return 0.0;
    }
    let factor = 10f64.powi(digits as i32);
    ((value * factor) + 1e-9).floor() / factor
}

/// Base quantity a buy of `notional` quote can afford at `price`.
pub fn buy_quantity(notional: f64, price: f64, digits: u32) -> f64 {
    if price <= 0.0 || !price.is_finite() {
        return 0.0;
    }
    floor_to_precision(notional / price, digits)
}

/// Buy fee in quote terms: base that a zero-fee fill would have delivered
/// minus base actually received, valued at `price`.
pub fn buy_fee(notional: f64, price: f64, base_before: f64, base_after: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    let expected = notional / price;
    let received = base_after - base_before;
    (expected - received) * price
}

/// Sell fee in quote terms: what the quote balance should have become at zero
/// fee minus what it did become.
pub fn sell_fee(quote_before: f64, gross: f64, quote_after: f64) -> f64 {
    quote_before + gross - quote_after
}
