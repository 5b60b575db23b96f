//! Price indicators.

use rust_decimal::Decimal;

/// Exponential moving average of `closes`, latest value.
///
/// The window shrinks to the number of closes available. The average is
/// seeded with the simple mean of the first `length` closes and smoothed with
/// `alpha = 2 / (length + 1)` from there on. Returns `None` for no data.
pub fn ema(closes: &[Decimal], period: usize) -> Option<Decimal> {
    let length = period.min(closes.len());
    if length == 0 {
        return None;
    }

    let alpha = Decimal::TWO / Decimal::from(length + 1);
    let seed: Decimal = closes[..length].iter().sum::<Decimal>() / Decimal::from(length);

    Some(
        closes[length..]
            .iter()
            .fold(seed, |prev, close| alpha * close + (Decimal::ONE - alpha) * prev),
    )
}
