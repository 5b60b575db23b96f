//! Strike selection and option symbols.

use rust_decimal::{Decimal, RoundingStrategy};
use std::fmt;

const STRIKE_STEP: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Call,
    Put,
}

impl OptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionKind::Call => "CE",
            OptionKind::Put => "PE",
        }
    }
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nearest strike on the 100-point grid; exact midpoints round up.
pub fn round_to_strike(price: Decimal) -> Decimal {
    let step = Decimal::from(STRIKE_STEP);
    (price / step).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero) * step
}

/// At-the-money option symbol for `price`, built from the monthly future
/// symbol: `BANKNIFTY24MARFUT` at 47049 gives `BANKNIFTY24MAR47000PE`.
pub fn atm_option_symbol(future_symbol: &str, price: Decimal, kind: OptionKind) -> String {
    let series = future_symbol.strip_suffix("FUT").unwrap_or(future_symbol);
    let strike = round_to_strike(price).trunc();
    format!("{}{}{}", series, strike, kind)
}
