//! Trading strategies.
//!
//! - `five_ema`: trend follow on 5-minute future candles, buys ATM puts
//! - `straddle`: sells the ATM call and put at 09:17 and covers both together
//! - `indicators` / `strike`: shared price helpers

mod five_ema;
mod indicators;
mod straddle;
mod strike;

pub use five_ema::{EntrySignal, Region, TrendFollowController, TrendFollowStrategy, TrendState};
pub use indicators::ema;
pub use straddle::{CloseReason, LegPair, StraddleBook, StraddleLeg, StraddleStrategy};
pub use strike::{atm_option_symbol, round_to_strike, OptionKind};
