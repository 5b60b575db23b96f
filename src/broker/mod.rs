//! Zerodha Kite Connect integration.
//!
//! Provides:
//! - REST client for login, orders, order history, candles and the instrument master
//! - Ticker WebSocket for last-traded prices
//! - TOTP generation for the two-factor login step

mod client;
mod ticker;
pub mod totp;
mod traits;
mod types;

pub use client::{session_checksum, KiteClient};
pub use ticker::{parse_binary, KiteTicker, StreamEvent, TickerCommand, TickerHandle};
pub use traits::BrokerClient;
#[cfg(test)]
pub use traits::MockBrokerClient;
pub use types::*;
