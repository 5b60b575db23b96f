//! # BANKNIFTY Intraday
//!
//! Intraday options bot for the BANKNIFTY index on Zerodha Kite.
//!
//! ## Architecture
//!
//! - `config`: Static settings, broker credentials and strategy parameters
//! - `broker`: Kite REST client, login flow and ticker WebSocket
//! - `session`: Daily broker session, instruments, quotes, orders and positions
//! - `strategy`: Five-EMA trend follow and the short straddle
//! - `ledger`: CSV order ledgers
//! - `control`: HTTP control panel
//! - `clock`: Injectable exchange-local clock

pub mod broker;
pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod ledger;
pub mod session;
pub mod strategy;

pub use config::Config;
pub use error::BrokerError;
