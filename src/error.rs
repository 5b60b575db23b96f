//! Error taxonomy for broker interaction.

use thiserror::Error;

/// Failures raised while talking to the broker or managing positions.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    /// Login, two-factor or session token exchange failed.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Instrument master could not be fetched or a symbol is unknown.
    #[error("instrument lookup failed: {0}")]
    InstrumentLookup(String),
    /// Order could not be placed or its status could not be read.
    #[error("order placement failed: {0}")]
    OrderPlacement(String),
    /// Ticker stream could not be opened or died.
    #[error("stream error: {0}")]
    Stream(String),
    /// Historical data or another read endpoint failed.
    #[error("data fetch failed: {0}")]
    DataFetch(String),
    /// An entry was requested while a trade is still active.
    #[error("a position is already open (order {0})")]
    PositionOpen(String),
    /// A retried operation never succeeded.
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        last_error: String,
    },
}

impl BrokerError {
    /// Whether the process must stop instead of carrying on with stale state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::RetriesExhausted { .. } | BrokerError::Auth(_) | BrokerError::Stream(_)
        )
    }
}
