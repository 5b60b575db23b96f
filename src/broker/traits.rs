//! Broker capability consumed by the session.
//!
//! The session never talks HTTP directly; it goes through this trait so the
//! order lifecycle can be exercised against a mock in tests.

use super::types::{Candle, CandleInterval, OrderEvent, OrderRequest};
use crate::error::BrokerError;
use async_trait::async_trait;
use chrono::NaiveDate;

/// Authenticated order and market-data operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Place an order and return the broker's order id.
    async fn place_order(&self, order: &OrderRequest) -> Result<String, BrokerError>;

    /// Status history of an order, oldest first.
    async fn order_history(&self, order_id: &str) -> Result<Vec<OrderEvent>, BrokerError>;

    /// Candles for one instrument over a single trading day, oldest first.
    async fn historical_candles(
        &self,
        instrument_token: u32,
        day: NaiveDate,
        interval: CandleInterval,
    ) -> Result<Vec<Candle>, BrokerError>;
}
