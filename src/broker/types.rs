//! Type definitions for Kite Connect requests and responses.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Buy,
    Sell,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Buy => "BUY",
            TransactionType::Sell => "SELL",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order lifecycle status as reported by the order history endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OrderStatus {
    Complete,
    Cancelled,
    Rejected,
    /// Any intermediate state (OPEN, TRIGGER PENDING, VALIDATION PENDING, ...)
    Pending(String),
}

impl OrderStatus {
    /// Whether the order will not change any more.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending(_))
    }
}

impl From<String> for OrderStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "COMPLETE" => OrderStatus::Complete,
            "CANCELLED" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            _ => OrderStatus::Pending(s),
        }
    }
}

impl From<OrderStatus> for String {
    fn from(status: OrderStatus) -> Self {
        status.to_string()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Complete => f.write_str("COMPLETE"),
            OrderStatus::Cancelled => f.write_str("CANCELLED"),
            OrderStatus::Rejected => f.write_str("REJECTED"),
            OrderStatus::Pending(s) => f.write_str(s),
        }
    }
}

/// Intraday market order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub exchange: String,
    pub tradingsymbol: String,
    pub transaction_type: TransactionType,
    pub quantity: u32,
}

impl OrderRequest {
    /// Form fields for `POST /orders/regular` (MIS product, MARKET, DAY validity).
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("tradingsymbol", self.tradingsymbol.clone()),
            ("exchange", self.exchange.clone()),
            ("transaction_type", self.transaction_type.to_string()),
            ("order_type", "MARKET".to_string()),
            ("quantity", self.quantity.to_string()),
            ("product", "MIS".to_string()),
            ("validity", "DAY".to_string()),
        ]
    }
}

/// One entry of an order's status history.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrderEvent {
    pub order_id: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub average_price: Option<Decimal>,
    #[serde(default)]
    pub filled_quantity: Option<u32>,
}

/// OHLC candle.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub timestamp: NaiveDateTime,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

/// Candle interval for the historical endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleInterval {
    Minute,
    FiveMinute,
    FifteenMinute,
    Day,
}

impl CandleInterval {
    pub fn as_path(&self) -> &'static str {
        match self {
            CandleInterval::Minute => "minute",
            CandleInterval::FiveMinute => "5minute",
            CandleInterval::FifteenMinute => "15minute",
            CandleInterval::Day => "day",
        }
    }
}

/// Last traded price for one instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub instrument_token: u32,
    pub last_price: Decimal,
}

/// Standard Kite REST envelope.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub data: Option<T>,
    pub message: Option<String>,
    pub error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OrderIdData {
    pub order_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionData {
    pub access_token: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Historical payload: rows of `[timestamp, open, high, low, close, volume, (oi)]`.
#[derive(Debug, Deserialize)]
pub struct HistoricalData {
    pub candles: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
pub struct LoginData {
    pub request_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
}
