//! Single active trade bookkeeping and exit rules.
//!
//! Tracks the one Five-EMA trade allowed at a time:
//! - Entry reservation so concurrent entries cannot both reach the broker
//! - Target / stop-loss / market-close exit evaluation
//! - Trailing stop ratchet on the entry reference
//! - A claim so only one exit monitor polls the trade

use chrono::{NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::BrokerError;

/// Time of day at which open trades are closed regardless of price.
pub fn market_close() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 30, 0).unwrap_or(NaiveTime::MIN)
}

/// The open trade. Levels are in points of the reference instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveTrade {
    pub order_id: String,
    pub instrument_token: u32,
    pub trading_symbol: String,
    /// Instrument whose price the levels are expressed in (the index future)
    pub reference_token: u32,
    pub quantity: u32,
    /// Reference price at entry; ratchets forward when trailing
    pub entry_price: Decimal,
    pub target: Decimal,
    pub stop_loss: Decimal,
    pub trailing_stop: Decimal,
    pub paper_trade: bool,
    pub opened_at: NaiveDateTime,
}

/// Why a trade was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Target,
    StopLoss,
    MarketClose,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Target => f.write_str("Target achieved"),
            ExitReason::StopLoss => f.write_str("Stoploss triggered"),
            ExitReason::MarketClose => f.write_str("Market closure"),
        }
    }
}

/// What the exit monitor should do after one price observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    Exit(ExitReason),
    /// Move the entry reference forward by the trailing step
    Trail,
    Hold,
}

impl ActiveTrade {
    pub fn evaluate(&self, ltp: Decimal, time: NaiveTime) -> MonitorAction {
        if ltp > self.target {
            MonitorAction::Exit(ExitReason::Target)
        } else if ltp <= self.entry_price - self.stop_loss {
            MonitorAction::Exit(ExitReason::StopLoss)
        } else if time >= market_close() {
            MonitorAction::Exit(ExitReason::MarketClose)
        } else if ltp > self.entry_price + self.trailing_stop {
            MonitorAction::Trail
        } else {
            MonitorAction::Hold
        }
    }
}

/// Row shown on the control panel positions view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionView {
    #[serde(rename = "STRATEGY")]
    pub strategy: String,
    #[serde(rename = "DATE TIME")]
    pub date_time: String,
    #[serde(rename = "ORDER_ID")]
    pub order_id: String,
    #[serde(rename = "TRADING SYMBOL")]
    pub trading_symbol: String,
    #[serde(rename = "BANKNIFTY FUT LTP")]
    pub future_ltp: Option<Decimal>,
    #[serde(rename = "QUANTITY")]
    pub quantity: u32,
    #[serde(rename = "ENTRY PRICE")]
    pub entry_price: Decimal,
    #[serde(rename = "STATUS")]
    pub status: String,
}

/// Holds at most one [`ActiveTrade`].
#[derive(Debug, Default)]
pub struct PositionTracker {
    active: Mutex<Option<ActiveTrade>>,
    entering: AtomicBool,
    monitoring: AtomicBool,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn active(&self) -> Option<ActiveTrade> {
        self.active.lock().await.clone()
    }

    pub async fn has_position(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Reserve the single trade slot before talking to the broker.
    ///
    /// Fails with [`BrokerError::PositionOpen`] while a trade is open or
    /// another entry is in flight. Dropping the reservation without
    /// committing releases the slot.
    pub async fn begin_entry(&self) -> Result<EntryReservation<'_>, BrokerError> {
        let active = self.active.lock().await;
        if let Some(trade) = active.as_ref() {
            return Err(BrokerError::PositionOpen(trade.order_id.clone()));
        }
        if self
            .entering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BrokerError::PositionOpen("entry in progress".into()));
        }
        Ok(EntryReservation { tracker: self })
    }

    /// Remove the trade after its exit was placed.
    pub async fn clear(&self) -> Option<ActiveTrade> {
        let closed = self.active.lock().await.take();
        if let Some(trade) = &closed {
            info!(order_id = %trade.order_id, "Active trade cleared");
        }
        closed
    }

    /// Advance the entry reference by one trailing step. Returns the new
    /// reference, or `None` if no trade is open.
    pub async fn trail(&self) -> Option<Decimal> {
        let mut active = self.active.lock().await;
        let trade = active.as_mut()?;
        trade.entry_price += trade.trailing_stop;
        Some(trade.entry_price)
    }

    /// Claim the exit monitor role; `None` if a monitor is already running.
    pub fn claim_monitor(self: &Arc<Self>) -> Option<MonitorClaim> {
        self.monitoring
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| MonitorClaim {
                tracker: Arc::clone(self),
            })
    }
}

/// Pending entry; see [`PositionTracker::begin_entry`].
pub struct EntryReservation<'a> {
    tracker: &'a PositionTracker,
}

impl EntryReservation<'_> {
    /// Record the filled trade.
    pub async fn commit(self, trade: ActiveTrade) {
        debug!(order_id = %trade.order_id, "Active trade recorded");
        *self.tracker.active.lock().await = Some(trade);
    }
}

impl Drop for EntryReservation<'_> {
    fn drop(&mut self) {
        self.tracker.entering.store(false, Ordering::SeqCst);
    }
}

/// Held by the running exit monitor; released on drop.
pub struct MonitorClaim {
    tracker: Arc<PositionTracker>,
}

impl Drop for MonitorClaim {
    fn drop(&mut self) {
        self.tracker.monitoring.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade() -> ActiveTrade {
        ActiveTrade {
            order_id: "PAPER_TRADE".into(),
            instrument_token: 201,
            trading_symbol: "BANKNIFTY24MAR47000PE".into(),
            reference_token: 100,
            quantity: 25,
            entry_price: dec!(47000),
            target: dec!(47090),
            stop_loss: dec!(30),
            trailing_stop: dec!(20),
            paper_trade: true,
            opened_at: chrono::NaiveDate::from_ymd_opt(2024, 3, 4)
                .unwrap()
                .and_hms_opt(10, 5, 0)
                .unwrap(),
        }
    }

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_exit_rules() {
        let t = trade();
        assert_eq!(t.evaluate(dec!(47091), at(11, 0)), MonitorAction::Exit(ExitReason::Target));
        assert_eq!(t.evaluate(dec!(46970), at(11, 0)), MonitorAction::Exit(ExitReason::StopLoss));
        assert_eq!(t.evaluate(dec!(47000), at(15, 30)), MonitorAction::Exit(ExitReason::MarketClose));
        assert_eq!(t.evaluate(dec!(47021), at(11, 0)), MonitorAction::Trail);
        assert_eq!(t.evaluate(dec!(47020), at(11, 0)), MonitorAction::Hold);
        assert_eq!(t.evaluate(dec!(47090), at(11, 0)), MonitorAction::Trail);
    }

    #[tokio::test]
    async fn test_only_one_trade_at_a_time() {
        let tracker = PositionTracker::new();

        let first = tracker.begin_entry().await.unwrap();
        assert!(matches!(
            tracker.begin_entry().await,
            Err(BrokerError::PositionOpen(_))
        ));
        first.commit(trade()).await;

        let err = tracker.begin_entry().await.err().unwrap();
        assert_eq!(err, BrokerError::PositionOpen("PAPER_TRADE".into()));
        assert!(!err.is_fatal());

        tracker.clear().await;
        assert!(tracker.begin_entry().await.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_reservation_frees_slot() {
        let tracker = PositionTracker::new();
        drop(tracker.begin_entry().await.unwrap());
        assert!(tracker.begin_entry().await.is_ok());
        assert!(!tracker.has_position().await);
    }

    #[tokio::test]
    async fn test_trailing_never_retreats() {
        let tracker = PositionTracker::new();
        tracker.begin_entry().await.unwrap().commit(trade()).await;

        let mut last = dec!(47000);
        let prices = [dec!(47025), dec!(47010), dec!(47050), dec!(46995), dec!(47075)];
        for ltp in prices {
            let current = tracker.active().await.unwrap();
            if current.evaluate(ltp, at(12, 0)) == MonitorAction::Trail {
                tracker.trail().await;
            }
            let entry = tracker.active().await.unwrap().entry_price;
            assert!(entry >= last);
            last = entry;
        }
        assert_eq!(last, dec!(47060));
    }

    #[test]
    fn test_single_monitor_claim() {
        let tracker = Arc::new(PositionTracker::new());
        let claim = tracker.claim_monitor().unwrap();
        assert!(tracker.claim_monitor().is_none());
        drop(claim);
        assert!(tracker.claim_monitor().is_some());
    }
}
