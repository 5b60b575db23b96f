//! Daily short straddle on the at-the-money strike.
//!
//! Shortly after the open both ATM options are sold. The pair is then watched
//! until 14:55: either leg moving a full band in our favour (target) or
//! against us (stoploss) covers both legs; otherwise both are covered at the
//! time cutoff.

use super::strike::{atm_option_symbol, OptionKind};
use crate::broker::{OrderRequest, TransactionType};
use crate::clock::Clock;
use crate::config::StraddleConfig;
use crate::error::BrokerError;
use crate::ledger::{format_date_time, CsvLedger, StraddleOrderRecord};
use crate::session::{BrokerSession, PositionView, SessionSlot};
use chrono::{NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Polls allowed for both option quotes to arrive after subscribing.
const OPTION_QUOTE_POLLS: u32 = 10;

fn hms(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Target,
    Stoploss,
    TimeTrigger,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Target => "Target Reached",
            CloseReason::Stoploss => "Stoploss Triggered",
            CloseReason::TimeTrigger => "Time Trigger",
        };
        f.write_str(s)
    }
}

/// One sold option.
#[derive(Debug, Clone, PartialEq)]
pub struct StraddleLeg {
    pub order_id: String,
    pub trading_symbol: String,
    pub exchange: String,
    pub instrument_token: u32,
    /// Option price when sold
    pub entry_price: Decimal,
    pub quantity: u32,
    pub status: String,
    pub opened_at: NaiveDateTime,
    /// Future price when sold
    pub future_price: Decimal,
}

impl StraddleLeg {
    fn check(&self, ltp: Decimal, band: Decimal) -> Option<CloseReason> {
        if ltp <= self.entry_price - band {
            Some(CloseReason::Target)
        } else if ltp >= self.entry_price + band {
            Some(CloseReason::Stoploss)
        } else {
            None
        }
    }
}

/// Call and put slots. Filled together at entry, emptied leg by leg on close.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegPair {
    pub call: Option<StraddleLeg>,
    pub put: Option<StraddleLeg>,
}

impl LegPair {
    pub fn is_empty(&self) -> bool {
        self.call.is_none() && self.put.is_none()
    }

    /// First exit trigger across the legs, call leg first. A missing quote
    /// never triggers.
    pub fn evaluate(
        &self,
        call_ltp: Option<Decimal>,
        put_ltp: Option<Decimal>,
        band: Decimal,
    ) -> Option<CloseReason> {
        [(&self.call, call_ltp), (&self.put, put_ltp)]
            .into_iter()
            .find_map(|(leg, ltp)| match (leg, ltp) {
                (Some(leg), Some(ltp)) => leg.check(ltp, band),
                _ => None,
            })
    }

    /// Drop the leg trading `instrument_token`, if held.
    pub fn remove(&mut self, instrument_token: u32) -> Option<StraddleLeg> {
        [&mut self.call, &mut self.put]
            .into_iter()
            .find(|slot| slot.as_ref().is_some_and(|leg| leg.instrument_token == instrument_token))
            .and_then(Option::take)
    }

    pub fn legs(&self) -> impl Iterator<Item = &StraddleLeg> {
        self.call.iter().chain(self.put.iter())
    }

    pub fn tokens(&self) -> Vec<u32> {
        self.legs().map(|leg| leg.instrument_token).collect()
    }
}

/// Shared view of the open straddle, read by the control panel.
#[derive(Debug, Default)]
pub struct StraddleBook {
    legs: Mutex<LegPair>,
}

impl StraddleBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> LegPair {
        self.legs.lock().await.clone()
    }

    pub async fn positions(&self, future_ltp: Option<Decimal>) -> Vec<PositionView> {
        self.legs
            .lock()
            .await
            .legs()
            .map(|leg| PositionView {
                strategy: "SHORT STRADDLE".to_string(),
                date_time: format_date_time(leg.opened_at),
                order_id: leg.order_id.clone(),
                trading_symbol: leg.trading_symbol.clone(),
                future_ltp,
                quantity: leg.quantity,
                entry_price: leg.entry_price,
                status: leg.status.clone(),
            })
            .collect()
    }
}

pub struct StraddleStrategy {
    slot: Arc<SessionSlot>,
    clock: Arc<dyn Clock>,
    settings: StraddleConfig,
    book: Arc<StraddleBook>,
    ledger: Arc<CsvLedger>,
    running: Arc<AtomicBool>,
    poll: Duration,
}

impl StraddleStrategy {
    pub fn new(
        slot: Arc<SessionSlot>,
        clock: Arc<dyn Clock>,
        settings: StraddleConfig,
        book: Arc<StraddleBook>,
        ledger: Arc<CsvLedger>,
        running: Arc<AtomicBool>,
        poll: Duration,
    ) -> Self {
        Self {
            slot,
            clock,
            settings,
            book,
            ledger,
            running,
            poll,
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Trade every day until the running flag is cleared.
    pub async fn run(&self) -> Result<(), BrokerError> {
        info!(target: "straddle", "Short straddle strategy started");

        loop {
            info!(target: "straddle", "Waiting for market to start");
            loop {
                let time = self.clock.time();
                if time > hms(9, 16) && time < hms(15, 30) {
                    break;
                }
                if !self.is_running() {
                    return Ok(());
                }
                self.clock.sleep(self.poll).await;
            }
            info!(target: "straddle", "Market in progress");

            self.trade_day().await?;

            info!(target: "straddle", "Waiting for market to end");
            while self.clock.time() <= hms(15, 30) {
                if !self.is_running() {
                    return Ok(());
                }
                self.clock.sleep(self.poll).await;
            }
        }
    }

    /// Enter at 09:17, monitor, close. Returns why the pair was covered, or
    /// `None` if the day was skipped.
    pub async fn trade_day(&self) -> Result<Option<CloseReason>, BrokerError> {
        while self.clock.time() <= hms(9, 17) {
            if !self.is_running() {
                return Ok(None);
            }
            self.clock.sleep(self.poll).await;
        }

        if self.clock.time() > hms(9, 18) {
            warn!(target: "straddle", time = %self.clock.time(), "Entry window missed, no straddle today");
            return Ok(None);
        }

        let session = self.slot.current().await;
        if !self.enter(&session).await? {
            return Ok(None);
        }

        self.monitor(&session).await
    }

    /// Sell both ATM legs. Returns `false` if the entry was skipped.
    async fn enter(&self, session: &BrokerSession) -> Result<bool, BrokerError> {
        let Some(future_price) = session.future_quote().await else {
            warn!(target: "straddle", "No future quote at entry time, skipping today");
            return Ok(false);
        };

        let call_symbol = atm_option_symbol(session.future_symbol(), future_price, OptionKind::Call);
        let put_symbol = atm_option_symbol(session.future_symbol(), future_price, OptionKind::Put);

        let (Some((call_exchange, call_token)), Some((put_exchange, put_token))) = (
            session.resolve_symbol(&call_symbol),
            session.resolve_symbol(&put_symbol),
        ) else {
            warn!(target: "straddle", %call_symbol, %put_symbol, "ATM options not found, skipping today");
            return Ok(false);
        };
        let (call_exchange, put_exchange) = (call_exchange.to_string(), put_exchange.to_string());

        info!(target: "straddle", %future_price, %call_symbol, %put_symbol, "Straddle entry");
        session.subscribe(&[call_token, put_token]);

        let Some((call_price, put_price)) = self.wait_for_quotes(session, call_token, put_token).await
        else {
            warn!(target: "straddle", "Option quotes did not arrive, skipping today");
            session.unsubscribe(&[call_token, put_token]);
            return Ok(false);
        };

        let quantity = self.settings.quantity();
        let call = self
            .sell(session, call_symbol, call_exchange, call_token, call_price, quantity, future_price)
            .await?;
        let put = self
            .sell(session, put_symbol, put_exchange, put_token, put_price, quantity, future_price)
            .await?;

        let mut legs = self.book.legs.lock().await;
        legs.call = Some(call);
        legs.put = Some(put);
        Ok(true)
    }

    async fn wait_for_quotes(
        &self,
        session: &BrokerSession,
        call_token: u32,
        put_token: u32,
    ) -> Option<(Decimal, Decimal)> {
        for _ in 0..OPTION_QUOTE_POLLS {
            if let (Some(call), Some(put)) =
                (session.quote(call_token).await, session.quote(put_token).await)
            {
                return Some((call, put));
            }
            self.clock.sleep(self.poll).await;
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    async fn sell(
        &self,
        session: &BrokerSession,
        trading_symbol: String,
        exchange: String,
        instrument_token: u32,
        entry_price: Decimal,
        quantity: u32,
        future_price: Decimal,
    ) -> Result<StraddleLeg, BrokerError> {
        let order = OrderRequest {
            exchange: exchange.clone(),
            tradingsymbol: trading_symbol.clone(),
            transaction_type: TransactionType::Sell,
            quantity,
        };
        let order_id = session
            .gateway()
            .execute(&order, self.settings.paper_trading)
            .await?;
        let opened_at = self.clock.now();

        info!(
            target: "straddle",
            %order_id,
            order_type = "SELL",
            %trading_symbol,
            %future_price,
            %entry_price,
            quantity,
            "Straddle leg sold"
        );
        self.record(StraddleOrderRecord {
            order_id: order_id.clone(),
            date_time: format_date_time(opened_at),
            trading_symbol: trading_symbol.clone(),
            order_type: TransactionType::Sell.to_string(),
            quantity,
            future_price,
            option_price: Some(entry_price),
        });

        Ok(StraddleLeg {
            order_id,
            trading_symbol,
            exchange,
            instrument_token,
            entry_price,
            quantity,
            status: "ACTIVE".to_string(),
            opened_at,
            future_price,
        })
    }

    /// Watch both legs until a trigger or the 14:55 cutoff.
    async fn monitor(&self, session: &BrokerSession) -> Result<Option<CloseReason>, BrokerError> {
        let band = self.settings.band();

        while self.clock.time() <= hms(14, 55) {
            let pair = self.book.snapshot().await;
            if pair.is_empty() {
                return Ok(None);
            }

            let call_ltp = match &pair.call {
                Some(leg) => session.quote(leg.instrument_token).await,
                None => None,
            };
            let put_ltp = match &pair.put {
                Some(leg) => session.quote(leg.instrument_token).await,
                None => None,
            };

            if let Some(reason) = pair.evaluate(call_ltp, put_ltp, band) {
                self.close(session, reason).await?;
                info!(target: "straddle", "Short straddle trade completed for today");
                return Ok(Some(reason));
            }

            self.clock.sleep(self.poll).await;
        }

        self.close(session, CloseReason::TimeTrigger).await?;
        Ok(Some(CloseReason::TimeTrigger))
    }

    /// Buy back every open leg. Each leg leaves the book once its order fills.
    async fn close(&self, session: &BrokerSession, reason: CloseReason) -> Result<(), BrokerError> {
        let pair = self.book.snapshot().await;
        if pair.is_empty() {
            return Ok(());
        }

        let future_price = session.future_quote().await;

        for leg in pair.legs() {
            let order = OrderRequest {
                exchange: leg.exchange.clone(),
                tradingsymbol: leg.trading_symbol.clone(),
                transaction_type: TransactionType::Buy,
                quantity: leg.quantity,
            };
            let order_id = session
                .gateway()
                .execute(&order, self.settings.paper_trading)
                .await?;
            let ltp = session.quote(leg.instrument_token).await;

            info!(
                target: "straddle",
                %order_id,
                order_type = "BUY",
                trading_symbol = %leg.trading_symbol,
                future_price = ?future_price,
                price = ?ltp,
                quantity = leg.quantity,
                %reason,
                "Straddle leg covered"
            );

            self.record(StraddleOrderRecord {
                order_id,
                date_time: format_date_time(self.clock.now()),
                trading_symbol: leg.trading_symbol.clone(),
                order_type: TransactionType::Buy.to_string(),
                quantity: leg.quantity,
                future_price: future_price.unwrap_or(leg.future_price),
                option_price: ltp,
            });
            self.book.legs.lock().await.remove(leg.instrument_token);
        }

        session.unsubscribe(&pair.tokens());
        Ok(())
    }

    fn record(&self, row: StraddleOrderRecord) {
        if let Err(e) = self.ledger.append(&[row]) {
            error!(target: "straddle", error = %e, "Failed to append to straddle ledger");
        }
    }
}
