//! Five-EMA trend follow on 5-minute index future candles.
//!
//! A candle whose low clears the EMA arms the strategy and becomes the
//! trigger. A later close below the trigger's low buys the at-the-money put;
//! stop and target are measured on the future. While armed, a stronger candle
//! (low above the EMA and above the previous low) replaces the trigger.

use super::indicators::ema;
use super::strike::{atm_option_symbol, OptionKind};
use crate::broker::Candle;
use crate::clock::Clock;
use crate::config::StrategyParams;
use crate::error::BrokerError;
use crate::session::{EntryOrder, FatalSender, SessionSlot};
use anyhow::Result;
use chrono::{NaiveDateTime, NaiveTime, Timelike};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const EMA_PERIOD: usize = 5;
const CANDLE_MINUTES: u32 = 5;

fn session_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 16, 0).unwrap_or(NaiveTime::MIN)
}

fn session_halt() -> NaiveTime {
    NaiveTime::from_hms_opt(14, 30, 0).unwrap_or(NaiveTime::MIN)
}

fn in_trading_window(time: NaiveTime) -> bool {
    time > session_open() && time < session_halt()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    OutOfTrade,
    InTrade,
}

/// Entry levels produced when a close breaks the trigger low.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySignal {
    pub close: Decimal,
    pub stop_loss: Decimal,
    pub target: Decimal,
}

/// Candle-by-candle state of the strategy.
#[derive(Debug, Clone)]
pub struct TrendState {
    region: Region,
    trigger: Option<Candle>,
    last: Option<Candle>,
}

impl Default for TrendState {
    fn default() -> Self {
        Self {
            region: Region::OutOfTrade,
            trigger: None,
            last: None,
        }
    }
}

impl TrendState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn trigger(&self) -> Option<&Candle> {
        self.trigger.as_ref()
    }

    /// Feed one completed candle with the EMA at that candle.
    pub fn on_candle(
        &mut self,
        candle: &Candle,
        ema: Decimal,
        position_open: bool,
        params: &StrategyParams,
    ) -> Option<EntrySignal> {
        match self.region {
            Region::OutOfTrade => {
                if position_open {
                    self.last = Some(candle.clone());
                } else if candle.low > ema {
                    info!(low = %candle.low, %ema, "Entered trade region");
                    self.trigger = Some(candle.clone());
                    self.last = Some(candle.clone());
                    self.region = Region::InTrade;
                } else {
                    debug!(low = %candle.low, %ema, "Candle below EMA, out of trade region");
                }
                None
            }
            Region::InTrade => {
                let Some(trigger) = self.trigger.clone() else {
                    self.region = Region::OutOfTrade;
                    return None;
                };

                let mut signal = None;
                if candle.close < trigger.low {
                    let stop_loss = params.stoploss.min(trigger.high - candle.close);
                    let target = candle.close + params.target.min(stop_loss * Decimal::from(3));
                    info!(close = %candle.close, trigger_low = %trigger.low, %stop_loss, %target, "Entry signal");
                    signal = Some(EntrySignal {
                        close: candle.close,
                        stop_loss,
                        target,
                    });
                    self.region = Region::OutOfTrade;
                } else if candle.close > trigger.low {
                    let last_low = self.last.as_ref().map_or(trigger.low, |c| c.low);
                    if candle.low > ema && candle.low > last_low {
                        info!(low = %candle.low, %ema, %last_low, "Trigger candle shifted");
                        self.trigger = Some(candle.clone());
                    } else {
                        debug!("EMA touching candle, waiting for next one");
                    }
                }

                self.last = Some(candle.clone());
                signal
            }
        }
    }
}

/// Polling loop for one trading day.
pub struct TrendFollowStrategy {
    slot: Arc<SessionSlot>,
    clock: Arc<dyn Clock>,
    params: StrategyParams,
    running: Arc<AtomicBool>,
    fatal: FatalSender,
    poll: Duration,
    state: TrendState,
    last_seen: Option<NaiveDateTime>,
}

impl TrendFollowStrategy {
    pub fn new(
        slot: Arc<SessionSlot>,
        clock: Arc<dyn Clock>,
        params: StrategyParams,
        running: Arc<AtomicBool>,
        fatal: FatalSender,
        poll: Duration,
    ) -> Self {
        Self {
            slot,
            clock,
            params,
            running,
            fatal,
            poll,
            state: TrendState::new(),
            last_seen: None,
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run until stopped or until the 14:30 halt.
    pub async fn run(mut self) -> Result<(), BrokerError> {
        info!(target: "five_ema", "Five EMA strategy started");

        info!(target: "five_ema", "Waiting for market to start");
        while !in_trading_window(self.clock.time()) {
            if !self.is_running() {
                return Ok(());
            }
            self.clock.sleep(self.poll).await;
        }
        info!(target: "five_ema", "Market in progress");

        loop {
            if !self.wait_for_boundary().await {
                return Ok(());
            }

            if self.clock.time() >= session_halt() {
                self.running.store(false, Ordering::SeqCst);
                info!(target: "five_ema", "Five EMA strategy stopped till next day, market closing");
                return Ok(());
            }

            let Some(candles) = self.next_candles().await? else {
                return Ok(());
            };
            self.evaluate(&candles).await?;
        }
    }

    /// Sleep until the minute hand reaches the next 5-minute mark. Returns
    /// false if stopped meanwhile.
    async fn wait_for_boundary(&self) -> bool {
        debug!(target: "five_ema", "Waiting for the next candle");
        let minute = self.clock.now().minute();
        let boundary = (minute / CANDLE_MINUTES + 1) * CANDLE_MINUTES % 60;

        while self.clock.now().minute() != boundary {
            if !self.is_running() {
                return false;
            }
            self.clock.sleep(self.poll).await;
        }
        true
    }

    /// Re-fetch candles until one newer than the last seen shows up.
    async fn next_candles(&mut self) -> Result<Option<Vec<Candle>>, BrokerError> {
        loop {
            if !self.is_running() {
                return Ok(None);
            }

            let session = self.slot.current().await;
            let candles = session.fetch_future_candles().await?;
            if let Some(latest) = candles.last() {
                if self.last_seen != Some(latest.timestamp) {
                    self.last_seen = Some(latest.timestamp);
                    info!(target: "five_ema", candle = %latest.timestamp, "New candle fetched");
                    return Ok(Some(candles));
                }
            }

            self.clock.sleep(self.poll).await;
        }
    }

    async fn evaluate(&mut self, candles: &[Candle]) -> Result<(), BrokerError> {
        let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
        let (Some(candle), Some(ema)) = (candles.last(), ema(&closes, EMA_PERIOD)) else {
            return Ok(());
        };

        let session = self.slot.current().await;
        let position_open = session.tracker().has_position().await;

        let Some(signal) = self.state.on_candle(candle, ema, position_open, &self.params) else {
            return Ok(());
        };

        let entry = EntryOrder {
            symbol: atm_option_symbol(session.future_symbol(), signal.close, OptionKind::Put),
            quantity: self.params.order_quantity(),
            target: signal.target,
            stop_loss: signal.stop_loss,
            trailing_stop: self.params.trailing_stoploss,
            reference_price: signal.close,
            paper: self.params.paper_trading,
        };

        match session.place_entry(entry).await {
            Ok(trade) => {
                info!(target: "five_ema", order_id = %trade.order_id, symbol = %trade.trading_symbol, "Position opened, starting exit monitor");
                let fatal = self.fatal.clone();
                tokio::spawn(async move {
                    if let Err(e) = session.monitor_exit().await {
                        report(&fatal, e);
                    }
                });
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(target: "five_ema", error = %e, "Entry skipped");
                Ok(())
            }
        }
    }
}

fn report(fatal: &FatalSender, e: BrokerError) {
    if e.is_fatal() {
        let _ = fatal.send(e);
    } else {
        error!(target: "five_ema", error = %e, "Strategy task failed");
    }
}

/// Starts and stops the Five-EMA task on request.
pub struct TrendFollowController {
    slot: Arc<SessionSlot>,
    clock: Arc<dyn Clock>,
    params_file: PathBuf,
    poll: Duration,
    fatal: FatalSender,
    current: Mutex<Option<Arc<AtomicBool>>>,
}

impl TrendFollowController {
    pub fn new(
        slot: Arc<SessionSlot>,
        clock: Arc<dyn Clock>,
        params_file: PathBuf,
        poll: Duration,
        fatal: FatalSender,
    ) -> Self {
        Self {
            slot,
            clock,
            params_file,
            poll,
            fatal,
            current: Mutex::new(None),
        }
    }

    /// Spawn the strategy with freshly loaded parameters. Returns `false`
    /// if it was already running.
    pub async fn start(&self) -> Result<bool> {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            info!(target: "five_ema", "Five EMA strategy already running");
            return Ok(false);
        }

        let params = StrategyParams::load(&self.params_file)?;
        info!(target: "five_ema", ?params, "Strategy parameters loaded");

        let running = Arc::new(AtomicBool::new(true));
        let strategy = TrendFollowStrategy::new(
            self.slot.clone(),
            self.clock.clone(),
            params,
            running.clone(),
            self.fatal.clone(),
            self.poll,
        );

        let flag = running.clone();
        let fatal = self.fatal.clone();
        tokio::spawn(async move {
            if let Err(e) = strategy.run().await {
                flag.store(false, Ordering::SeqCst);
                report(&fatal, e);
            }
        });

        *current = Some(running);
        Ok(true)
    }

    /// Ask the running strategy to stop at its next poll.
    pub async fn stop(&self) {
        if let Some(flag) = self.current.lock().await.take() {
            flag.store(false, Ordering::SeqCst);
            info!(target: "five_ema", "Five EMA strategy stop requested");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBrokerClient;
    use crate::session::testing::{harness, FUTURE_TOKEN};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    fn params() -> StrategyParams {
        StrategyParams {
            target: dec!(60),
            trailing_stoploss: dec!(20),
            quantity: 1,
            lot_size: 25,
            stoploss: dec!(30),
            paper_trading: true,
        }
    }

    fn candle(minute: u32, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            timestamp: NaiveDate::from_ymd_opt(2024, 3, 4)
                .unwrap()
                .and_hms_opt(9 + (15 + minute) / 60, (15 + minute) % 60, 0)
                .unwrap(),
            open,
            high,
            low,
            close,
            volume: 1000,
        }
    }

    fn with_low(low: Decimal, close: Decimal) -> Candle {
        candle(0, close, close + dec!(5), low, close)
    }

    #[test]
    fn test_trigger_replacement_sequence() {
        let mut state = TrendState::new();
        // (low, close, ema): the EMA sits under every low except the third
        let candles = [
            (dec!(10), dec!(14), dec!(5)),
            (dec!(12), dec!(16), dec!(5)),
            (dec!(9), dec!(13), dec!(11)),
            (dec!(15), dec!(18), dec!(5)),
        ];

        let mut replaced = Vec::new();
        for (i, (low, close, ema)) in candles.into_iter().enumerate() {
            let before = state.trigger().map(|c| c.low);
            let signal = state.on_candle(&with_low(low, close), ema, false, &params());
            assert!(signal.is_none());
            if i > 0 && state.trigger().map(|c| c.low) != before {
                replaced.push(i);
            }
        }
        assert_eq!(replaced, vec![1, 3]);
        assert_eq!(state.trigger().map(|c| c.low), Some(dec!(15)));
        assert_eq!(state.region(), Region::InTrade);
    }

    #[test]
    fn test_trigger_kept_until_low_clears_ema() {
        let mut state = TrendState::new();
        state.on_candle(&with_low(dec!(10), dec!(14)), dec!(5), false, &params());

        // Higher low, but touching the EMA
        state.on_candle(&with_low(dec!(14), dec!(18)), dec!(20), false, &params());
        assert_eq!(state.trigger().map(|c| c.low), Some(dec!(10)));
        state.on_candle(&with_low(dec!(16), dec!(19)), dec!(16), false, &params());
        assert_eq!(state.trigger().map(|c| c.low), Some(dec!(10)));

        // Same higher low once the EMA drops under it
        state.on_candle(&with_low(dec!(17), dec!(20)), dec!(12), false, &params());
        assert_eq!(state.trigger().map(|c| c.low), Some(dec!(17)));
    }

    #[test]
    fn test_entry_levels() {
        let mut state = TrendState::new();
        let trigger = candle(0, dec!(98), dec!(105), dec!(95), dec!(100));
        state.on_candle(&trigger, dec!(88), false, &params());

        let breakdown = candle(5, dec!(99), dec!(99), dec!(85), dec!(90));
        let signal = state.on_candle(&breakdown, dec!(90), false, &params()).unwrap();
        assert_eq!(signal.stop_loss, dec!(15));
        assert_eq!(signal.target, dec!(135));
        assert_eq!(state.region(), Region::OutOfTrade);

        // Configured stop tighter than the candle range
        let mut state = TrendState::new();
        state.on_candle(&trigger, dec!(88), false, &params());
        let tight = StrategyParams {
            stoploss: dec!(10),
            target: dec!(100),
            ..params()
        };
        let signal = state.on_candle(&breakdown, dec!(90), false, &tight).unwrap();
        assert_eq!(signal.stop_loss, dec!(10));
        assert_eq!(signal.target, dec!(120));
    }

    #[test]
    fn test_open_position_keeps_region_out() {
        let mut state = TrendState::new();
        let c = candle(0, dec!(98), dec!(105), dec!(95), dec!(100));
        assert!(state.on_candle(&c, dec!(50), true, &params()).is_none());
        assert_eq!(state.region(), Region::OutOfTrade);
        assert!(state.trigger().is_none());
    }

    #[tokio::test]
    async fn test_run_enters_on_new_candles_with_expected_levels() {
        let mut mock = MockBrokerClient::new();
        let running = Arc::new(AtomicBool::new(true));

        let history = vec![
            candle(0, dec!(82), dec!(84), dec!(78), dec!(80)),
            candle(5, dec!(80), dec!(88), dec!(79), dec!(85)),
            candle(10, dec!(98), dec!(105), dec!(95), dec!(100)),
        ];
        let mut extended = history.clone();
        extended.push(candle(15, dec!(99), dec!(99), dec!(85), dec!(90)));

        let stop = running.clone();
        let mut calls = 0;
        mock.expect_historical_candles().returning(move |token, _, _| {
            assert_eq!(token, FUTURE_TOKEN);
            calls += 1;
            match calls {
                1 | 2 => Ok(history.clone()),
                _ => {
                    stop.store(false, Ordering::SeqCst);
                    Ok(extended.clone())
                }
            }
        });

        let h = harness(mock, "2024-03-04 09:33:00");
        let slot = Arc::new(SessionSlot::shared(h.session.clone()));
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();

        let strategy = TrendFollowStrategy::new(
            slot,
            h.clock.clone(),
            params(),
            running.clone(),
            fatal_tx,
            Duration::from_secs(1),
        );
        strategy.run().await.unwrap();

        let trade = h.tracker.active().await.unwrap();
        assert_eq!(trade.trading_symbol, "BANKNIFTY24MAR100PE");
        assert_eq!(trade.stop_loss, dec!(15));
        assert_eq!(trade.target, dec!(135));
        assert_eq!(trade.entry_price, dec!(90));
        assert_eq!(trade.quantity, 25);
        assert!(trade.paper_trade);
    }

    #[tokio::test]
    async fn test_run_halts_at_cutoff() {
        let mut mock = MockBrokerClient::new();
        mock.expect_historical_candles().never();

        let h = harness(mock, "2024-03-04 14:27:00");
        let slot = Arc::new(SessionSlot::shared(h.session.clone()));
        let running = Arc::new(AtomicBool::new(true));
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();

        TrendFollowStrategy::new(
            slot,
            h.clock.clone(),
            params(),
            running.clone(),
            fatal_tx,
            Duration::from_secs(1),
        )
        .run()
        .await
        .unwrap();

        assert!(!running.load(Ordering::SeqCst));
        assert!(h.clock.time() >= session_halt());
    }

    #[tokio::test]
    async fn test_controller_start_stop() {
        // After the close the spawned task only waits for the next session
        let h = harness(MockBrokerClient::new(), "2024-03-04 16:00:00");
        let slot = Arc::new(SessionSlot::shared(h.session.clone()));
        let params_file = h.dir.path().join("Strategy/properties.json");
        params().save(&params_file).unwrap();
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();

        let controller = TrendFollowController::new(
            slot,
            h.clock.clone(),
            params_file,
            Duration::from_secs(1),
            fatal_tx,
        );

        assert!(!controller.is_running().await);
        assert!(controller.start().await.unwrap());
        assert!(!controller.start().await.unwrap());
        assert!(controller.is_running().await);

        controller.stop().await;
        assert!(!controller.is_running().await);
    }

    #[tokio::test]
    async fn test_controller_start_without_params_fails() {
        let h = harness(MockBrokerClient::new(), "2024-03-04 16:00:00");
        let slot = Arc::new(SessionSlot::shared(h.session.clone()));
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();

        let controller = TrendFollowController::new(
            slot,
            h.clock.clone(),
            h.dir.path().join("missing.json"),
            Duration::from_secs(1),
            fatal_tx,
        );
        assert!(controller.start().await.is_err());
        assert!(!controller.is_running().await);
    }
}
