//! Authenticated broker session.
//!
//! A [`BrokerSession`] bundles everything a strategy needs for one trading
//! day: the REST client, the ticker stream and its quote cache, the
//! instrument directory, the order gateway and the shared position tracker.
//! Sessions are replaced once per day through the [`SessionSlot`];
//! strategies dereference the slot for every operation.

mod instruments;
mod orders;
mod positions;
mod quotes;

pub use instruments::{expiry_label, future_symbol, Instrument, InstrumentDirectory};
pub use orders::{OrderGateway, PAPER_ORDER_ID};
pub use positions::{
    market_close, ActiveTrade, ExitReason, MonitorAction, PositionTracker, PositionView,
};
pub use quotes::{LiveQuoteCache, QuoteStream};

use crate::broker::{
    BrokerClient, Candle, CandleInterval, KiteClient, KiteTicker, OrderRequest, TickerHandle,
    TransactionType,
};
use crate::clock::Clock;
use crate::config::{Config, Credentials, SessionConfig};
use crate::error::BrokerError;
use crate::ledger::{format_date_time, CsvLedger, EmaOrderRecord};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, instrument, warn};

/// Channel on which background tasks report errors that must stop the process.
pub type FatalSender = mpsc::UnboundedSender<BrokerError>;

const READINESS_POLL: Duration = Duration::from_millis(200);
const REFRESH_POLL: Duration = Duration::from_secs(20);

/// Buy request for [`BrokerSession::place_entry`].
#[derive(Debug, Clone, PartialEq)]
pub struct EntryOrder {
    pub symbol: String,
    pub quantity: u32,
    pub target: Decimal,
    pub stop_loss: Decimal,
    pub trailing_stop: Decimal,
    /// Reference (future) price the levels are measured from
    pub reference_price: Decimal,
    pub paper: bool,
}

/// Everything needed to assemble a session without logging in.
pub struct SessionParts {
    pub client: Arc<dyn BrokerClient>,
    pub ticker: TickerHandle,
    pub directory: InstrumentDirectory,
    pub quotes: LiveQuoteCache,
    pub tracker: Arc<PositionTracker>,
    pub clock: Arc<dyn Clock>,
    pub settings: SessionConfig,
    pub ledger: Arc<CsvLedger>,
    pub underlying: String,
}

pub struct BrokerSession {
    client: Arc<dyn BrokerClient>,
    ticker: TickerHandle,
    directory: InstrumentDirectory,
    quotes: LiveQuoteCache,
    gateway: OrderGateway,
    tracker: Arc<PositionTracker>,
    clock: Arc<dyn Clock>,
    settings: SessionConfig,
    ledger: Arc<CsvLedger>,
    future_symbol: String,
    future_token: u32,
    created_at: NaiveDateTime,
}

impl BrokerSession {
    /// Log in and bring up the stream.
    ///
    /// Loads the instrument directory, logs in with retries, resolves the
    /// near-month future and waits for the ticker to connect. Any failure
    /// here is fatal for the caller.
    #[instrument(skip_all, fields(user_id = %creds.user_id))]
    pub async fn authenticate(
        config: &Config,
        creds: &Credentials,
        clock: Arc<dyn Clock>,
        tracker: Arc<PositionTracker>,
        ledger: Arc<CsvLedger>,
    ) -> Result<Self, BrokerError> {
        let settings = config.session.clone();

        let downloader = KiteClient::new(&config.broker, &creds.api_key)?;
        let downloader = &downloader;
        let directory = InstrumentDirectory::load(
            &config.broker.instruments_file,
            clock.as_ref(),
            settings.max_instrument_fetch_attempts,
            settings.retry_delay(),
            move || downloader.download_instruments(),
        )
        .await?;

        let client = login_with_retries(config, creds, clock.as_ref()).await?;
        let access_token = client.access_token().unwrap_or_default().to_string();

        let (future_symbol, future_token) = directory
            .resolve_future(&config.underlying, clock.now().date())
            .ok_or_else(|| {
                BrokerError::InstrumentLookup(format!(
                    "No near-month future found for {}",
                    config.underlying
                ))
            })?;

        let quotes = LiveQuoteCache::new();
        let (ticker, events) =
            KiteTicker::new(&config.broker.ws_url, &creds.api_key, &access_token).spawn();
        QuoteStream::new(events, quotes.clone(), ticker.clone(), vec![future_token]).spawn();

        wait_for_stream(&ticker, clock.as_ref(), settings.ticker_timeout()).await?;
        info!(future = %future_symbol, "Broker session ready");

        Self::from_parts(SessionParts {
            client: Arc::new(client),
            ticker,
            directory,
            quotes,
            tracker,
            clock,
            settings,
            ledger,
            underlying: config.underlying.clone(),
        })
    }

    /// Assemble a session from already-built parts.
    pub fn from_parts(parts: SessionParts) -> Result<Self, BrokerError> {
        let now = parts.clock.now();
        let (future_symbol, future_token) = parts
            .directory
            .resolve_future(&parts.underlying, now.date())
            .ok_or_else(|| {
                BrokerError::InstrumentLookup(format!(
                    "No near-month future found for {}",
                    parts.underlying
                ))
            })?;

        let gateway = OrderGateway::new(parts.client.clone(), parts.clock.clone(), &parts.settings);

        Ok(Self {
            client: parts.client,
            ticker: parts.ticker,
            directory: parts.directory,
            quotes: parts.quotes,
            gateway,
            tracker: parts.tracker,
            clock: parts.clock,
            settings: parts.settings,
            ledger: parts.ledger,
            future_symbol,
            future_token,
            created_at: now,
        })
    }

    pub fn created_on(&self) -> NaiveDate {
        self.created_at.date()
    }

    pub fn gateway(&self) -> &OrderGateway {
        &self.gateway
    }

    pub fn tracker(&self) -> &Arc<PositionTracker> {
        &self.tracker
    }

    pub fn directory(&self) -> &InstrumentDirectory {
        &self.directory
    }

    pub fn future_symbol(&self) -> &str {
        &self.future_symbol
    }

    pub fn future_token(&self) -> u32 {
        self.future_token
    }

    pub fn is_connected(&self) -> bool {
        self.ticker.is_connected()
    }

    /// Exchange and instrument token for a tradingsymbol.
    pub fn resolve_symbol(&self, tradingsymbol: &str) -> Option<(&str, u32)> {
        self.directory.resolve_symbol(tradingsymbol)
    }

    pub async fn quote(&self, instrument_token: u32) -> Option<Decimal> {
        self.quotes.get(instrument_token).await
    }

    pub async fn future_quote(&self) -> Option<Decimal> {
        self.quotes.get(self.future_token).await
    }

    pub fn subscribe(&self, tokens: &[u32]) {
        self.ticker.subscribe(tokens);
    }

    pub fn unsubscribe(&self, tokens: &[u32]) {
        self.ticker.unsubscribe(tokens);
    }

    fn order_for(
        &self,
        tradingsymbol: &str,
        side: TransactionType,
        quantity: u32,
    ) -> Result<(OrderRequest, u32), BrokerError> {
        let (exchange, token) = self.resolve_symbol(tradingsymbol).ok_or_else(|| {
            BrokerError::InstrumentLookup(format!("Unknown trading symbol {}", tradingsymbol))
        })?;
        let order = OrderRequest {
            exchange: exchange.to_string(),
            tradingsymbol: tradingsymbol.to_string(),
            transaction_type: side,
            quantity,
        };
        Ok((order, token))
    }

    /// Buy and record the single active trade.
    ///
    /// Rejected with a non-fatal [`BrokerError::PositionOpen`] while another
    /// trade is open. Exhausted retries leave no trade behind.
    #[instrument(skip(self), fields(symbol = %entry.symbol))]
    pub async fn place_entry(&self, entry: EntryOrder) -> Result<ActiveTrade, BrokerError> {
        let reservation = self.tracker.begin_entry().await?;
        let (order, token) = self.order_for(&entry.symbol, TransactionType::Buy, entry.quantity)?;

        let order_id = self.gateway.execute(&order, entry.paper).await?;

        let trade = ActiveTrade {
            order_id,
            instrument_token: token,
            trading_symbol: entry.symbol,
            reference_token: self.future_token,
            quantity: entry.quantity,
            entry_price: entry.reference_price,
            target: entry.target,
            stop_loss: entry.stop_loss,
            trailing_stop: entry.trailing_stop,
            paper_trade: entry.paper,
            opened_at: self.clock.now(),
        };

        info!(
            order_id = %trade.order_id,
            instrument_token = trade.instrument_token,
            quantity = trade.quantity,
            target = %trade.target,
            stoploss = %trade.stop_loss,
            trailing_sl = %trade.trailing_stop,
            price = %trade.entry_price,
            "BUY trade triggered"
        );

        self.record(EmaOrderRecord {
            order_id: trade.order_id.clone(),
            date_time: format_date_time(trade.opened_at),
            instrument_token: token,
            order_type: TransactionType::Buy.to_string(),
            quantity: trade.quantity,
            target: Some(trade.target),
            stoploss: Some(trade.stop_loss),
            trailing_sl: Some(trade.trailing_stop),
            future_price: trade.entry_price,
            paper_trade: trade.paper_trade,
        });

        reservation.commit(trade.clone()).await;
        Ok(trade)
    }

    /// Sell out of the active trade and clear it.
    #[instrument(skip(self))]
    pub async fn place_exit(
        &self,
        tradingsymbol: &str,
        quantity: u32,
        reference_price: Decimal,
        paper: bool,
    ) -> Result<String, BrokerError> {
        let (order, token) = self.order_for(tradingsymbol, TransactionType::Sell, quantity)?;
        let order_id = self.gateway.execute(&order, paper).await?;

        info!(
            %order_id,
            instrument_token = token,
            quantity,
            price = %reference_price,
            "SELL trade triggered"
        );

        self.record(EmaOrderRecord {
            order_id: order_id.clone(),
            date_time: format_date_time(self.clock.now()),
            instrument_token: token,
            order_type: TransactionType::Sell.to_string(),
            quantity,
            target: None,
            stoploss: None,
            trailing_sl: None,
            future_price: reference_price,
            paper_trade: paper,
        });

        self.tracker.clear().await;
        Ok(order_id)
    }

    fn record(&self, row: EmaOrderRecord) {
        if let Err(e) = self.ledger.append(&[row]) {
            error!(error = %e, "Failed to append to order ledger");
        }
    }

    /// Watch the active trade until it exits.
    ///
    /// Returns immediately if another monitor is already running or no trade
    /// is open.
    pub async fn monitor_exit(&self) -> Result<(), BrokerError> {
        let Some(_claim) = self.tracker.claim_monitor() else {
            info!("Exit monitor already running");
            return Ok(());
        };

        loop {
            let Some(trade) = self.tracker.active().await else {
                return Ok(());
            };

            let time = self.clock.time();
            let ltp = self.quotes.get(trade.reference_token).await;
            let action = match ltp {
                Some(ltp) => trade.evaluate(ltp, time),
                None if time >= market_close() => MonitorAction::Exit(ExitReason::MarketClose),
                None => {
                    warn!(token = trade.reference_token, "No quote for reference instrument yet");
                    MonitorAction::Hold
                }
            };

            match action {
                MonitorAction::Exit(reason) => {
                    // Without a quote the exit is booked at the entry reference
                    let price = ltp.unwrap_or(trade.entry_price);
                    info!(order_id = %trade.order_id, %reason, %price, "Closing position");
                    self.place_exit(&trade.trading_symbol, trade.quantity, price, trade.paper_trade)
                        .await?;
                    return Ok(());
                }
                MonitorAction::Trail => {
                    if let Some(entry) = self.tracker.trail().await {
                        info!(new_reference = %entry, "Moved stoploss forward");
                    }
                }
                MonitorAction::Hold => {}
            }

            self.clock.sleep(self.settings.quote_poll()).await;
        }
    }

    /// Today's 5-minute candles for the reference future.
    pub async fn fetch_future_candles(&self) -> Result<Vec<Candle>, BrokerError> {
        let attempts = self.settings.historical_fetch_max_retries;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self
                .client
                .historical_candles(
                    self.future_token,
                    self.clock.now().date(),
                    CandleInterval::FiveMinute,
                )
                .await
            {
                Ok(candles) => return Ok(candles),
                Err(e) => {
                    warn!(attempt, error = %e, "Historical data fetch failed, retrying");
                    last_error = e.to_string();
                }
            }
            self.clock.sleep(self.settings.retry_delay()).await;
        }

        error!("Historical data fetch max retries exceeded");
        Err(BrokerError::RetriesExhausted {
            operation: "historical data fetch",
            attempts,
            last_error,
        })
    }

    /// Active Five-EMA trade for the positions view.
    pub async fn positions(&self) -> Vec<PositionView> {
        let Some(trade) = self.tracker.active().await else {
            return Vec::new();
        };
        vec![PositionView {
            strategy: "FIVE EMA".to_string(),
            date_time: format_date_time(trade.opened_at),
            order_id: trade.order_id,
            trading_symbol: trade.trading_symbol,
            future_ltp: self.future_quote().await,
            quantity: trade.quantity,
            entry_price: trade.entry_price,
            status: "ACTIVE".to_string(),
        }]
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        self.ticker.stop();
    }
}

async fn login_with_retries(
    config: &Config,
    creds: &Credentials,
    clock: &dyn Clock,
) -> Result<KiteClient, BrokerError> {
    let attempts = config.session.max_login_attempts;
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match KiteClient::login(&config.broker, creds).await {
            Ok(client) => return Ok(client),
            Err(e) => {
                warn!(attempt, error = %e, "Broker login failed, retrying");
                last_error = e.to_string();
            }
        }
        clock.sleep(config.session.retry_delay()).await;
    }

    error!("Broker login max retries exceeded");
    Err(BrokerError::RetriesExhausted {
        operation: "broker login",
        attempts,
        last_error,
    })
}

async fn wait_for_stream(
    ticker: &TickerHandle,
    clock: &dyn Clock,
    timeout: Duration,
) -> Result<(), BrokerError> {
    let mut waited = Duration::ZERO;
    while !ticker.is_connected() {
        if waited >= timeout {
            ticker.stop();
            return Err(BrokerError::Stream(format!(
                "ticker did not connect within {:?}",
                timeout
            )));
        }
        clock.sleep(READINESS_POLL).await;
        waited += READINESS_POLL;
    }
    Ok(())
}

/// Versioned handle to the current session.
pub struct SessionSlot {
    current: RwLock<Arc<BrokerSession>>,
    generation: AtomicU64,
}

impl SessionSlot {
    pub fn new(session: BrokerSession) -> Self {
        Self::shared(Arc::new(session))
    }

    pub fn shared(session: Arc<BrokerSession>) -> Self {
        Self {
            current: RwLock::new(session),
            generation: AtomicU64::new(1),
        }
    }

    /// Snapshot of the current session. In-flight work keeps its snapshot
    /// even if the slot is swapped meanwhile.
    pub async fn current(&self) -> Arc<BrokerSession> {
        self.current.read().await.clone()
    }

    /// Install a new session and return the new generation.
    pub async fn replace(&self, session: BrokerSession) -> u64 {
        let mut current = self.current.write().await;
        *current = Arc::new(session);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

fn refresh_window(time: NaiveTime) -> bool {
    let start = NaiveTime::from_hms_opt(9, 15, 15).unwrap_or(NaiveTime::MIN);
    let end = NaiveTime::from_hms_opt(9, 16, 0).unwrap_or(NaiveTime::MIN);
    time >= start && time <= end
}

/// Replace the session once per trading day, shortly after the open.
///
/// `connect` builds the new session. Runs until a refresh fails, which is
/// returned as a fatal error.
pub async fn run_session_refresh<F, Fut>(
    slot: Arc<SessionSlot>,
    clock: Arc<dyn Clock>,
    mut connect: F,
) -> Result<(), BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<BrokerSession, BrokerError>>,
{
    let mut refreshed_on = slot.current().await.created_on();

    loop {
        let now = clock.now();
        if refresh_window(now.time()) && refreshed_on != now.date() {
            info!("Refreshing broker session for the new trading day");
            let session = connect().await?;
            let generation = slot.replace(session).await;
            refreshed_on = now.date();
            info!(generation, "Broker session refreshed");
        }
        clock.sleep(REFRESH_POLL).await;
    }
}
