//! Live quote cache fed by the ticker stream.

use crate::broker::{StreamEvent, Tick, TickerHandle};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Latest traded price per instrument token.
///
/// Only the stream pump writes; readers may see a slightly old price.
#[derive(Debug, Clone, Default)]
pub struct LiveQuoteCache {
    prices: Arc<RwLock<HashMap<u32, Decimal>>>,
}

impl LiveQuoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, instrument_token: u32) -> Option<Decimal> {
        self.prices.read().await.get(&instrument_token).copied()
    }

    /// Overwrite entries with the latest ticks.
    pub async fn apply(&self, ticks: &[Tick]) {
        let mut prices = self.prices.write().await;
        for tick in ticks {
            prices.insert(tick.instrument_token, tick.last_price);
        }
    }

    pub async fn set(&self, instrument_token: u32, price: Decimal) {
        self.prices.write().await.insert(instrument_token, price);
    }
}

/// Pump stream events into the cache until the socket closes.
///
/// On connect the `initial` tokens (the reference future) are subscribed.
/// A close or error is logged and ends the pump; there is no reconnect.
pub struct QuoteStream {
    events: mpsc::Receiver<StreamEvent>,
    cache: LiveQuoteCache,
    ticker: TickerHandle,
    initial: Vec<u32>,
}

impl QuoteStream {
    pub fn new(
        events: mpsc::Receiver<StreamEvent>,
        cache: LiveQuoteCache,
        ticker: TickerHandle,
        initial: Vec<u32>,
    ) -> Self {
        Self {
            events,
            cache,
            ticker,
            initial,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                StreamEvent::Connected => {
                    info!(target: "quotes", tokens = ?self.initial, "Ticker connected");
                    self.ticker.subscribe(&self.initial);
                }
                StreamEvent::Ticks(ticks) => {
                    debug!(target: "quotes", count = ticks.len(), "Ticks received");
                    self.cache.apply(&ticks).await;
                }
                StreamEvent::Closed { code, reason } => {
                    error!(target: "quotes", ?code, %reason, "Ticker connection closed");
                    self.ticker.stop();
                    break;
                }
                StreamEvent::Error(e) => {
                    error!(target: "quotes", error = %e, "Ticker connection error");
                    self.ticker.stop();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::TickerCommand;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_pump_subscribes_on_connect_and_caches_ticks() {
        let (ticker, mut commands) = TickerHandle::detached(true);
        let (tx, rx) = mpsc::channel(8);
        let cache = LiveQuoteCache::new();

        let pump = QuoteStream::new(rx, cache.clone(), ticker, vec![12_345_609]).spawn();

        tx.send(StreamEvent::Connected).await.unwrap();
        tx.send(StreamEvent::Ticks(vec![Tick {
            instrument_token: 12_345_609,
            last_price: dec!(47120.5),
        }]))
        .await
        .unwrap();
        tx.send(StreamEvent::Ticks(vec![Tick {
            instrument_token: 12_345_609,
            last_price: dec!(47125),
        }]))
        .await
        .unwrap();
        tx.send(StreamEvent::Closed {
            code: Some(1006),
            reason: "abnormal".into(),
        })
        .await
        .unwrap();
        pump.await.unwrap();

        assert_eq!(cache.get(12_345_609).await, Some(dec!(47125)));
        assert_eq!(commands.recv().await, Some(TickerCommand::Subscribe(vec![12_345_609])));
        assert_eq!(commands.recv().await, Some(TickerCommand::Stop));
    }

    #[tokio::test]
    async fn test_missing_quote_is_none() {
        let cache = LiveQuoteCache::new();
        assert_eq!(cache.get(1).await, None);
        cache.set(1, dec!(10)).await;
        assert_eq!(cache.get(1).await, Some(dec!(10)));
    }
}
