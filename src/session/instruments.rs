//! Instrument master: tradingsymbol and token lookups.
//!
//! The master is cached on disk and re-downloaded when the cached copy was not
//! written today (exchange-local date).

use crate::clock::Clock;
use crate::error::BrokerError;
use chrono::{Datelike, NaiveDate};
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// One row of the instrument master.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Instrument {
    pub instrument_token: u32,
    pub tradingsymbol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub expiry: String,
    #[serde(default)]
    pub lot_size: u32,
    #[serde(default)]
    pub instrument_type: String,
    pub exchange: String,
}

/// Symbol and token indexes over the instrument master.
#[derive(Debug, Clone, Default)]
pub struct InstrumentDirectory {
    by_symbol: HashMap<String, Instrument>,
    by_token: HashMap<u32, String>,
}

impl InstrumentDirectory {
    pub fn from_instruments(instruments: impl IntoIterator<Item = Instrument>) -> Self {
        let mut directory = Self::default();
        for instrument in instruments {
            directory
                .by_token
                .insert(instrument.instrument_token, instrument.tradingsymbol.clone());
            directory
                .by_symbol
                .insert(instrument.tradingsymbol.clone(), instrument);
        }
        directory
    }

    /// Parse the CSV instrument master.
    pub fn from_csv(data: &[u8]) -> Result<Self, BrokerError> {
        let mut reader = csv::Reader::from_reader(data);
        let instruments = reader
            .deserialize::<Instrument>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BrokerError::InstrumentLookup(format!("Malformed instrument file: {}", e)))?;

        if instruments.is_empty() {
            return Err(BrokerError::InstrumentLookup("Instrument file is empty".into()));
        }
        Ok(Self::from_instruments(instruments))
    }

    /// Load from the cache file, downloading a fresh copy when the cache is
    /// missing or stale. Download and parse failures are retried.
    pub async fn load<F, Fut>(
        path: &Path,
        clock: &dyn Clock,
        attempts: u32,
        delay: Duration,
        mut download: F,
    ) -> Result<Self, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<String, BrokerError>>,
    {
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match Self::load_once(path, clock, &mut download).await {
                Ok(directory) => {
                    info!(instruments = directory.len(), "Instruments loaded successfully");
                    return Ok(directory);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Instrument file load failed, retrying");
                    last_error = e.to_string();
                }
            }
            clock.sleep(delay).await;
        }

        error!("Instrument file download max retries exceeded");
        Err(BrokerError::RetriesExhausted {
            operation: "instrument download",
            attempts,
            last_error,
        })
    }

    async fn load_once<F, Fut>(
        path: &Path,
        clock: &dyn Clock,
        download: &mut F,
    ) -> Result<Self, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<String, BrokerError>>,
    {
        if !cache_is_fresh(path, clock) {
            info!(path = ?path, "Downloading instrument master");
            let body = download().await?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BrokerError::InstrumentLookup(format!("Cannot create {:?}: {}", parent, e))
                })?;
            }
            std::fs::write(path, body.as_bytes()).map_err(|e| {
                BrokerError::InstrumentLookup(format!("Cannot write {:?}: {}", path, e))
            })?;
        }

        let data = std::fs::read(path)
            .map_err(|e| BrokerError::InstrumentLookup(format!("Cannot read {:?}: {}", path, e)))?;
        Self::from_csv(&data)
    }

    pub fn len(&self) -> usize {
        self.by_symbol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }

    pub fn get(&self, tradingsymbol: &str) -> Option<&Instrument> {
        self.by_symbol.get(tradingsymbol)
    }

    /// Exchange and token for a tradingsymbol, `None` if unknown.
    pub fn resolve_symbol(&self, tradingsymbol: &str) -> Option<(&str, u32)> {
        self.by_symbol
            .get(tradingsymbol)
            .map(|i| (i.exchange.as_str(), i.instrument_token))
    }

    /// Reverse lookup.
    pub fn symbol_for(&self, instrument_token: u32) -> Option<&str> {
        self.by_token.get(&instrument_token).map(String::as_str)
    }

    /// Near-month future for `underlying`: this month's contract, or next
    /// month's once this month's has expired out of the master.
    pub fn resolve_future(&self, underlying: &str, today: NaiveDate) -> Option<(String, u32)> {
        let current = future_symbol(underlying, today.year(), today.month());
        if let Some((_, token)) = self.resolve_symbol(&current) {
            return Some((current, token));
        }

        let (year, month) = next_month(today.year(), today.month());
        let next = future_symbol(underlying, year, month);
        self.resolve_symbol(&next).map(|(_, token)| (next, token))
    }
}

/// Monthly future symbol, e.g. `BANKNIFTY24MARFUT`.
pub fn future_symbol(underlying: &str, year: i32, month: u32) -> String {
    format!(
        "{}{:02}{}FUT",
        underlying,
        year.rem_euclid(100),
        month_code(month)
    )
}

/// Expiry label shown on the control panel, e.g. `MAR 24`.
pub fn expiry_label(day: NaiveDate) -> String {
    format!("{} {:02}", month_code(day.month()), day.year().rem_euclid(100))
}

fn month_code(month: u32) -> &'static str {
    MONTHS[(month.clamp(1, 12) - 1) as usize]
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month >= 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

/// The cache is fresh when its modification time falls on today's
/// exchange-local date.
fn cache_is_fresh(path: &Path, clock: &dyn Clock) -> bool {
    let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) else {
        return false;
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    let Ok(age) = chrono::Duration::from_std(age) else {
        return false;
    };
    let now = clock.now();
    (now - age).date() == now.date()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    const MASTER: &str = "instrument_token,exchange_token,tradingsymbol,name,last_price,expiry,strike,tick_size,lot_size,instrument_type,segment,exchange
12345609,48225,BANKNIFTY24MARFUT,BANKNIFTY,0,2024-03-27,0,0.05,15,FUT,NFO-FUT,NFO
12345610,48226,BANKNIFTY24APRFUT,BANKNIFTY,0,2024-04-24,0,0.05,15,FUT,NFO-FUT,NFO
9876521,38580,BANKNIFTY24MAR47000PE,BANKNIFTY,0,2024-03-27,47000,0.05,15,PE,NFO-OPT,NFO
260105,1016,NIFTY BANK,,0,,0,0,0,EQ,INDICES,NSE
";

    #[test]
    fn test_parse_master_and_lookups() {
        let directory = InstrumentDirectory::from_csv(MASTER.as_bytes()).unwrap();
        assert_eq!(directory.len(), 4);
        assert_eq!(
            directory.resolve_symbol("BANKNIFTY24MAR47000PE"),
            Some(("NFO", 9_876_521))
        );
        assert_eq!(directory.resolve_symbol("NIFTY BANK"), Some(("NSE", 260_105)));
        assert_eq!(directory.symbol_for(12_345_609), Some("BANKNIFTY24MARFUT"));
        assert_eq!(directory.resolve_symbol("BANKNIFTY24MAR99999PE"), None);
    }

    #[test]
    fn test_future_symbol_format() {
        assert_eq!(future_symbol("BANKNIFTY", 2024, 3), "BANKNIFTY24MARFUT");
        assert_eq!(future_symbol("BANKNIFTY", 2009, 11), "BANKNIFTY09NOVFUT");
        assert_eq!(expiry_label(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()), "MAR 24");
    }

    #[test]
    fn test_future_falls_back_to_next_month() {
        let directory = InstrumentDirectory::from_csv(MASTER.as_bytes()).unwrap();
        let march = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        assert_eq!(
            directory.resolve_future("BANKNIFTY", march),
            Some(("BANKNIFTY24MARFUT".to_string(), 12_345_609))
        );

        let dir = InstrumentDirectory::from_instruments(vec![Instrument {
            instrument_token: 7,
            tradingsymbol: "BANKNIFTY25JANFUT".into(),
            name: "BANKNIFTY".into(),
            expiry: "2025-01-29".into(),
            lot_size: 15,
            instrument_type: "FUT".into(),
            exchange: "NFO".into(),
        }]);
        let december = NaiveDate::from_ymd_opt(2024, 12, 30).unwrap();
        assert_eq!(
            dir.resolve_future("BANKNIFTY", december),
            Some(("BANKNIFTY25JANFUT".to_string(), 7))
        );
    }

    #[tokio::test]
    async fn test_load_downloads_when_cache_missing_then_reuses_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Broker/instruments.csv");
        let clock = ManualClock::at(chrono::Local::now().naive_local());
        let counter = AtomicU32::new(0);
        let downloads = &counter;

        let download = move || async move {
            downloads.fetch_add(1, Ordering::SeqCst);
            Ok(MASTER.to_string())
        };
        let first = InstrumentDirectory::load(&path, &clock, 3, Duration::from_secs(1), download)
            .await
            .unwrap();
        assert_eq!(first.len(), 4);

        let download = move || async move {
            downloads.fetch_add(1, Ordering::SeqCst);
            Ok(MASTER.to_string())
        };
        InstrumentDirectory::load(&path, &clock, 3, Duration::from_secs(1), download)
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instruments.csv");
        let clock = ManualClock::parse("2024-03-04 08:00:00");

        let err = InstrumentDirectory::load(&path, &clock, 3, Duration::from_secs(1), || async {
            Err(BrokerError::InstrumentLookup("connection refused".into()))
        })
        .await
        .unwrap_err();

        assert!(err.is_fatal());
        assert!(matches!(err, BrokerError::RetriesExhausted { attempts: 3, .. }));
    }
}
