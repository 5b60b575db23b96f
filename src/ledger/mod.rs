//! Append-only CSV trade ledgers.
//!
//! Two ledgers are kept:
//! - Five-EMA orders (entries and exits with their levels)
//! - Short straddle legs (entries and covers with the future price)
//!
//! The header row is written when the file is created; rows are never
//! rewritten.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Timestamp format used in every ledger row.
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Five-EMA ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaOrderRecord {
    #[serde(rename = "ORDER ID")]
    pub order_id: String,
    #[serde(rename = "DATE TIME")]
    pub date_time: String,
    #[serde(rename = "INSTRUMENT TOKEN")]
    pub instrument_token: u32,
    #[serde(rename = "ORDER TYPE")]
    pub order_type: String,
    #[serde(rename = "QUANTITY")]
    pub quantity: u32,
    #[serde(rename = "TARGET")]
    pub target: Option<Decimal>,
    #[serde(rename = "STOPLOSS")]
    pub stoploss: Option<Decimal>,
    #[serde(rename = "TRAILING SL")]
    pub trailing_sl: Option<Decimal>,
    #[serde(rename = "BANKNIFTY FUT PRICE")]
    pub future_price: Decimal,
    #[serde(rename = "PAPER TRADE")]
    pub paper_trade: bool,
}

/// Short straddle ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StraddleOrderRecord {
    #[serde(rename = "ORDER ID")]
    pub order_id: String,
    #[serde(rename = "DATE TIME")]
    pub date_time: String,
    #[serde(rename = "TRADING SYMBOL")]
    pub trading_symbol: String,
    #[serde(rename = "ORDER TYPE")]
    pub order_type: String,
    #[serde(rename = "QUANTITY")]
    pub quantity: u32,
    #[serde(rename = "BNF PRICE")]
    pub future_price: Decimal,
    #[serde(rename = "ATM PRICE")]
    pub option_price: Option<Decimal>,
}

pub fn format_date_time(at: NaiveDateTime) -> String {
    at.format(DATE_TIME_FORMAT).to_string()
}

/// CSV file that only ever grows.
#[derive(Debug)]
pub struct CsvLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CsvLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append rows, writing the header first if the file is new or empty.
    pub fn append<R: Serialize>(&self, records: &[R]) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("ledger lock poisoned"))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        let is_new = std::fs::metadata(&self.path)
            .map(|m| m.len() == 0)
            .unwrap_or(true);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open ledger {:?}", self.path))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);
        for record in records {
            writer
                .serialize(record)
                .with_context(|| format!("Failed to write ledger row to {:?}", self.path))?;
        }
        writer.flush()?;

        debug!(path = ?self.path, rows = records.len(), "Ledger rows appended");
        Ok(())
    }

    /// Read every row. A missing file is an empty ledger.
    pub fn read<R: for<'de> Deserialize<'de>>(&self) -> Result<Vec<R>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&self.path)
            .with_context(|| format!("Failed to open ledger {:?}", self.path))?;
        reader
            .deserialize()
            .collect::<std::result::Result<Vec<R>, _>>()
            .with_context(|| format!("Ledger {:?} is malformed", self.path))
    }

    /// Rows as JSON objects of raw cell text, keyed by the given column renames.
    pub fn read_json(&self, renames: &[(&str, &str)]) -> Result<Vec<serde_json::Value>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&self.path)
            .with_context(|| format!("Failed to open ledger {:?}", self.path))?;
        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| {
                renames
                    .iter()
                    .find(|(from, _)| *from == h)
                    .map(|(_, to)| to.to_string())
                    .unwrap_or_else(|| h.to_string())
            })
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.with_context(|| format!("Ledger {:?} is malformed", self.path))?;
            let row: serde_json::Map<String, serde_json::Value> = headers
                .iter()
                .cloned()
                .zip(record.iter().map(serde_json::Value::from))
                .collect();
            rows.push(serde_json::Value::Object(row));
        }
        Ok(rows)
    }
}

/// Column names used by the control panel tradebook.
pub const TRADEBOOK_KEYS: &[(&str, &str)] = &[
    ("ORDER ID", "orderID"),
    ("DATE TIME", "dateTimes"),
    ("INSTRUMENT TOKEN", "instrumentType"),
    ("ORDER TYPE", "orderType"),
    ("QUANTITY", "quantity"),
    ("TARGET", "target"),
    ("STOPLOSS", "stoploss"),
    ("TRAILING SL", "trailingSL"),
    ("BANKNIFTY FUT PRICE", "bankFutPrice"),
    ("PAPER TRADE", "paperTrade"),
];
