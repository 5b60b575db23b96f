//! Configuration management for the intraday bot.
//!
//! Three sources:
//! - `Config`: static settings from `config.toml` and `KITE__*` environment variables
//! - `Credentials`: broker login record, a JSON file that must exist at startup
//! - `StrategyParams`: Five-EMA sizing and exits, a JSON file the control panel rewrites

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Index whose future and options are traded, e.g. "BANKNIFTY"
    #[serde(default = "default_underlying")]
    pub underlying: String,
    /// Exchange-local offset from UTC in minutes (IST = 330)
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
    /// Kite endpoints and credential location
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Retry counts and polling intervals
    #[serde(default)]
    pub session: SessionConfig,
    /// Log and ledger locations
    #[serde(default)]
    pub paths: PathsConfig,
    /// Short straddle sizing
    #[serde(default)]
    pub straddle: StraddleConfig,
    /// Control panel listener
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Path to the credentials JSON file
    #[serde(default = "default_credentials_file")]
    pub credentials_file: PathBuf,
    /// Cached instrument master (refreshed daily)
    #[serde(default = "default_instruments_file")]
    pub instruments_file: PathBuf,
    /// REST API base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Web login base URL (login + two-factor)
    #[serde(default = "default_login_url")]
    pub login_url: String,
    /// Connect login URL that redirects with the request token
    #[serde(default = "default_connect_url")]
    pub connect_url: String,
    /// Ticker WebSocket URL
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Broker login attempts before giving up
    #[serde(default = "default_max_login_attempts")]
    pub max_login_attempts: u32,
    /// Instrument master download attempts
    #[serde(default = "default_max_instrument_fetch_attempts")]
    pub max_instrument_fetch_attempts: u32,
    /// Order placements tried before the process stops
    #[serde(default = "default_max_order_placement_retries")]
    pub max_order_placement_retries: u32,
    /// Status polls per placement while waiting for a terminal status
    #[serde(default = "default_max_status_polls")]
    pub max_status_polls: u32,
    /// Historical candle fetch attempts
    #[serde(default = "default_historical_fetch_max_retries")]
    pub historical_fetch_max_retries: u32,
    /// Sleep between attempts and between strategy polls, seconds
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Time allowed for the ticker to connect, seconds
    #[serde(default = "default_ticker_timeout_secs")]
    pub ticker_timeout_secs: u64,
    /// Exit monitor polling interval, seconds
    #[serde(default = "default_quote_poll_secs")]
    pub quote_poll_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory for rolling log files
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    /// Five-EMA order ledger
    #[serde(default = "default_ema_ledger")]
    pub ema_ledger: PathBuf,
    /// Short straddle order ledger
    #[serde(default = "default_straddle_ledger")]
    pub straddle_ledger: PathBuf,
    /// Five-EMA strategy parameters
    #[serde(default = "default_params_file")]
    pub params_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StraddleConfig {
    /// Contract lot size
    #[serde(default = "default_straddle_lot_size")]
    pub lot_size: u32,
    /// Lots per leg
    #[serde(default = "default_straddle_lots")]
    pub lots: u32,
    /// Rupee value of the exit band per lot; per-unit band = band_value / lot_size
    #[serde(default = "default_band_value")]
    pub band_value: Decimal,
    /// Simulate fills instead of sending orders
    #[serde(default = "default_straddle_paper")]
    pub paper_trading: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Control panel bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

// Default value functions
fn default_underlying() -> String {
    "BANKNIFTY".to_string()
}

fn default_utc_offset_minutes() -> i32 {
    330
}

fn default_credentials_file() -> PathBuf {
    PathBuf::from("Broker/credentials.json")
}

fn default_instruments_file() -> PathBuf {
    PathBuf::from("Broker/instruments.csv")
}

fn default_api_url() -> String {
    "https://api.kite.trade".to_string()
}

fn default_login_url() -> String {
    "https://kite.zerodha.com".to_string()
}

fn default_connect_url() -> String {
    "https://kite.trade/connect/login".to_string()
}

fn default_ws_url() -> String {
    "wss://ws.kite.trade".to_string()
}

fn default_max_login_attempts() -> u32 {
    5
}

fn default_max_instrument_fetch_attempts() -> u32 {
    3
}

fn default_max_order_placement_retries() -> u32 {
    5
}

fn default_max_status_polls() -> u32 {
    10
}

fn default_historical_fetch_max_retries() -> u32 {
    10
}

fn default_retry_delay_secs() -> u64 {
    1
}

fn default_ticker_timeout_secs() -> u64 {
    5
}

fn default_quote_poll_secs() -> u64 {
    3
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("Logs")
}

fn default_ema_ledger() -> PathBuf {
    PathBuf::from("Logs/order_log.csv")
}

fn default_straddle_ledger() -> PathBuf {
    PathBuf::from("short_straddle_orders.csv")
}

fn default_params_file() -> PathBuf {
    PathBuf::from("Strategy/properties.json")
}

fn default_straddle_lot_size() -> u32 {
    25
}

fn default_straddle_lots() -> u32 {
    1
}

fn default_band_value() -> Decimal {
    Decimal::new(2500, 0) // 2500 rupees per lot
}

fn default_straddle_paper() -> bool {
    true
}

fn default_bind_addr() -> String {
    "0.0.0.0:5000".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("KITE"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.underlying.is_empty(), "underlying must be set");

        anyhow::ensure!(
            self.session.max_login_attempts >= 1
                && self.session.max_order_placement_retries >= 1
                && self.session.max_instrument_fetch_attempts >= 1
                && self.session.historical_fetch_max_retries >= 1,
            "retry counts must be at least 1"
        );

        anyhow::ensure!(
            self.straddle.lot_size >= 1 && self.straddle.lots >= 1,
            "straddle lot_size and lots must be at least 1"
        );

        anyhow::ensure!(
            self.straddle.band_value > Decimal::ZERO,
            "straddle band_value must be positive"
        );

        Ok(())
    }
}

impl SessionConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn ticker_timeout(&self) -> Duration {
        Duration::from_secs(self.ticker_timeout_secs)
    }

    pub fn quote_poll(&self) -> Duration {
        Duration::from_secs(self.quote_poll_secs)
    }
}

impl StraddleConfig {
    /// Per-unit premium move that closes the straddle.
    pub fn band(&self) -> Decimal {
        self.band_value / Decimal::from(self.lot_size)
    }

    /// Units traded per leg.
    pub fn quantity(&self) -> u32 {
        self.lots * self.lot_size
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            underlying: default_underlying(),
            utc_offset_minutes: default_utc_offset_minutes(),
            broker: BrokerConfig::default(),
            session: SessionConfig::default(),
            paths: PathsConfig::default(),
            straddle: StraddleConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            credentials_file: default_credentials_file(),
            instruments_file: default_instruments_file(),
            api_url: default_api_url(),
            login_url: default_login_url(),
            connect_url: default_connect_url(),
            ws_url: default_ws_url(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_login_attempts: default_max_login_attempts(),
            max_instrument_fetch_attempts: default_max_instrument_fetch_attempts(),
            max_order_placement_retries: default_max_order_placement_retries(),
            max_status_polls: default_max_status_polls(),
            historical_fetch_max_retries: default_historical_fetch_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            ticker_timeout_secs: default_ticker_timeout_secs(),
            quote_poll_secs: default_quote_poll_secs(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            logs_dir: default_logs_dir(),
            ema_ledger: default_ema_ledger(),
            straddle_ledger: default_straddle_ledger(),
            params_file: default_params_file(),
        }
    }
}

impl Default for StraddleConfig {
    fn default() -> Self {
        Self {
            lot_size: default_straddle_lot_size(),
            lots: default_straddle_lots(),
            band_value: default_band_value(),
            paper_trading: default_straddle_paper(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Broker login record.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub user_id: String,
    pub password: String,
    pub api_key: String,
    pub api_secret: String,
    /// Base32 TOTP seed
    pub totp_code: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Read credentials; a missing or malformed file is fatal for the caller.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Broker credentials file not found at {:?}", path))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Broker credentials file {:?} is malformed", path))
    }
}

/// Five-EMA sizing and exit parameters, in underlying points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyParams {
    pub target: Decimal,
    pub trailing_stoploss: Decimal,
    pub quantity: u32,
    pub lot_size: u32,
    pub stoploss: Decimal,
    #[serde(deserialize_with = "bool_or_flag")]
    pub paper_trading: bool,
}

impl StrategyParams {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Strategy parameters file not found at {:?}", path))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Strategy parameters file {:?} is malformed", path))
    }

    /// Overwrite the parameter file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let body = serde_json::to_string_pretty(self)?;
        std::fs::write(path, body).with_context(|| format!("Failed to write {:?}", path))
    }

    /// Total units per order.
    pub fn order_quantity(&self) -> u32 {
        self.lot_size * self.quantity
    }
}

/// Accept `true`/`false` as well as the `1`/`0` flags the control panel sends.
pub(crate) fn bool_or_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Int(i) => Ok(i == 1),
        Flag::Text(s) => Ok(matches!(s.trim(), "1" | "true" | "TRUE" | "True")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_straddle_band_per_unit() {
        let straddle = StraddleConfig::default();
        assert_eq!(straddle.band(), dec!(100));
        assert_eq!(straddle.quantity(), 25);
    }

    #[test]
    fn test_params_accept_integer_paper_flag() {
        let raw = r#"{"target": 60, "trailing_stoploss": 20, "quantity": 2,
                      "lot_size": 25, "stoploss": 30, "paper_trading": 1}"#;
        let params: StrategyParams = serde_json::from_str(raw).unwrap();
        assert!(params.paper_trading);
        assert_eq!(params.order_quantity(), 50);
        assert_eq!(params.stoploss, dec!(30));
    }

    #[test]
    fn test_params_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Strategy/properties.json");
        let params = StrategyParams {
            target: dec!(60),
            trailing_stoploss: dec!(20),
            quantity: 1,
            lot_size: 25,
            stoploss: dec!(30),
            paper_trading: false,
        };
        params.save(&path).unwrap();
        assert_eq!(StrategyParams::load(&path).unwrap(), params);
    }

    #[test]
    fn test_missing_credentials_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Credentials::load(&dir.path().join("credentials.json")).unwrap_err();
        assert!(err.to_string().contains("credentials file not found"));
    }

    #[test]
    fn test_credentials_debug_hides_secrets() {
        let creds = Credentials {
            user_id: "AB1234".into(),
            password: "hunter2".into(),
            api_key: "key".into(),
            api_secret: "secret".into(),
            totp_code: "SEED".into(),
        };
        let shown = format!("{:?}", creds);
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("secret"));
    }
}
