use super::AppState;
use crate::config::{bool_or_flag, StrategyParams};
use crate::ledger::TRADEBOOK_KEYS;
use crate::session::{expiry_label, PositionView};
use axum::{extract::State, http::StatusCode, Json};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

type HandlerError = (StatusCode, String);

fn internal(e: anyhow::Error) -> HandlerError {
    error!(target: "control", error = %e, "Request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[derive(Debug, Deserialize)]
pub struct ParamsUpdate {
    #[serde(rename = "TARGET")]
    pub target: Decimal,
    #[serde(rename = "TRAILING_STOPLOSS")]
    pub trailing_stoploss: Decimal,
    #[serde(rename = "QUANTITY")]
    pub quantity: u32,
    #[serde(rename = "LOT_SIZE")]
    pub lot_size: u32,
    #[serde(rename = "STOPLOSS")]
    pub stoploss: Decimal,
    #[serde(rename = "PAPER_TRADING", deserialize_with = "bool_or_flag")]
    pub paper_trading: bool,
}

impl From<ParamsUpdate> for StrategyParams {
    fn from(update: ParamsUpdate) -> Self {
        Self {
            target: update.target,
            trailing_stoploss: update.trailing_stoploss,
            quantity: update.quantity,
            lot_size: update.lot_size,
            stoploss: update.stoploss,
            paper_trading: update.paper_trading,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    #[serde(rename = "STATUS")]
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct Attributes {
    #[serde(rename = "FUTURE")]
    pub future: Vec<String>,
    #[serde(rename = "EXPIRY")]
    pub expiry: Vec<String>,
    #[serde(rename = "CANDLE_TIME")]
    pub candle_time: Vec<String>,
    #[serde(rename = "BUY_OR_SELL")]
    pub buy_or_sell: Vec<String>,
    #[serde(rename = "STRATEGY")]
    pub strategy: Vec<String>,
}

pub async fn server_status() -> &'static str {
    "SERVER RUNNING"
}

/// Overwrite the Five-EMA parameter file. Takes effect on the next start.
pub async fn change_params(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ParamsUpdate>,
) -> Result<&'static str, HandlerError> {
    let params = StrategyParams::from(update);
    params.save(&state.params_file).map_err(internal)?;
    info!(target: "control", ?params, "Strategy parameters updated");
    Ok("PARAMS UPDATED")
}

pub async fn make_bot_active(
    State(state): State<Arc<AppState>>,
    Json(update): Json<StatusUpdate>,
) -> Result<&'static str, HandlerError> {
    if update.status == "ACTIVE" {
        state.trend.start().await.map_err(internal)?;
    } else {
        state.trend.stop().await;
    }
    Ok("BOT STATUS UPDATED")
}

pub async fn bot_status(State(state): State<Arc<AppState>>) -> &'static str {
    if state.trend.is_running().await {
        "1"
    } else {
        "0"
    }
}

pub async fn fetch_attributes(State(state): State<Arc<AppState>>) -> Json<Attributes> {
    let session = state.slot.current().await;
    let expiry = session
        .directory()
        .get(session.future_symbol())
        .and_then(|i| NaiveDate::parse_from_str(&i.expiry, "%Y-%m-%d").ok())
        .unwrap_or_else(|| session.created_on());

    Json(Attributes {
        future: vec![format!("{} FUT", state.underlying)],
        expiry: vec![expiry_label(expiry)],
        candle_time: vec!["5 MINUTE".to_string()],
        buy_or_sell: vec!["BUY".to_string()],
        strategy: vec!["Five EMA".to_string()],
    })
}

/// Open positions of both strategies.
pub async fn positions(State(state): State<Arc<AppState>>) -> Json<Vec<PositionView>> {
    let session = state.slot.current().await;
    let mut views = session.positions().await;
    views.extend(state.straddle.positions(session.future_quote().await).await);
    Json(views)
}

pub async fn tradebook(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<serde_json::Value>>, HandlerError> {
    state
        .ema_ledger
        .read_json(TRADEBOOK_KEYS)
        .map(Json)
        .map_err(internal)
}
