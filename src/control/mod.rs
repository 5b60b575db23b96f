//! HTTP control panel.
//!
//! Plain-text and JSON endpoints used by the dashboard to edit the Five-EMA
//! parameters, switch the strategy on and off, and read positions and the
//! trade book.

mod handlers;

use crate::ledger::CsvLedger;
use crate::session::SessionSlot;
use crate::strategy::{StraddleBook, TrendFollowController};
use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state behind every handler.
pub struct AppState {
    pub slot: Arc<SessionSlot>,
    pub trend: Arc<TrendFollowController>,
    pub straddle: Arc<StraddleBook>,
    pub ema_ledger: Arc<CsvLedger>,
    pub params_file: PathBuf,
    pub underlying: String,
}

pub struct ControlServer {
    state: Arc<AppState>,
}

impl ControlServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/", get(handlers::server_status))
            .route("/change_params", post(handlers::change_params))
            .route("/make_bot_active", post(handlers::make_bot_active))
            .route("/get_bot_status", get(handlers::bot_status))
            .route("/fetch_attributes", get(handlers::fetch_attributes))
            .route("/positions", get(handlers::positions))
            .route("/tradebook", get(handlers::tradebook))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve(
        self,
        addr: &str,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(target: "control", "Control panel listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
