//! Wallet identity endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::{error, info};

use super::api_error;
use crate::AppState;

/// Current identity snapshot
async fn get_wallet(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.identity.snapshot())
}

/// Run the provider login flow
async fn connect(State(state): State<AppState>) -> Response {
    match state.identity.connect().await {
        Ok(eoa) => {
            info!("Wallet connected: {}", eoa);
            (StatusCode::OK, Json(state.identity.snapshot())).into_response()
        }
        Err(e) => {
            error!("Wallet connect failed: {}", e);
            api_error(&e).into_response()
        }
    }
}

/// Log out and end any session bound to the wallet
async fn disconnect(State(state): State<AppState>) -> Response {
    match state.identity.disconnect().await {
        Ok(()) => {
            // The identity watcher does the same; this makes the response
            // reflect the ended session
            state.machine.on_identity_changed();
            (StatusCode::OK, Json(state.identity.snapshot())).into_response()
        }
        Err(e) => {
            error!("Wallet disconnect failed: {}", e);
            api_error(&e).into_response()
        }
    }
}

/// Create wallet routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/wallet", get(get_wallet))
        .route("/wallet/connect", post(connect))
        .route("/wallet/disconnect", post(disconnect))
}
