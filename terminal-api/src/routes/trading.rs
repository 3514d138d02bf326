//! Read-only trading endpoints backed by the session's CLOB client

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use terminal_session::ClobClient;
use tracing::error;

use super::{api_error, not_ready, ApiError};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

/// Open order response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrderResponse {
    pub id: String,
    pub market: String,
    pub asset_id: String,
    pub side: String,
    pub original_size: String,
    pub size_matched: String,
    pub price: String,
    pub status: String,
    pub created_at: String,
}

/// Trade response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeResponse {
    pub id: String,
    pub market: String,
    pub asset_id: String,
    pub side: String,
    pub size: String,
    pub price: String,
    pub status: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Client for the current session, or 409 while no session is ready
fn session_client(state: &AppState) -> Result<Arc<ClobClient>, ApiError> {
    state
        .factory
        .client(&state.machine.state())
        .ok_or_else(not_ready)
}

/// Get open orders
async fn get_open_orders(State(state): State<AppState>) -> Response {
    let client = match session_client(&state) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };

    match client.get_open_orders().await {
        Ok(orders) => {
            let response: Vec<OpenOrderResponse> = orders
                .into_iter()
                .map(|o| OpenOrderResponse {
                    id: o.id,
                    market: o.market,
                    asset_id: o.asset_id,
                    side: o.side,
                    original_size: o.original_size,
                    size_matched: o.size_matched,
                    price: o.price,
                    status: o.status,
                    created_at: o.created_at,
                })
                .collect();
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            error!("Failed to get open orders: {}", e);
            api_error(&e).into_response()
        }
    }
}

/// Get trade history
async fn get_trades(State(state): State<AppState>) -> Response {
    let client = match session_client(&state) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };

    match client.get_trades().await {
        Ok(trades) => {
            let response: Vec<TradeResponse> = trades
                .into_iter()
                .map(|t| TradeResponse {
                    id: t.id,
                    market: t.market,
                    asset_id: t.asset_id,
                    side: t.side,
                    size: t.size,
                    price: t.price,
                    status: t.status,
                    created_at: t.created_at,
                    transaction_hash: t.transaction_hash,
                })
                .collect();
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            error!("Failed to get trades: {}", e);
            api_error(&e).into_response()
        }
    }
}

/// Create trading routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/trading/orders", get(get_open_orders))
        .route("/trading/trades", get(get_trades))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use crate::routes::test_support::{app_state, call};

    #[tokio::test]
    async fn test_orders_require_session() {
        let state = app_state();
        let (status, body) = call(&state, "GET", "/api/trading/orders", None).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "Trading session not ready");
    }

    #[tokio::test]
    async fn test_trades_unavailable_after_end() {
        let state = app_state();
        call(&state, "POST", "/api/wallet/connect", None).await;
        call(&state, "POST", "/api/session/init", None).await;
        assert!(state.factory.client(&state.machine.state()).is_some());

        call(&state, "POST", "/api/session/end", None).await;
        let (status, _) = call(&state, "GET", "/api/trading/trades", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
