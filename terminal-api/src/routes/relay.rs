//! Gasless Safe transaction submission

use alloy::primitives::{Address, Bytes};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use std::str::FromStr;
use terminal_session::{MetaTransaction, OperationType};
use tracing::{error, info};

use super::{api_error, not_ready, ErrorResponse};
use crate::AppState;

/// Request to execute a call through the session's Safe
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRelayRequest {
    /// Target contract
    pub to: String,
    /// Hex-encoded calldata
    pub data: String,
    /// "call" (default) or "delegatecall"
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub metadata: Option<String>,
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::message(message))).into_response()
}

impl SubmitRelayRequest {
    fn into_transaction(self) -> Result<MetaTransaction, String> {
        let to = Address::from_str(&self.to).map_err(|e| format!("Invalid target address: {}", e))?;
        let data = Bytes::from_str(&self.data).map_err(|e| format!("Invalid calldata: {}", e))?;
        let operation = match self.operation.as_deref().map(str::to_lowercase).as_deref() {
            None | Some("call") => OperationType::Call,
            Some("delegatecall") => OperationType::DelegateCall,
            Some(other) => return Err(format!("Invalid operation: {}", other)),
        };

        Ok(MetaTransaction {
            to,
            data,
            operation,
            metadata: self.metadata,
        })
    }
}

/// Sign and submit a Safe transaction
async fn submit(State(state): State<AppState>, Json(req): Json<SubmitRelayRequest>) -> Response {
    let relay = match state.machine.state().ready() {
        Some(ready) => ready.relay.clone(),
        None => return not_ready().into_response(),
    };

    let tx = match req.into_transaction() {
        Ok(tx) => tx,
        Err(message) => return bad_request(message),
    };

    match relay.submit(tx).await {
        Ok(receipt) => {
            info!("Relay accepted transaction {}", receipt.transaction_id);
            (StatusCode::OK, Json(receipt)).into_response()
        }
        Err(e) => {
            error!("Relay submission failed: {}", e);
            api_error(&e).into_response()
        }
    }
}

/// Create relay routes
pub fn routes() -> Router<AppState> {
    Router::new().route("/relay/submit", post(submit))
}
