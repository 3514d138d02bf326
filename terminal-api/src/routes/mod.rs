//! API route definitions

mod health;
mod relay;
mod session;
mod trading;
mod wallet;

use axum::{http::StatusCode, Json, Router};
use serde::Serialize;
use terminal_core::SessionErrorKind;
use terminal_session::TradingError;

use crate::AppState;

/// Create all API routes
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(wallet::routes())
        .merge(session::routes())
        .merge(trading::routes())
        .merge(relay::routes())
}

// ============================================================================
// Errors
// ============================================================================

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<SessionErrorKind>,
    pub retryable: bool,
}

impl ErrorResponse {
    pub fn message(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            kind: None,
            retryable: false,
        }
    }
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

fn status_for(kind: SessionErrorKind) -> StatusCode {
    match kind {
        SessionErrorKind::IdentityMissing => StatusCode::UNAUTHORIZED,
        SessionErrorKind::UserCancelled => StatusCode::FORBIDDEN,
        SessionErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        SessionErrorKind::DerivationUnavailable
        | SessionErrorKind::CredentialExchangeFailed
        | SessionErrorKind::RelaySubmissionFailed
        | SessionErrorKind::Transport => StatusCode::BAD_GATEWAY,
        SessionErrorKind::HandleInvalidated | SessionErrorKind::Superseded => StatusCode::CONFLICT,
        SessionErrorKind::Wallet | SessionErrorKind::Configuration => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Map a session error to a status code and JSON body
pub fn api_error(err: &TradingError) -> ApiError {
    let info = err.to_info();
    (
        status_for(info.kind),
        Json(ErrorResponse {
            error: info.message,
            kind: Some(info.kind),
            retryable: info.retryable,
        }),
    )
}

pub fn not_ready() -> ApiError {
    (
        StatusCode::CONFLICT,
        Json(ErrorResponse::message("Trading session not ready")),
    )
}
