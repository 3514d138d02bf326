//! Trading session lifecycle endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use terminal_core::DeploymentStatus;
use tracing::{info, warn};

use super::api_error;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentResponse {
    safe_address: Option<String>,
    deployment: DeploymentStatus,
}

/// Current session snapshot
async fn get_session(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.machine.snapshot())
}

/// Run (or join, or resume) session initialization
async fn init_session(State(state): State<AppState>) -> Response {
    match state.machine.initialize_trading_session().await {
        Ok(ready) => {
            info!(session = %ready.session.id(), "Session ready");
            (StatusCode::OK, Json(state.machine.snapshot())).into_response()
        }
        Err(e) => {
            warn!("Session initialization failed: {}", e);
            api_error(&e).into_response()
        }
    }
}

/// End the session; always succeeds
async fn end_session(State(state): State<AppState>) -> impl IntoResponse {
    state.machine.end_trading_session();
    state.factory.reset();
    Json(state.machine.snapshot())
}

/// Re-run the Safe deployment check
async fn recheck_deployment(State(state): State<AppState>) -> Response {
    match state.machine.recheck_deployment().await {
        Ok(deployment) => {
            let response = DeploymentResponse {
                safe_address: state.machine.snapshot().safe_address,
                deployment,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => api_error(&e).into_response(),
    }
}

/// Create session routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/session", get(get_session))
        .route("/session/init", post(init_session))
        .route("/session/end", post(end_session))
        .route("/session/deployment/recheck", post(recheck_deployment))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use crate::routes::test_support::{app_state, call};

    #[tokio::test]
    async fn test_init_without_wallet_is_unauthorized() {
        let state = app_state();
        let (status, body) = call(&state, "POST", "/api/session/init", None).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["kind"], "identity_missing");
        assert_eq!(body["retryable"], true);
    }

    #[tokio::test]
    async fn test_init_and_end() {
        let state = app_state();
        call(&state, "POST", "/api/wallet/connect", None).await;

        let (status, body) = call(&state, "POST", "/api/session/init", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["currentStep"], "complete");
        assert_eq!(body["isTradingSessionComplete"], true);
        assert!(body["safeAddress"].is_string());

        let (status, body) = call(&state, "POST", "/api/session/end", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["currentStep"], "not_started");
        assert!(body["sessionId"].is_null());
    }

    #[tokio::test]
    async fn test_recheck_before_derivation() {
        let state = app_state();
        let (status, body) = call(&state, "POST", "/api/session/deployment/recheck", None).await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "derivation_unavailable");
    }

    #[tokio::test]
    async fn test_recheck_after_init() {
        let state = app_state();
        call(&state, "POST", "/api/wallet/connect", None).await;
        call(&state, "POST", "/api/session/init", None).await;

        let (status, body) = call(&state, "POST", "/api/session/deployment/recheck", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deployment"], "deployed");
    }
}
