//! Health check endpoints

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde::Serialize;
use terminal_core::SessionStep;

use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    wallet_connected: bool,
    session_step: SessionStep,
}

/// Health check handler
///
/// A failed session initialization reports `degraded`; everything else is
/// a normal lifecycle position.
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let snapshot = state.machine.snapshot();
    let status = if snapshot.current_step == SessionStep::Failed {
        "degraded"
    } else {
        "healthy"
    };

    let response = HealthResponse {
        status: status.to_string(),
        wallet_connected: state.identity.is_connected(),
        session_step: snapshot.current_step,
    };

    (StatusCode::OK, Json(response))
}

/// Simple liveness check (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

/// Create health routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/live", get(liveness))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use crate::routes::test_support::{app_state, call};

    #[tokio::test]
    async fn test_health_reports_idle_session() {
        let state = app_state();
        let (status, body) = call(&state, "GET", "/api/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["walletConnected"], false);
        assert_eq!(body["sessionStep"], "not_started");
    }
}
