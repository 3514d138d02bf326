//! Shared types for the trading session

use std::time::Duration;

use serde::{Deserialize, Serialize};
use terminal_core::{SessionErrorInfo, SessionErrorKind};

// ============================================================================
// Endpoints & Contract Addresses (Polygon Mainnet)
// ============================================================================

/// Polymarket CLOB API
pub const CLOB_BASE_URL: &str = "https://clob.polymarket.com";

/// Polymarket builder relayer (gasless Safe transactions)
pub const RELAY_BASE_URL: &str = "https://relayer-v2.polymarket.com";

/// Polygon RPC endpoint
pub const POLYGON_RPC_URL: &str = "https://polygon-rpc.com";

/// Polygon Chain ID
pub const POLYGON_CHAIN_ID: u64 = 137;

// ============================================================================
// API Credentials
// ============================================================================

/// API credentials for L2 (HMAC) authentication
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

/// Builder credentials for relayer authentication
#[derive(Clone, Serialize, Deserialize)]
pub struct BuilderCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl std::fmt::Debug for BuilderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderCredentials")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// API Request/Response Types
// ============================================================================

/// Response from API key creation or derivation
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyResponse {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl From<ApiKeyResponse> for ApiCredentials {
    fn from(response: ApiKeyResponse) -> Self {
        Self {
            api_key: response.api_key,
            secret: response.secret,
            passphrase: response.passphrase,
        }
    }
}

/// Open order from API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub id: String,
    pub market: String,
    pub asset_id: String,
    pub side: String,
    pub original_size: String,
    pub size_matched: String,
    pub price: String,
    pub status: String,
    pub created_at: String,
    #[serde(default)]
    pub expiration: Option<String>,
    #[serde(default)]
    pub order_type: Option<String>,
}

/// Trade from API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTrade {
    pub id: String,
    pub market: String,
    pub asset_id: String,
    pub side: String,
    pub size: String,
    pub price: String,
    pub status: String,
    pub created_at: String,
    #[serde(default)]
    pub match_time: Option<String>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Trading session errors
#[derive(Debug, thiserror::Error)]
pub enum TradingError {
    #[error("No authenticated wallet identity")]
    IdentityMissing,

    #[error("User cancelled: {0}")]
    UserCancelled(String),

    #[error("Safe deployment status unavailable: {0}")]
    DerivationUnavailable(String),

    #[error("Credential exchange failed (status {status:?}): {message}")]
    CredentialExchangeFailed { status: Option<u16>, message: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Relay submission failed: {0}")]
    RelaySubmissionFailed(String),

    #[error("Handle invalidated: {0}")]
    HandleInvalidated(String),

    #[error("Superseded: session generation moved from {expected} to {actual}")]
    Superseded { expected: u64, actual: u64 },

    /// Outcome of a concurrent initialization this call waited on
    #[error("{0}")]
    JoinedAttempt(SessionErrorInfo),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TradingError {
    pub fn credential_exchange(status: Option<u16>, message: impl Into<String>) -> Self {
        TradingError::CredentialExchangeFailed {
            status,
            message: message.into(),
        }
    }

    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        TradingError::Timeout { operation, after }
    }

    /// Classification exposed to session consumers
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            TradingError::IdentityMissing => SessionErrorKind::IdentityMissing,
            TradingError::UserCancelled(_) => SessionErrorKind::UserCancelled,
            TradingError::DerivationUnavailable(_) => SessionErrorKind::DerivationUnavailable,
            TradingError::CredentialExchangeFailed { .. } => {
                SessionErrorKind::CredentialExchangeFailed
            }
            TradingError::Timeout { .. } => SessionErrorKind::Timeout,
            TradingError::RelaySubmissionFailed(_) => SessionErrorKind::RelaySubmissionFailed,
            TradingError::HandleInvalidated(_) => SessionErrorKind::HandleInvalidated,
            TradingError::Superseded { .. } => SessionErrorKind::Superseded,
            TradingError::JoinedAttempt(info) => info.kind,
            TradingError::Wallet(_) | TradingError::Signing(_) => SessionErrorKind::Wallet,
            TradingError::Config(_) => SessionErrorKind::Configuration,
            TradingError::Api(_) | TradingError::Http(_) | TradingError::Json(_) => {
                SessionErrorKind::Transport
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Structured form recorded on the session snapshot
    pub fn to_info(&self) -> SessionErrorInfo {
        match self {
            TradingError::JoinedAttempt(info) => info.clone(),
            other => SessionErrorInfo::new(other.kind(), other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TradingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            TradingError::UserCancelled("rejected".into()).kind(),
            SessionErrorKind::UserCancelled
        );
        assert_eq!(
            TradingError::credential_exchange(Some(401), "Unauthorized").kind(),
            SessionErrorKind::CredentialExchangeFailed
        );
        assert_eq!(
            TradingError::Signing("bad key".into()).kind(),
            SessionErrorKind::Wallet
        );

        let info = TradingError::timeout("credential exchange", Duration::from_secs(30)).to_info();
        assert_eq!(info.kind, SessionErrorKind::Timeout);
        assert!(info.retryable);
        assert!(info.message.contains("credential exchange"));
    }

    #[test]
    fn test_joined_attempt_keeps_original_info() {
        let original = SessionErrorInfo::new(SessionErrorKind::UserCancelled, "rejected");
        let err = TradingError::JoinedAttempt(original.clone());
        assert_eq!(err.kind(), SessionErrorKind::UserCancelled);
        assert_eq!(err.to_info(), original);
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = ApiCredentials {
            api_key: "key".into(),
            secret: "super-secret".into(),
            passphrase: "hunter2".into(),
        };
        let debug = format!("{:?}", creds);
        assert!(debug.contains("key"));
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("hunter2"));
    }
}
