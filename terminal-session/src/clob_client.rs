//! Authenticated CLOB API client bound to one trading session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy::primitives::Address;
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tracing::debug;
use uuid::Uuid;

use crate::auth::{header_value, HEADER_ADDRESS, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use crate::eip712::current_timestamp;
use crate::relay::RelayClient;
use crate::session::TradingSession;
use crate::types::{OpenOrder, Result, TradingError, UserTrade};

const HEADER_API_KEY: &str = "POLY_API_KEY";
const HEADER_PASSPHRASE: &str = "POLY_PASSPHRASE";

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 of `message` under a base64url secret, encoded URL-safe with padding
pub(crate) fn hmac_signature(secret: &str, message: &str) -> Result<String> {
    use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
    use base64::Engine;

    // Secrets arrive with and without padding
    let secret_bytes = URL_SAFE_NO_PAD
        .decode(secret)
        .or_else(|_| URL_SAFE.decode(secret))
        .or_else(|_| {
            let padded = match secret.len() % 4 {
                2 => format!("{}==", secret),
                3 => format!("{}=", secret),
                _ => secret.to_string(),
            };
            URL_SAFE.decode(padded)
        })
        .map_err(|e| TradingError::Signing(format!("Invalid secret encoding: {}", e)))?;

    let mut mac = HmacSha256::new_from_slice(&secret_bytes)
        .map_err(|e| TradingError::Signing(format!("Failed to create HMAC: {}", e)))?;
    mac.update(message.as_bytes());

    // Polymarket requires padding (= suffix)
    Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
}

// ============================================================================
// CLOB Client
// ============================================================================

/// Trading client for one session; stops working once the session ends
pub struct ClobClient {
    session: Arc<TradingSession>,
    relay: Arc<RelayClient>,
    http_client: reqwest::Client,
    base_url: String,
    invalidated: AtomicBool,
}

impl ClobClient {
    pub fn new(
        base_url: impl Into<String>,
        session: Arc<TradingSession>,
        relay: Arc<RelayClient>,
    ) -> Self {
        // Build HTTP client with proper headers to avoid Cloudflare blocks
        let http_client = reqwest::Client::builder()
            .user_agent("polymarket-terminal/1.0")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            session,
            relay,
            http_client,
            base_url: base_url.into(),
            invalidated: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session.id()
    }

    pub fn eoa(&self) -> Address {
        self.session.eoa()
    }

    pub fn safe(&self) -> Address {
        self.session.safe()
    }

    /// Relay handle of the same session
    pub fn relay(&self) -> Result<Arc<RelayClient>> {
        self.ensure_live()?;
        Ok(self.relay.clone())
    }

    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !self.invalidated.load(Ordering::SeqCst) && !self.session.is_revoked()
    }

    fn ensure_live(&self) -> Result<()> {
        if !self.is_live() {
            return Err(TradingError::HandleInvalidated(format!(
                "trading client for session {} is no longer valid",
                self.session.id()
            )));
        }
        Ok(())
    }

    // ========================================================================
    // L2 Authentication (HMAC signing for trading operations)
    // ========================================================================

    /// Build L2 authentication headers
    fn build_l2_headers(&self, method: &str, path: &str, body: &str) -> Result<HeaderMap> {
        let credentials = self.session.credentials();
        let timestamp = current_timestamp().to_string();

        debug!("L2 auth: {} {} (body {} chars)", method, path, body.len());

        let message = format!("{}{}{}{}", timestamp, method, path, body);
        let signature = hmac_signature(&credentials.secret, &message)?;

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_ADDRESS, header_value(&self.eoa().to_checksum(None))?);
        headers.insert(HEADER_SIGNATURE, header_value(&signature)?);
        headers.insert(HEADER_TIMESTAMP, header_value(&timestamp)?);
        headers.insert(HEADER_API_KEY, header_value(&credentials.api_key)?);
        headers.insert(HEADER_PASSPHRASE, header_value(&credentials.passphrase)?);
        Ok(headers)
    }

    /// Authenticated GET of a paginated `{"data": [...]}` endpoint
    async fn get_paginated<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<Vec<T>> {
        self.ensure_live()?;
        let headers = self.build_l2_headers("GET", path, "")?;

        let url = format!("{}{}", self.base_url, path);
        let response = self.http_client.get(&url).headers(headers).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TradingError::Api(format!(
                "Failed to get {}: {} - {}",
                what, status, body
            )));
        }

        // API returns paginated response: {"data": [...], "next_cursor": "...", ...}
        #[derive(serde::Deserialize)]
        struct PaginatedResponse<T> {
            data: Vec<T>,
        }
        let response: PaginatedResponse<T> = response.json().await?;

        // The session may have ended while the request was in flight
        self.ensure_live()?;
        Ok(response.data)
    }

    /// Get open orders
    pub async fn get_open_orders(&self) -> Result<Vec<OpenOrder>> {
        debug!("Fetching open orders");
        self.get_paginated("/data/orders", "orders").await
    }

    /// Get user's trades
    pub async fn get_trades(&self) -> Result<Vec<UserTrade>> {
        debug!("Fetching trades");
        self.get_paginated("/data/trades", "trades").await
    }
}

impl std::fmt::Debug for ClobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClobClient")
            .field("session", &self.session.id())
            .field("base_url", &self.base_url)
            .field("live", &self.is_live())
            .finish()
    }
}
