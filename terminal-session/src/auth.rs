//! Credential exchange with the trading backend
//!
//! The machine only knows the shape of the exchange: build a challenge, have
//! the wallet sign its hash, trade the signature for credentials. The message
//! format and credential schema live behind [`CredentialExchange`].

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::{debug, info, warn};

use crate::eip712::{clob_auth_signing_hash, current_timestamp};
use crate::types::{ApiCredentials, ApiKeyResponse, Result, TradingError};

// Header names
pub(crate) const HEADER_ADDRESS: &str = "POLY_ADDRESS";
pub(crate) const HEADER_SIGNATURE: &str = "POLY_SIGNATURE";
pub(crate) const HEADER_TIMESTAMP: &str = "POLY_TIMESTAMP";
const HEADER_NONCE: &str = "POLY_NONCE";

/// Canonical message to be signed by the EOA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub eoa: Address,
    pub safe: Address,
    pub timestamp: u64,
    pub nonce: u64,
    /// Digest the wallet signs
    pub signing_hash: B256,
}

/// Challenge plus the wallet's signature over it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedChallenge {
    pub challenge: AuthChallenge,
    /// 0x-prefixed 65-byte signature
    pub signature: String,
}

/// Pluggable trading-backend authentication contract
#[async_trait]
pub trait CredentialExchange: Send + Sync {
    /// Build the message for (eoa, safe)
    fn challenge(&self, eoa: Address, safe: Address) -> AuthChallenge;

    /// Trade a signed challenge for API credentials
    async fn exchange(&self, signed: &SignedChallenge) -> Result<ApiCredentials>;
}

// ============================================================================
// CLOB L1 Auth
// ============================================================================

/// Polymarket CLOB L1 authentication (EIP-712 `ClobAuth`)
#[derive(Debug, Clone)]
pub struct ClobAuthExchange {
    http_client: reqwest::Client,
    base_url: String,
    chain_id: u64,
    /// Key nonce; the same nonce derives the same API key
    key_nonce: u64,
}

impl ClobAuthExchange {
    pub fn new(base_url: impl Into<String>, chain_id: u64) -> Self {
        let http_client = reqwest::Client::builder()
            .user_agent("polymarket-terminal/1.0")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http_client,
            base_url: base_url.into(),
            chain_id,
            key_nonce: 0,
        }
    }

    pub fn with_key_nonce(mut self, key_nonce: u64) -> Self {
        self.key_nonce = key_nonce;
        self
    }

    /// Build L1 authentication headers
    fn build_l1_headers(&self, signed: &SignedChallenge) -> Result<HeaderMap> {
        let challenge = &signed.challenge;

        debug!("Building L1 auth headers:");
        debug!("  Address: {}", challenge.eoa);
        debug!("  Timestamp: {}", challenge.timestamp);
        debug!("  Nonce: {}", challenge.nonce);

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_ADDRESS, header_value(&challenge.eoa.to_checksum(None))?);
        headers.insert(HEADER_SIGNATURE, header_value(&signed.signature)?);
        headers.insert(HEADER_TIMESTAMP, header_value(&challenge.timestamp.to_string())?);
        headers.insert(HEADER_NONCE, header_value(&challenge.nonce.to_string())?);
        Ok(headers)
    }

    /// Create new API credentials (L1 auth)
    async fn create_api_key(&self, signed: &SignedChallenge) -> Result<ApiCredentials> {
        info!("Creating new API key for wallet {}", signed.challenge.eoa);

        let headers = self.build_l1_headers(signed)?;
        let url = format!("{}/auth/api-key", self.base_url);

        let response = self.http_client.post(&url).headers(headers).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Failed to create API key: {} - {}", status, body);
            return Err(TradingError::credential_exchange(
                Some(status.as_u16()),
                format!("Failed to create API key: {}", body),
            ));
        }

        let api_key_response: ApiKeyResponse = response.json().await?;
        info!("API key created successfully");
        Ok(api_key_response.into())
    }

    /// Derive existing API credentials (L1 auth), creating them if none exist
    async fn derive_api_key(&self, signed: &SignedChallenge) -> Result<ApiCredentials> {
        info!("Deriving API key for wallet {}", signed.challenge.eoa);

        let headers = self.build_l1_headers(signed)?;
        let url = format!("{}/auth/derive-api-key", self.base_url);

        let response = self.http_client.get(&url).headers(headers).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Failed to derive API key: {} - {}", status, body);

            // Polymarket returns different errors: 404, "not found", or "Could not derive"
            if status == 404 || body.contains("not found") || body.contains("Could not derive") {
                info!("No existing API key found, creating new one");
                return self.create_api_key(signed).await;
            }

            return Err(TradingError::credential_exchange(
                Some(status.as_u16()),
                format!("Failed to derive API key: {}", body),
            ));
        }

        let api_key_response: ApiKeyResponse = response.json().await?;
        info!("API key derived successfully");
        Ok(api_key_response.into())
    }
}

#[async_trait]
impl CredentialExchange for ClobAuthExchange {
    fn challenge(&self, eoa: Address, safe: Address) -> AuthChallenge {
        let timestamp = current_timestamp();
        AuthChallenge {
            eoa,
            safe,
            timestamp,
            nonce: self.key_nonce,
            signing_hash: clob_auth_signing_hash(self.chain_id, eoa, timestamp, self.key_nonce),
        }
    }

    async fn exchange(&self, signed: &SignedChallenge) -> Result<ApiCredentials> {
        self.derive_api_key(signed).await
    }
}

pub(crate) fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| TradingError::Api(format!("Invalid header value: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const EOA: Address = address!("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
    const SAFE: Address = address!("0xd93B25cb943D14d0d34FBaF01Fc93a0f8b5F6E47");

    fn signed(exchange: &ClobAuthExchange) -> SignedChallenge {
        SignedChallenge {
            challenge: exchange.challenge(EOA, SAFE),
            signature: format!("0x{}", "11".repeat(65)),
        }
    }

    fn api_key_body() -> serde_json::Value {
        serde_json::json!({
            "apiKey": "00000000-0000-0000-0000-000000000001",
            "secret": "c2VjcmV0LXNlY3JldC1zZWNyZXQtc2VjcmV0LXM=",
            "passphrase": "pass"
        })
    }

    #[test]
    fn test_challenge_binds_eoa_and_nonce() {
        let exchange = ClobAuthExchange::new("http://localhost", 137).with_key_nonce(7);
        let challenge = exchange.challenge(EOA, SAFE);
        assert_eq!(challenge.eoa, EOA);
        assert_eq!(challenge.safe, SAFE);
        assert_eq!(challenge.nonce, 7);
        assert_eq!(
            challenge.signing_hash,
            clob_auth_signing_hash(137, EOA, challenge.timestamp, 7)
        );
    }

    #[tokio::test]
    async fn test_derive_existing_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/derive-api-key"))
            .and(header("POLY_ADDRESS", "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"))
            .and(header_exists("POLY_SIGNATURE"))
            .and(header_exists("POLY_TIMESTAMP"))
            .and(header("POLY_NONCE", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(api_key_body()))
            .expect(1)
            .mount(&server)
            .await;

        let exchange = ClobAuthExchange::new(server.uri(), 137);
        let credentials = exchange.exchange(&signed(&exchange)).await.unwrap();
        assert_eq!(credentials.api_key, "00000000-0000-0000-0000-000000000001");
        assert_eq!(credentials.passphrase, "pass");
    }

    #[tokio::test]
    async fn test_falls_back_to_create() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/derive-api-key"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/api-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(api_key_body()))
            .expect(1)
            .mount(&server)
            .await;

        let exchange = ClobAuthExchange::new(server.uri(), 137);
        let credentials = exchange.exchange(&signed(&exchange)).await.unwrap();
        assert_eq!(credentials.passphrase, "pass");
    }

    #[tokio::test]
    async fn test_unauthorized_is_credential_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/derive-api-key"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Invalid L1 Request headers"))
            .mount(&server)
            .await;

        let exchange = ClobAuthExchange::new(server.uri(), 137);
        let err = exchange.exchange(&signed(&exchange)).await.unwrap_err();
        match err {
            TradingError::CredentialExchangeFailed { status, message } => {
                assert_eq!(status, Some(401));
                assert!(message.contains("Invalid L1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
