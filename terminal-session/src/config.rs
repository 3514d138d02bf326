//! Session configuration loaded from the environment

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::types::{
    BuilderCredentials, Result, TradingError, CLOB_BASE_URL, POLYGON_CHAIN_ID, POLYGON_RPC_URL,
    RELAY_BASE_URL,
};

/// Endpoints, bounds and retry policy for the session pipeline
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub clob_base_url: String,
    pub relay_base_url: String,
    pub rpc_url: String,
    pub chain_id: u64,
    /// Upper bound on a wallet signature prompt
    pub signature_timeout: Duration,
    /// Upper bound on the credential exchange call
    pub credential_timeout: Duration,
    /// Upper bound on a single deployment-check RPC call
    pub deployment_check_timeout: Duration,
    /// Upper bound on a relay nonce fetch or submission
    pub relay_timeout: Duration,
    pub deployment_retry_attempts: u32,
    /// Initial backoff, doubled after every failed attempt
    pub deployment_retry_backoff: Duration,
    pub builder_credentials: Option<BuilderCredentials>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            clob_base_url: CLOB_BASE_URL.to_string(),
            relay_base_url: RELAY_BASE_URL.to_string(),
            rpc_url: POLYGON_RPC_URL.to_string(),
            chain_id: POLYGON_CHAIN_ID,
            signature_timeout: Duration::from_secs(120),
            credential_timeout: Duration::from_secs(30),
            deployment_check_timeout: Duration::from_secs(10),
            relay_timeout: Duration::from_secs(30),
            deployment_retry_attempts: 3,
            deployment_retry_backoff: Duration::from_millis(500),
            builder_credentials: None,
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables, falling back to defaults
    ///
    /// Recognized:
    /// - CLOB_BASE_URL, RELAY_BASE_URL, POLYGON_RPC_URL, CHAIN_ID
    /// - SIGNATURE_TIMEOUT_SECS, CREDENTIAL_TIMEOUT_SECS,
    ///   DEPLOYMENT_CHECK_TIMEOUT_SECS, RELAY_TIMEOUT_SECS
    /// - DEPLOYMENT_RETRY_ATTEMPTS, DEPLOYMENT_RETRY_BACKOFF_MS
    /// - POLY_BUILDER_API_KEY, POLY_BUILDER_SECRET, POLY_BUILDER_PASSPHRASE
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let builder_credentials = match (
            env::var("POLY_BUILDER_API_KEY").ok(),
            env::var("POLY_BUILDER_SECRET").ok(),
            env::var("POLY_BUILDER_PASSPHRASE").ok(),
        ) {
            (Some(api_key), Some(secret), Some(passphrase)) => Some(BuilderCredentials {
                api_key,
                secret,
                passphrase,
            }),
            (None, None, None) => None,
            _ => {
                return Err(TradingError::Config(
                    "POLY_BUILDER_API_KEY, POLY_BUILDER_SECRET and POLY_BUILDER_PASSPHRASE must be set together"
                        .to_string(),
                ))
            }
        };

        Ok(Self {
            clob_base_url: env::var("CLOB_BASE_URL").unwrap_or(defaults.clob_base_url),
            relay_base_url: env::var("RELAY_BASE_URL").unwrap_or(defaults.relay_base_url),
            rpc_url: env::var("POLYGON_RPC_URL").unwrap_or(defaults.rpc_url),
            chain_id: parse_var("CHAIN_ID")?.unwrap_or(defaults.chain_id),
            signature_timeout: parse_var("SIGNATURE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.signature_timeout),
            credential_timeout: parse_var("CREDENTIAL_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.credential_timeout),
            deployment_check_timeout: parse_var("DEPLOYMENT_CHECK_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.deployment_check_timeout),
            relay_timeout: parse_var("RELAY_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.relay_timeout),
            deployment_retry_attempts: parse_var("DEPLOYMENT_RETRY_ATTEMPTS")?
                .unwrap_or(defaults.deployment_retry_attempts),
            deployment_retry_backoff: parse_var("DEPLOYMENT_RETRY_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.deployment_retry_backoff),
            builder_credentials,
        })
    }
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| TradingError::Config(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(None),
    }
}
