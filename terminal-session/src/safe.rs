//! Safe address derivation and deployment checks
//!
//! The Safe address is a CREATE2 address: the relayer's Safe factory deploys a
//! proxy whose salt is `keccak256(abi.encode(owner))`, so the address is known
//! before the contract exists. Deployment status needs a chain read.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{address, b256, keccak256, Address, Bytes, B256};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::types::{Result, TradingError};

/// Safe proxy factory used by the relayer on Polygon
pub const SAFE_FACTORY: Address = address!("0xaacFeEa03eb1561C4e67d661e40682Bd20E3541b");

/// keccak256 of the Safe proxy creation code
pub const SAFE_INIT_CODE_HASH: B256 =
    b256!("0x2bce2127ff07fb632d16c8347c4ebf501f4841168bed00d9e6ef715ddb6fcecf");

// ============================================================================
// Derivation
// ============================================================================

/// Factory + init-code-hash pair defining the Safe address scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeDerivation {
    pub factory: Address,
    pub init_code_hash: B256,
}

impl Default for SafeDerivation {
    fn default() -> Self {
        Self {
            factory: SAFE_FACTORY,
            init_code_hash: SAFE_INIT_CODE_HASH,
        }
    }
}

impl SafeDerivation {
    /// Compute the Safe address owned by `eoa`. Pure; no I/O.
    pub fn derive(&self, eoa: Address) -> Address {
        // abi.encode(address) is the address left-padded to 32 bytes
        let salt = keccak256(eoa.into_word());
        self.factory.create2(salt.0, self.init_code_hash.0)
    }
}

/// Derive the Polygon Safe address for an EOA
pub fn derive_safe_address(eoa: Address) -> Address {
    SafeDerivation::default().derive(eoa)
}

// ============================================================================
// Chain Reads
// ============================================================================

/// Read-only chain access needed for deployment checks
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Contract bytecode at `address` (empty for EOAs and undeployed contracts)
    async fn get_code(&self, address: Address) -> Result<Bytes>;
}

/// JSON-RPC request
#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    method: &'static str,
    params: Vec<serde_json::Value>,
    id: u64,
}

/// JSON-RPC response
#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<String>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    message: String,
}

/// `ChainReader` over a plain JSON-RPC endpoint
#[derive(Debug, Clone)]
pub struct JsonRpcChainReader {
    http_client: reqwest::Client,
    rpc_url: String,
}

impl JsonRpcChainReader {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            rpc_url: rpc_url.into(),
        }
    }
}

#[async_trait]
impl ChainReader for JsonRpcChainReader {
    async fn get_code(&self, address: Address) -> Result<Bytes> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method: "eth_getCode",
            params: vec![
                serde_json::json!(address.to_checksum(None)),
                serde_json::json!("latest"),
            ],
            id: 1,
        };

        debug!("Making eth_getCode for {}", address);

        let response = self
            .http_client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| TradingError::Api(format!("RPC request failed: {}", e)))?;

        let rpc_response: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| TradingError::Api(format!("Failed to parse RPC response: {}", e)))?;

        if let Some(error) = rpc_response.error {
            return Err(TradingError::Api(format!("RPC error: {}", error.message)));
        }

        let code = rpc_response
            .result
            .ok_or_else(|| TradingError::Api("No result in RPC response".to_string()))?;

        code.parse::<Bytes>()
            .map_err(|e| TradingError::Api(format!("Invalid bytecode in RPC response: {}", e)))
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Derives Safe addresses and answers (cached) deployment questions
pub struct SafeAddressResolver {
    derivation: SafeDerivation,
    chain: Arc<dyn ChainReader>,
    /// Positive answers only. A not-deployed answer is kept by the session
    /// machine for one session, since the relayer may deploy the Safe later
    deployed: Mutex<HashSet<Address>>,
    check_timeout: Duration,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl SafeAddressResolver {
    pub fn new(chain: Arc<dyn ChainReader>, config: &SessionConfig) -> Self {
        Self {
            derivation: SafeDerivation::default(),
            chain,
            deployed: Mutex::new(HashSet::new()),
            check_timeout: config.deployment_check_timeout,
            retry_attempts: config.deployment_retry_attempts.max(1),
            retry_backoff: config.deployment_retry_backoff,
        }
    }

    pub fn with_derivation(mut self, derivation: SafeDerivation) -> Self {
        self.derivation = derivation;
        self
    }

    /// Deterministic Safe address for `eoa`
    pub fn derive(&self, eoa: Address) -> Address {
        self.derivation.derive(eoa)
    }

    /// Cached deployment answer, if any
    pub fn cached(&self, safe: Address) -> Option<bool> {
        self.deployed.lock().contains(&safe).then_some(true)
    }

    /// Single bounded deployment check
    pub async fn is_deployed(&self, safe: Address) -> Result<bool> {
        if let Some(deployed) = self.cached(safe) {
            return Ok(deployed);
        }

        let code = tokio::time::timeout(self.check_timeout, self.chain.get_code(safe))
            .await
            .map_err(|_| TradingError::timeout("deployment check", self.check_timeout))?
            .map_err(|e| TradingError::DerivationUnavailable(e.to_string()))?;

        let deployed = !code.is_empty();
        if deployed {
            self.deployed.lock().insert(safe);
        }

        debug!(safe = %safe, deployed, "Safe deployment checked");
        Ok(deployed)
    }

    /// Deployment check with exponential backoff
    ///
    /// Exhausting the attempts yields `DerivationUnavailable`; the derived
    /// address itself is unaffected.
    pub async fn check_deployment(&self, safe: Address) -> Result<bool> {
        let mut backoff = self.retry_backoff;
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            match self.is_deployed(safe).await {
                Ok(deployed) => return Ok(deployed),
                Err(e) => {
                    warn!(
                        safe = %safe,
                        attempt,
                        "Deployment check failed: {}", e
                    );
                    last_error = Some(e);
                }
            }

            if attempt < self.retry_attempts {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        Err(TradingError::DerivationUnavailable(format!(
            "{} after {} attempts",
            message, self.retry_attempts
        )))
    }
}

impl std::fmt::Debug for SafeAddressResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeAddressResolver")
            .field("derivation", &self.derivation)
            .field("cached", &self.deployed.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HARDHAT_0: Address = address!("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");

    /// Scripted chain: fails the first `failures` calls, then returns `code`
    struct ScriptedChain {
        failures: usize,
        code: Bytes,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedChain {
        fn new(failures: usize, code: &'static [u8]) -> Self {
            Self {
                failures,
                code: Bytes::from_static(code),
                calls: AtomicUsize::new(0),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl ChainReader for ScriptedChain {
        async fn get_code(&self, _address: Address) -> Result<Bytes> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if call < self.failures {
                return Err(TradingError::Api("RPC error: upstream unavailable".into()));
            }
            Ok(self.code.clone())
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            deployment_check_timeout: Duration::from_secs(1),
            deployment_retry_attempts: 3,
            deployment_retry_backoff: Duration::from_millis(10),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_derive_known_vector() {
        let safe = derive_safe_address(HARDHAT_0);
        assert_eq!(
            safe.to_checksum(None),
            "0xd93B25cb943D14d0d34FBaF01Fc93a0f8b5F6E47"
        );
    }

    #[test]
    fn test_derive_is_deterministic() {
        let eoa = Address::repeat_byte(0xaa);
        let first = derive_safe_address(eoa);
        let second = derive_safe_address(eoa);
        assert_eq!(first, second);
        assert_ne!(first, derive_safe_address(Address::repeat_byte(0xbb)));
        assert_ne!(first, eoa);
    }

    #[test]
    fn test_resolver_derivation_needs_no_chain() {
        let chain = Arc::new(ScriptedChain::new(usize::MAX, b""));
        let resolver = SafeAddressResolver::new(chain.clone(), &config());

        assert_eq!(resolver.derive(HARDHAT_0), derive_safe_address(HARDHAT_0));
        assert_eq!(chain.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deployed_result_is_cached() {
        let chain = Arc::new(ScriptedChain::new(0, &[0x60, 0x80]));
        let resolver = SafeAddressResolver::new(chain.clone(), &config());
        let safe = resolver.derive(HARDHAT_0);

        assert!(resolver.is_deployed(safe).await.unwrap());
        assert!(resolver.is_deployed(safe).await.unwrap());
        assert_eq!(chain.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.cached(safe), Some(true));
    }

    #[tokio::test]
    async fn test_undeployed_is_rechecked() {
        let chain = Arc::new(ScriptedChain::new(0, b""));
        let resolver = SafeAddressResolver::new(chain.clone(), &config());
        let safe = resolver.derive(HARDHAT_0);

        assert!(!resolver.is_deployed(safe).await.unwrap());
        assert!(!resolver.is_deployed(safe).await.unwrap());
        assert_eq!(chain.calls.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.cached(safe), None);
    }

    #[tokio::test]
    async fn test_check_deployment_retries() {
        let chain = Arc::new(ScriptedChain::new(2, &[0x60]));
        let resolver = SafeAddressResolver::new(chain.clone(), &config());

        let deployed = resolver.check_deployment(resolver.derive(HARDHAT_0)).await.unwrap();
        assert!(deployed);
        assert_eq!(chain.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_check_deployment_gives_up() {
        let chain = Arc::new(ScriptedChain::new(usize::MAX, b""));
        let resolver = SafeAddressResolver::new(chain.clone(), &config());

        let err = resolver
            .check_deployment(resolver.derive(HARDHAT_0))
            .await
            .unwrap_err();
        assert!(matches!(err, TradingError::DerivationUnavailable(_)));
        assert!(err.is_retryable());
        assert_eq!(chain.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_rpc_times_out() {
        let mut chain = ScriptedChain::new(0, &[0x60]);
        chain.delay = Some(Duration::from_secs(60));
        let resolver = SafeAddressResolver::new(Arc::new(chain), &config());

        let err = resolver.is_deployed(resolver.derive(HARDHAT_0)).await.unwrap_err();
        assert!(matches!(err, TradingError::Timeout { .. }));
    }
}
