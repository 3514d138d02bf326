//! Gasless Safe transactions through the Polymarket relayer
//!
//! The EOA signs the Safe transaction hash; the relayer wraps it in an
//! `execTransaction` call and pays the gas. The relayer enforces strictly
//! increasing Safe nonces, so submissions for one Safe are serialized, across
//! every client built for that Safe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, U256};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::header_value;
use crate::clob_client::hmac_signature;
use crate::eip712::{pack_safe_signature, safe_tx_signing_hash};
use crate::types::{BuilderCredentials, Result, TradingError};
use crate::wallet::SessionSigner;

// Builder header names
const HEADER_BUILDER_API_KEY: &str = "POLY_BUILDER_API_KEY";
const HEADER_BUILDER_TIMESTAMP: &str = "POLY_BUILDER_TIMESTAMP";
const HEADER_BUILDER_PASSPHRASE: &str = "POLY_BUILDER_PASSPHRASE";
const HEADER_BUILDER_SIGNATURE: &str = "POLY_BUILDER_SIGNATURE";

// ============================================================================
// Wire Types
// ============================================================================

/// Safe operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OperationType {
    #[default]
    Call,
    DelegateCall,
}

impl OperationType {
    pub fn as_u8(self) -> u8 {
        match self {
            OperationType::Call => 0,
            OperationType::DelegateCall => 1,
        }
    }
}

/// Call to be executed by the Safe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaTransaction {
    pub to: Address,
    pub data: Bytes,
    pub operation: OperationType,
    /// Free-form label forwarded to the relayer
    pub metadata: Option<String>,
}

impl MetaTransaction {
    pub fn call(to: Address, data: Bytes) -> Self {
        Self {
            to,
            data,
            operation: OperationType::Call,
            metadata: None,
        }
    }
}

/// Gas parameters covered by the Safe signature (all zero: the relayer pays)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureParams {
    pub gas_price: String,
    pub operation: String,
    pub safe_txn_gas: String,
    pub base_gas: String,
    pub gas_token: String,
    pub refund_receiver: String,
}

impl SignatureParams {
    fn for_operation(operation: OperationType) -> Self {
        let zero = format!("{:#x}", Address::ZERO);
        Self {
            gas_price: "0".to_string(),
            operation: operation.as_u8().to_string(),
            safe_txn_gas: "0".to_string(),
            base_gas: "0".to_string(),
            gas_token: zero.clone(),
            refund_receiver: zero,
        }
    }
}

/// Envelope posted to the relayer's `/submit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    pub from: String,
    pub to: String,
    pub proxy_wallet: String,
    pub data: String,
    pub nonce: String,
    pub signature: String,
    pub signature_params: SignatureParams,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

/// Relayer acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayReceipt {
    #[serde(rename = "transactionID")]
    pub transaction_id: String,
    #[serde(default, rename = "transactionHash")]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

// ============================================================================
// Transport
// ============================================================================

/// Relayer endpoints
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Current Safe nonce known to the relayer for `owner`
    async fn get_nonce(&self, owner: Address) -> Result<U256>;

    async fn submit(&self, request: &RelayRequest) -> Result<RelayReceipt>;
}

/// `RelayTransport` over the relayer's HTTP API
#[derive(Clone)]
pub struct HttpRelayTransport {
    http_client: reqwest::Client,
    base_url: String,
    builder: Option<BuilderCredentials>,
}

impl HttpRelayTransport {
    pub fn new(base_url: impl Into<String>, builder: Option<BuilderCredentials>) -> Self {
        let http_client = reqwest::Client::builder()
            .user_agent("polymarket-terminal/1.0")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http_client,
            base_url: base_url.into(),
            builder,
        }
    }

    /// Builder HMAC headers: message = timestamp(ms) + method + path + body
    fn builder_headers(&self, method: &str, path: &str, body: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let Some(builder) = &self.builder else {
            return Ok(headers);
        };

        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let message = format!("{}{}{}{}", timestamp, method, path, body);
        let signature = hmac_signature(&builder.secret, &message)?;

        headers.insert(HEADER_BUILDER_API_KEY, header_value(&builder.api_key)?);
        headers.insert(HEADER_BUILDER_TIMESTAMP, header_value(&timestamp)?);
        headers.insert(HEADER_BUILDER_PASSPHRASE, header_value(&builder.passphrase)?);
        headers.insert(HEADER_BUILDER_SIGNATURE, header_value(&signature)?);
        Ok(headers)
    }
}

#[async_trait]
impl RelayTransport for HttpRelayTransport {
    async fn get_nonce(&self, owner: Address) -> Result<U256> {
        let url = format!("{}/nonce", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .query(&[("address", owner.to_checksum(None)), ("type", "SAFE".to_string())])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TradingError::RelaySubmissionFailed(format!(
                "Failed to get nonce: {} - {}",
                status, body
            )));
        }

        #[derive(Deserialize)]
        struct NonceResponse {
            nonce: serde_json::Value,
        }
        let response: NonceResponse = response.json().await?;

        // The relayer has returned the nonce both as a string and as a number
        let raw = match response.nonce {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(TradingError::Api(format!("Unexpected nonce value: {}", other)));
            }
        };
        raw.parse::<U256>()
            .map_err(|e| TradingError::Api(format!("Invalid nonce {}: {}", raw, e)))
    }

    async fn submit(&self, request: &RelayRequest) -> Result<RelayReceipt> {
        let path = "/submit";
        let body = serde_json::to_string(request)?;
        let headers = self.builder_headers("POST", path, &body)?;

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http_client
            .post(&url)
            .headers(headers)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Relayer rejected submission: {} - {}", status, body);
            return Err(TradingError::RelaySubmissionFailed(format!(
                "{} - {}",
                status, body
            )));
        }

        Ok(response.json().await?)
    }
}

impl std::fmt::Debug for HttpRelayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRelayTransport")
            .field("base_url", &self.base_url)
            .field("builder", &self.builder)
            .finish()
    }
}

// ============================================================================
// Nonces
// ============================================================================

/// Next nonce for one Safe; `None` until synced with the relayer.
/// Held for the whole submission, which serializes callers.
pub type SafeNonce = Arc<Mutex<Option<U256>>>;

/// Nonce slots keyed by Safe, outliving the clients that use them
#[derive(Debug, Default)]
pub struct NonceRegistry {
    slots: parking_lot::Mutex<HashMap<Address, SafeNonce>>,
}

impl NonceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared slot for `safe`, created on first use
    pub fn slot(&self, safe: Address) -> SafeNonce {
        self.slots.lock().entry(safe).or_default().clone()
    }
}

// ============================================================================
// Relay Client
// ============================================================================

/// Submission client bound to one (EOA, Safe) pair
pub struct RelayClient {
    eoa: Address,
    safe: Address,
    chain_id: u64,
    signer: Arc<dyn SessionSigner>,
    transport: Arc<dyn RelayTransport>,
    next_nonce: SafeNonce,
    invalidated: AtomicBool,
    timeout: Duration,
}

impl RelayClient {
    pub fn new(
        safe: Address,
        signer: Arc<dyn SessionSigner>,
        transport: Arc<dyn RelayTransport>,
        chain_id: u64,
        timeout: Duration,
    ) -> Self {
        Self {
            eoa: signer.address(),
            safe,
            chain_id,
            signer,
            transport,
            next_nonce: SafeNonce::default(),
            invalidated: AtomicBool::new(false),
            timeout,
        }
    }

    /// Share the nonce slot of every other client for this Safe
    pub fn with_nonce(mut self, next_nonce: SafeNonce) -> Self {
        self.next_nonce = next_nonce;
        self
    }

    pub fn eoa(&self) -> Address {
        self.eoa
    }

    pub fn safe(&self) -> Address {
        self.safe
    }

    /// Permanently disable this client
    pub fn invalidate(&self) {
        if !self.invalidated.swap(true, Ordering::SeqCst) {
            debug!(safe = %self.safe, "Relay client invalidated");
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_invalidated() {
            return Err(TradingError::HandleInvalidated(format!(
                "relay client for Safe {} belongs to an ended session",
                self.safe
            )));
        }
        Ok(())
    }

    /// Sign and submit a Safe transaction
    pub async fn submit(&self, tx: MetaTransaction) -> Result<RelayReceipt> {
        self.ensure_live()?;
        let mut next_nonce = self.next_nonce.lock().await;
        // The session may have ended while this call waited its turn
        self.ensure_live()?;

        let nonce = match *next_nonce {
            Some(nonce) => nonce,
            None => {
                let nonce = tokio::time::timeout(self.timeout, self.transport.get_nonce(self.eoa))
                    .await
                    .map_err(|_| TradingError::timeout("relay nonce fetch", self.timeout))??;
                debug!(safe = %self.safe, nonce = %nonce, "Synced relay nonce");
                nonce
            }
        };

        let hash = safe_tx_signing_hash(
            self.chain_id,
            self.safe,
            tx.to,
            U256::ZERO,
            tx.data.clone(),
            tx.operation.as_u8(),
            nonce,
        );
        let signing = self.signer.sign_message(hash.as_slice());
        let signature = tokio::time::timeout(self.timeout, signing)
            .await
            .map_err(|_| TradingError::timeout("relay signature", self.timeout))??;

        let request = RelayRequest {
            from: self.eoa.to_checksum(None),
            to: tx.to.to_checksum(None),
            proxy_wallet: self.safe.to_checksum(None),
            data: tx.data.to_string(),
            nonce: nonce.to_string(),
            signature: pack_safe_signature(&signature),
            signature_params: SignatureParams::for_operation(tx.operation),
            kind: "SAFE".to_string(),
            metadata: tx.metadata,
        };

        // Nothing has been posted yet, so the cached nonce stays valid
        self.ensure_live()?;

        let outcome = tokio::time::timeout(self.timeout, self.transport.submit(&request)).await;
        match outcome {
            Ok(Ok(receipt)) => {
                *next_nonce = Some(nonce + U256::from(1));
                info!(
                    safe = %self.safe,
                    nonce = %nonce,
                    transaction_id = %receipt.transaction_id,
                    "Relay submission accepted"
                );
                Ok(receipt)
            }
            Ok(Err(e)) => {
                // Resync on the next submission
                *next_nonce = None;
                warn!(safe = %self.safe, nonce = %nonce, "Relay submission failed: {}", e);
                Err(match e {
                    TradingError::RelaySubmissionFailed(_) => e,
                    other => TradingError::RelaySubmissionFailed(other.to_string()),
                })
            }
            Err(_) => {
                *next_nonce = None;
                warn!(safe = %self.safe, nonce = %nonce, "Relay submission timed out");
                Err(TradingError::timeout("relay submission", self.timeout))
            }
        }
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("eoa", &self.eoa)
            .field("safe", &self.safe)
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safe::derive_safe_address;
    use crate::wallet::LocalSigner;
    use alloy::primitives::B256;
    use alloy::signers::Signature;
    use std::sync::atomic::AtomicUsize;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// In-memory relayer recording every submitted nonce
    struct RecordingTransport {
        start: u64,
        nonce_calls: AtomicUsize,
        submitted: parking_lot::Mutex<Vec<String>>,
        reject_next: AtomicBool,
    }

    impl RecordingTransport {
        fn new(start: u64) -> Self {
            Self {
                start,
                nonce_calls: AtomicUsize::new(0),
                submitted: parking_lot::Mutex::new(Vec::new()),
                reject_next: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl RelayTransport for RecordingTransport {
        async fn get_nonce(&self, _owner: Address) -> Result<U256> {
            self.nonce_calls.fetch_add(1, Ordering::SeqCst);
            let submitted = self.submitted.lock().len() as u64;
            Ok(U256::from(self.start + submitted))
        }

        async fn submit(&self, request: &RelayRequest) -> Result<RelayReceipt> {
            tokio::task::yield_now().await;
            if self.reject_next.swap(false, Ordering::SeqCst) {
                return Err(TradingError::RelaySubmissionFailed("400 - bad nonce".into()));
            }
            let mut submitted = self.submitted.lock();
            submitted.push(request.nonce.clone());
            Ok(RelayReceipt {
                transaction_id: format!("tx-{}", submitted.len()),
                transaction_hash: None,
                state: Some("STATE_NEW".into()),
            })
        }
    }

    fn client(transport: Arc<dyn RelayTransport>) -> RelayClient {
        let signer = Arc::new(LocalSigner::random());
        let safe = derive_safe_address(signer.address());
        RelayClient::new(safe, signer, transport, 137, Duration::from_secs(5))
    }

    /// Wallet that takes `delay` to answer a signature prompt, or never answers
    struct SlowSigner {
        inner: LocalSigner,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl SessionSigner for SlowSigner {
        fn address(&self) -> Address {
            self.inner.address()
        }

        async fn sign_hash(&self, hash: B256) -> Result<Signature> {
            self.inner.sign_hash(hash).await
        }

        async fn sign_message(&self, message: &[u8]) -> Result<Signature> {
            match self.delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
            self.inner.sign_message(message).await
        }
    }

    fn approve_tx() -> MetaTransaction {
        MetaTransaction::call(
            Address::repeat_byte(0x4d),
            Bytes::from_static(&[0x09, 0x5e, 0xa7, 0xb3]),
        )
    }

    #[tokio::test]
    async fn test_sequential_nonces() {
        let transport = Arc::new(RecordingTransport::new(5));
        let relay = client(transport.clone());

        relay.submit(approve_tx()).await.unwrap();
        relay.submit(approve_tx()).await.unwrap();
        relay.submit(approve_tx()).await.unwrap();

        assert_eq!(*transport.submitted.lock(), vec!["5", "6", "7"]);
        assert_eq!(transport.nonce_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_get_unique_nonces() {
        let transport = Arc::new(RecordingTransport::new(0));
        let relay = Arc::new(client(transport.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let relay = relay.clone();
                tokio::spawn(async move { relay.submit(approve_tx()).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let nonces: Vec<u64> = transport
            .submitted
            .lock()
            .iter()
            .map(|n| n.parse().unwrap())
            .collect();
        assert_eq!(nonces, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_rejection_resyncs_nonce() {
        let transport = Arc::new(RecordingTransport::new(3));
        let relay = client(transport.clone());

        relay.submit(approve_tx()).await.unwrap();
        transport.reject_next.store(true, Ordering::SeqCst);
        let err = relay.submit(approve_tx()).await.unwrap_err();
        assert!(matches!(err, TradingError::RelaySubmissionFailed(_)));

        relay.submit(approve_tx()).await.unwrap();
        assert_eq!(*transport.submitted.lock(), vec!["3", "4"]);
        assert_eq!(transport.nonce_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidated_client_refuses() {
        let transport = Arc::new(RecordingTransport::new(0));
        let relay = client(transport.clone());
        relay.invalidate();

        let err = relay.submit(approve_tx()).await.unwrap_err();
        assert!(matches!(err, TradingError::HandleInvalidated(_)));
        assert!(transport.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_clients_for_same_safe_share_nonces() {
        let transport = Arc::new(RecordingTransport::new(0));
        let registry = NonceRegistry::new();
        let signer = Arc::new(LocalSigner::random());
        let safe = derive_safe_address(signer.address());

        let timeout = Duration::from_secs(5);

        let first = RelayClient::new(safe, signer.clone(), transport.clone(), 137, timeout)
            .with_nonce(registry.slot(safe));
        first.submit(approve_tx()).await.unwrap();
        first.invalidate();

        let second = RelayClient::new(safe, signer, transport.clone(), 137, timeout)
            .with_nonce(registry.slot(safe));
        second.submit(approve_tx()).await.unwrap();

        assert_eq!(*transport.submitted.lock(), vec!["0", "1"]);
        assert_eq!(transport.nonce_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_while_signing_posts_nothing() {
        let transport = Arc::new(RecordingTransport::new(0));
        let signer = Arc::new(SlowSigner {
            inner: LocalSigner::random(),
            delay: Some(Duration::from_millis(50)),
        });
        let safe = derive_safe_address(signer.address());
        let relay = Arc::new(RelayClient::new(
            safe,
            signer,
            transport.clone(),
            137,
            Duration::from_secs(5),
        ));

        let pending = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.submit(approve_tx()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        relay.invalidate();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, TradingError::HandleInvalidated(_)));
        assert!(transport.submitted.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_signature_times_out_and_releases_nonce() {
        let transport = Arc::new(RecordingTransport::new(4));
        let registry = NonceRegistry::new();
        let inner = LocalSigner::random();
        let safe = derive_safe_address(inner.address());

        let hung = RelayClient::new(
            safe,
            Arc::new(SlowSigner { inner: inner.clone(), delay: None }),
            transport.clone(),
            137,
            Duration::from_secs(5),
        )
        .with_nonce(registry.slot(safe));
        let err = hung.submit(approve_tx()).await.unwrap_err();
        assert!(matches!(err, TradingError::Timeout { operation: "relay signature", .. }));
        assert!(err.is_retryable());

        let healthy = RelayClient::new(
            safe,
            Arc::new(inner),
            transport.clone(),
            137,
            Duration::from_secs(5),
        )
        .with_nonce(registry.slot(safe));
        healthy.submit(approve_tx()).await.unwrap();
        assert_eq!(*transport.submitted.lock(), vec!["4"]);
    }

    #[test]
    fn test_envelope_shape() {
        let request = RelayRequest {
            from: "0x01".into(),
            to: "0x02".into(),
            proxy_wallet: "0x03".into(),
            data: "0x".into(),
            nonce: "1".into(),
            signature: "0x04".into(),
            signature_params: SignatureParams::for_operation(OperationType::Call),
            kind: "SAFE".into(),
            metadata: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["proxyWallet"], "0x03");
        assert_eq!(json["type"], "SAFE");
        assert_eq!(json["signatureParams"]["safeTxnGas"], "0");
        assert_eq!(json["signatureParams"]["operation"], "0");
        assert!(json.get("metadata").is_none());
    }

    #[tokio::test]
    async fn test_http_transport() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nonce"))
            .and(query_param("type", "SAFE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"nonce": "12"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .and(header_exists("POLY_BUILDER_SIGNATURE"))
            .and(header_exists("POLY_BUILDER_TIMESTAMP"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "transactionID": "abc",
                "state": "STATE_NEW"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let builder = BuilderCredentials {
            api_key: "builder-key".into(),
            secret: "c2VjcmV0LXNlY3JldC1zZWNyZXQtc2VjcmV0LXM=".into(),
            passphrase: "builder-pass".into(),
        };
        let transport = Arc::new(HttpRelayTransport::new(server.uri(), Some(builder)));
        let relay = client(transport);

        let receipt = relay.submit(approve_tx()).await.unwrap();
        assert_eq!(receipt.transaction_id, "abc");
        assert_eq!(receipt.state.as_deref(), Some("STATE_NEW"));
    }

    #[tokio::test]
    async fn test_http_transport_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nonce"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"nonce": 0})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid signature"))
            .mount(&server)
            .await;

        let relay = client(Arc::new(HttpRelayTransport::new(server.uri(), None)));
        let err = relay.submit(approve_tx()).await.unwrap_err();
        match err {
            TradingError::RelaySubmissionFailed(message) => {
                assert!(message.contains("invalid signature"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
