//! Wallet capabilities - embedded-wallet provider surface and signing

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy::primitives::{Address, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::{Signature, Signer};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::types::{Result, TradingError};

// ============================================================================
// Capabilities
// ============================================================================

/// Signing capability bound to one EOA
#[async_trait]
pub trait SessionSigner: Send + Sync {
    /// Address the signatures recover to
    fn address(&self) -> Address;

    /// Sign a 32-byte digest (EIP-712 signing hashes)
    async fn sign_hash(&self, hash: B256) -> Result<Signature>;

    /// Sign bytes with the EIP-191 personal message prefix
    async fn sign_message(&self, message: &[u8]) -> Result<Signature>;
}

/// Profile returned by the wallet provider for the logged-in user
#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    pub public_address: Option<String>,
    pub email: Option<String>,
}

/// Embedded-wallet provider surface
///
/// Implementations wrap whatever custody backend holds the user's key. A
/// rejected prompt must surface as [`TradingError::UserCancelled`].
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Run the provider's interactive login flow
    async fn connect_with_ui(&self) -> Result<()>;

    async fn logout(&self) -> Result<()>;

    /// Whether a provider session already exists (e.g. after a restart)
    async fn is_logged_in(&self) -> Result<bool>;

    async fn get_user_info(&self) -> Result<UserInfo>;

    /// Signing capability for the logged-in account, if any
    fn signer(&self) -> Option<Arc<dyn SessionSigner>>;
}

// ============================================================================
// Local Signer
// ============================================================================

/// Private-key signer
#[derive(Clone)]
pub struct LocalSigner {
    signer: PrivateKeySigner,
    address: Address,
}

impl LocalSigner {
    /// Create a signer from a private key hex string
    pub fn from_private_key(private_key: &str) -> Result<Self> {
        let key = private_key.strip_prefix("0x").unwrap_or(private_key);

        let key_bytes = B256::from_str(key)
            .map_err(|e| TradingError::Wallet(format!("Invalid private key format: {}", e)))?;

        let signer = PrivateKeySigner::from_bytes(&key_bytes)
            .map_err(|e| TradingError::Wallet(format!("Failed to create signer: {}", e)))?;

        let address = signer.address();
        debug!("Loaded signer for {}", address);

        Ok(Self { signer, address })
    }

    /// Generate a new random signer
    pub fn random() -> Self {
        let signer = PrivateKeySigner::random();
        let address = signer.address();
        Self { signer, address }
    }

    /// Get the address as a checksummed string
    pub fn address_string(&self) -> String {
        self.address.to_checksum(None)
    }
}

#[async_trait]
impl SessionSigner for LocalSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_hash(&self, hash: B256) -> Result<Signature> {
        self.signer
            .sign_hash(&hash)
            .await
            .map_err(|e| TradingError::Signing(format!("Failed to sign hash: {}", e)))
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Signature> {
        self.signer
            .sign_message(message)
            .await
            .map_err(|e| TradingError::Signing(format!("Failed to sign message: {}", e)))
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &self.address)
            .finish()
    }
}

// ============================================================================
// Local Wallet Provider
// ============================================================================

/// Wallet provider backed by a locally held private key
///
/// There is no interactive flow: `connect_with_ui` simply opens the provider
/// session. Used by the API binary and by tests.
pub struct LocalWalletProvider {
    signer: Arc<LocalSigner>,
    email: Option<String>,
    logged_in: AtomicBool,
}

impl LocalWalletProvider {
    pub fn new(signer: LocalSigner, email: Option<String>) -> Self {
        Self {
            signer: Arc::new(signer),
            email,
            logged_in: AtomicBool::new(false),
        }
    }

    /// Load from TRADING_PRIVATE_KEY (and optional TRADING_EMAIL)
    ///
    /// The provider session starts logged in when TRADING_AUTO_LOGIN is set,
    /// which lets the silent-resume path pick it up at startup.
    pub fn from_env() -> Result<Self> {
        let private_key = std::env::var("TRADING_PRIVATE_KEY").map_err(|_| {
            TradingError::Config("TRADING_PRIVATE_KEY environment variable not set".to_string())
        })?;

        let signer = LocalSigner::from_private_key(&private_key)?;
        let provider = Self::new(signer, std::env::var("TRADING_EMAIL").ok());

        if std::env::var("TRADING_AUTO_LOGIN").is_ok() {
            provider.logged_in.store(true, Ordering::SeqCst);
        }

        info!("Local wallet provider ready for {}", provider.signer.address_string());
        Ok(provider)
    }

    /// Start with an existing provider session
    pub fn logged_in(self) -> Self {
        self.logged_in.store(true, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl WalletProvider for LocalWalletProvider {
    async fn connect_with_ui(&self) -> Result<()> {
        self.logged_in.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.logged_in.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_logged_in(&self) -> Result<bool> {
        Ok(self.logged_in.load(Ordering::SeqCst))
    }

    async fn get_user_info(&self) -> Result<UserInfo> {
        if !self.logged_in.load(Ordering::SeqCst) {
            return Err(TradingError::Wallet("Provider session is not open".to_string()));
        }

        Ok(UserInfo {
            public_address: Some(self.signer.address_string()),
            email: self.email.clone(),
        })
    }

    fn signer(&self) -> Option<Arc<dyn SessionSigner>> {
        if self.logged_in.load(Ordering::SeqCst) {
            Some(self.signer.clone() as Arc<dyn SessionSigner>)
        } else {
            None
        }
    }
}
