//! Wallet identity - the single owner of the authenticated EOA
//!
//! `WalletIdentity` wraps a [`WalletProvider`] and is the only writer of the
//! EOA address, the profile fields and the signing capability. Everything else
//! reads them or subscribes to [`IdentitySnapshot`] updates.

use std::sync::Arc;

use alloy::primitives::Address;
use parking_lot::Mutex;
use terminal_core::IdentitySnapshot;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::types::{Result, TradingError};
use crate::wallet::{SessionSigner, WalletProvider};

#[derive(Default)]
struct IdentityState {
    eoa: Option<Address>,
    email: Option<String>,
    signer: Option<Arc<dyn SessionSigner>>,
    epoch: u64,
}

impl IdentityState {
    fn snapshot(&self) -> IdentitySnapshot {
        IdentitySnapshot {
            eoa_address: self.eoa.map(|a| a.to_checksum(None)),
            email: self.email.clone(),
            epoch: self.epoch,
        }
    }
}

/// A fully fetched account: all fields are present or the fetch failed
struct ConnectedAccount {
    eoa: Address,
    email: Option<String>,
    signer: Arc<dyn SessionSigner>,
}

/// Application-wide wallet identity
pub struct WalletIdentity {
    provider: Arc<dyn WalletProvider>,
    state: Mutex<IdentityState>,
    updates: watch::Sender<IdentitySnapshot>,
    /// Serializes connect / resume / disconnect
    op_lock: tokio::sync::Mutex<()>,
}

impl WalletIdentity {
    pub fn new(provider: Arc<dyn WalletProvider>) -> Self {
        let (updates, _) = watch::channel(IdentitySnapshot::default());
        Self {
            provider,
            state: Mutex::new(IdentityState::default()),
            updates,
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Authenticated EOA, if connected
    pub fn eoa_address(&self) -> Option<Address> {
        self.state.lock().eoa
    }

    pub fn email(&self) -> Option<String> {
        self.state.lock().email.clone()
    }

    /// Signing capability for the connected EOA
    pub fn signer(&self) -> Option<Arc<dyn SessionSigner>> {
        self.state.lock().signer.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().eoa.is_some()
    }

    pub fn snapshot(&self) -> IdentitySnapshot {
        self.state.lock().snapshot()
    }

    /// Receive every identity change
    pub fn subscribe(&self) -> watch::Receiver<IdentitySnapshot> {
        self.updates.subscribe()
    }

    /// Prompt the provider's login flow and populate the identity
    ///
    /// On failure the previous state is left untouched and the error is returned.
    pub async fn connect(&self) -> Result<Address> {
        let _guard = self.op_lock.lock().await;

        if let Err(e) = self.provider.connect_with_ui().await {
            error!("Connect error: {}", e);
            return Err(e);
        }

        let account = match self.fetch_account().await {
            Ok(account) => account,
            Err(e) => {
                error!("Connect succeeded but fetching the account failed: {}", e);
                return Err(e);
            }
        };

        let eoa = account.eoa;
        self.apply(Some(account));
        info!(eoa = %eoa, "Wallet connected");
        Ok(eoa)
    }

    /// Silent resume of an existing provider session, without prompting
    ///
    /// Any failure leaves the identity disconnected.
    pub async fn resume(&self) -> Result<Option<Address>> {
        let _guard = self.op_lock.lock().await;

        if let Some(eoa) = self.eoa_address() {
            debug!("Resume skipped, already connected as {}", eoa);
            return Ok(Some(eoa));
        }

        if !self.provider.is_logged_in().await? {
            debug!("No existing provider session to resume");
            return Ok(None);
        }

        match self.fetch_account().await {
            Ok(account) => {
                let eoa = account.eoa;
                self.apply(Some(account));
                info!(eoa = %eoa, "Resumed existing wallet session");
                Ok(Some(eoa))
            }
            Err(e) => {
                warn!("Existing provider session could not be resumed: {}", e);
                Err(e)
            }
        }
    }

    /// End the provider session and clear the identity. No-op when disconnected.
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        if !self.is_connected() {
            debug!("Disconnect ignored, not connected");
            return Ok(());
        }

        if let Err(e) = self.provider.logout().await {
            error!("Disconnect error: {}", e);
            return Err(e);
        }

        self.apply(None);
        info!("Wallet disconnected");
        Ok(())
    }

    async fn fetch_account(&self) -> Result<ConnectedAccount> {
        let user_info = self.provider.get_user_info().await?;

        let raw = user_info
            .public_address
            .ok_or_else(|| TradingError::Wallet("Provider returned no public address".to_string()))?;
        let eoa: Address = raw
            .parse()
            .map_err(|e| TradingError::Wallet(format!("Malformed address {}: {}", raw, e)))?;

        let signer = self
            .provider
            .signer()
            .ok_or_else(|| TradingError::Wallet("Provider has no signing capability".to_string()))?;

        if signer.address() != eoa {
            return Err(TradingError::Wallet(format!(
                "Signer address {} does not match account {}",
                signer.address(),
                eoa
            )));
        }

        Ok(ConnectedAccount {
            eoa,
            email: user_info.email,
            signer,
        })
    }

    fn apply(&self, account: Option<ConnectedAccount>) {
        let snapshot = {
            let mut state = self.state.lock();
            let (eoa, email, signer) = match account {
                Some(a) => (Some(a.eoa), a.email, Some(a.signer)),
                None => (None, None, None),
            };

            if state.eoa != eoa || state.email != email {
                state.epoch += 1;
            }
            state.eoa = eoa;
            state.email = email;
            state.signer = signer;
            state.snapshot()
        };

        self.updates.send_replace(snapshot);
    }
}

impl std::fmt::Debug for WalletIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WalletIdentity")
            .field("eoa", &state.eoa)
            .field("epoch", &state.epoch)
            .finish()
    }
}
