//! Trading client factory
//!
//! At most one live [`ClobClient`] exists per trading session. A new session
//! always gets a freshly built client; the previous one is invalidated so
//! stale holders fail with `HandleInvalidated` instead of reusing credentials.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::clob_client::ClobClient;
use crate::session::SessionState;

pub struct TradingClientFactory {
    base_url: String,
    current: Mutex<Option<Arc<ClobClient>>>,
}

impl TradingClientFactory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            current: Mutex::new(None),
        }
    }

    /// Client for a ready session; `None` means "not ready"
    pub fn client(&self, state: &SessionState) -> Option<Arc<ClobClient>> {
        let mut current = self.current.lock();

        let SessionState::Ready(ready) = state else {
            if let Some(stale) = current.take() {
                stale.invalidate();
                debug!(session = %stale.session_id(), "Dropped trading client, session not ready");
            }
            return None;
        };

        if let Some(client) = current.as_ref() {
            if client.session_id() == ready.session.id() && client.is_live() {
                return Some(client.clone());
            }
        }

        let client = Arc::new(ClobClient::new(
            self.base_url.clone(),
            ready.session.clone(),
            ready.relay.clone(),
        ));
        if let Some(previous) = current.replace(client.clone()) {
            previous.invalidate();
        }

        info!(session = %ready.session.id(), "Built trading client");
        Some(client)
    }

    /// Invalidate and drop the cached client
    pub fn reset(&self) {
        if let Some(stale) = self.current.lock().take() {
            stale.invalidate();
        }
    }
}

impl std::fmt::Debug for TradingClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingClientFactory")
            .field("base_url", &self.base_url)
            .field("current", &self.current.lock().as_ref().map(|c| c.session_id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelayClient, RelayReceipt, RelayRequest, RelayTransport};
    use crate::session::{ReadySession, TradingSession};
    use crate::types::{ApiCredentials, Result, TradingError};
    use crate::wallet::{LocalSigner, SessionSigner};
    use alloy::primitives::{Address, U256};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoRelay;

    #[async_trait]
    impl RelayTransport for NoRelay {
        async fn get_nonce(&self, _owner: Address) -> Result<U256> {
            Ok(U256::ZERO)
        }

        async fn submit(&self, _request: &RelayRequest) -> Result<RelayReceipt> {
            Err(TradingError::RelaySubmissionFailed("offline".into()))
        }
    }

    fn ready() -> SessionState {
        let signer = Arc::new(LocalSigner::random());
        let eoa = signer.address();
        let safe = crate::safe::derive_safe_address(eoa);
        let credentials = ApiCredentials {
            api_key: "key".into(),
            secret: "c2VjcmV0".into(),
            passphrase: "pass".into(),
        };
        SessionState::Ready(ReadySession {
            session: Arc::new(TradingSession::new(eoa, safe, credentials, 0)),
            relay: Arc::new(RelayClient::new(
                safe,
                signer,
                Arc::new(NoRelay),
                137,
                Duration::from_secs(1),
            )),
        })
    }

    #[test]
    fn test_not_ready_yields_none() {
        let factory = TradingClientFactory::new("http://localhost");
        assert!(factory.client(&SessionState::NotReady).is_none());
    }

    #[test]
    fn test_same_session_reuses_client() {
        let factory = TradingClientFactory::new("http://localhost");
        let state = ready();

        let a = factory.client(&state).unwrap();
        let b = factory.client(&state).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_new_session_invalidates_previous_client() {
        let factory = TradingClientFactory::new("http://localhost");

        let first = factory.client(&ready()).unwrap();
        let second = factory.client(&ready()).unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!first.is_live());
        assert!(second.is_live());
    }

    #[test]
    fn test_not_ready_invalidates_cached_client() {
        let factory = TradingClientFactory::new("http://localhost");
        let client = factory.client(&ready()).unwrap();

        assert!(factory.client(&SessionState::NotReady).is_none());
        assert!(!client.is_live());
    }
}
