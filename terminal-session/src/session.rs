//! Trading session payload and the ready/not-ready sum type

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::relay::RelayClient;
use crate::types::ApiCredentials;

/// Credential bundle bound 1:1 to an (EOA, Safe) pair
///
/// Revocation is one-way: a revoked session is never handed out again.
pub struct TradingSession {
    id: Uuid,
    eoa: Address,
    safe: Address,
    credentials: ApiCredentials,
    created_at: DateTime<Utc>,
    generation: u64,
    revoked: AtomicBool,
}

impl TradingSession {
    pub fn new(eoa: Address, safe: Address, credentials: ApiCredentials, generation: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            eoa,
            safe,
            credentials,
            created_at: Utc::now(),
            generation,
            revoked: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn eoa(&self) -> Address {
        self.eoa
    }

    pub fn safe(&self) -> Address {
        self.safe
    }

    pub fn credentials(&self) -> &ApiCredentials {
        &self.credentials
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Machine generation the session was created under
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for TradingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingSession")
            .field("id", &self.id)
            .field("eoa", &self.eoa)
            .field("safe", &self.safe)
            .field("credentials", &self.credentials)
            .field("created_at", &self.created_at)
            .field("generation", &self.generation)
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

/// Everything downstream consumers need once the session is complete
#[derive(Debug, Clone)]
pub struct ReadySession {
    pub session: Arc<TradingSession>,
    pub relay: Arc<RelayClient>,
}

/// Session availability as seen by consumers
#[derive(Debug, Clone, Default)]
pub enum SessionState {
    #[default]
    NotReady,
    Ready(ReadySession),
}

impl SessionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready(_))
    }

    pub fn ready(&self) -> Option<&ReadySession> {
        match self {
            SessionState::Ready(ready) => Some(ready),
            SessionState::NotReady => None,
        }
    }
}
