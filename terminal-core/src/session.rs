//! Trading session vocabulary shared between the session engine and its consumers
//!
//! Everything here is plain data: serializable snapshots that observers receive
//! whenever the wallet identity or the session machine changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Session Step
// ============================================================================

/// Position of the orchestrator in the authenticate → derive → authorize → ready pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStep {
    #[default]
    NotStarted,
    AwaitingWalletAuth,
    DerivingSafeAddress,
    AwaitingCredentials,
    Complete,
    Failed,
}

impl SessionStep {
    /// Pipeline position of the step. `Failed` has no position.
    pub fn ordinal(&self) -> Option<u8> {
        match self {
            SessionStep::NotStarted => Some(0),
            SessionStep::AwaitingWalletAuth => Some(1),
            SessionStep::DerivingSafeAddress => Some(2),
            SessionStep::AwaitingCredentials => Some(3),
            SessionStep::Complete => Some(4),
            SessionStep::Failed => None,
        }
    }

    /// Complete and Failed end an initialization attempt
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStep::Complete | SessionStep::Failed)
    }

    /// Whether `self -> next` is a legal transition for a running initialization.
    ///
    /// Resets to `NotStarted` are not covered here; they only happen through
    /// an explicit end/reset and are always allowed.
    pub fn can_advance_to(&self, next: SessionStep) -> bool {
        match (self, next) {
            (_, SessionStep::NotStarted) => false,
            (SessionStep::Failed, SessionStep::Failed) => false,
            (SessionStep::Complete, _) => false,
            (_, SessionStep::Failed) => true,
            // A retry re-enters the pipeline at the step that failed
            (SessionStep::Failed, next) => next != SessionStep::Complete,
            (current, next) => match (current.ordinal(), next.ordinal()) {
                (Some(a), Some(b)) => b > a,
                _ => false,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStep::NotStarted => "not_started",
            SessionStep::AwaitingWalletAuth => "awaiting_wallet_auth",
            SessionStep::DerivingSafeAddress => "deriving_safe_address",
            SessionStep::AwaitingCredentials => "awaiting_credentials",
            SessionStep::Complete => "complete",
            SessionStep::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error classification surfaced to session consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorKind {
    /// No authenticated EOA
    IdentityMissing,
    /// The user rejected a wallet prompt
    UserCancelled,
    /// Deployment check against the chain failed; the Safe address is still valid
    DerivationUnavailable,
    /// The trading backend rejected the signed challenge
    CredentialExchangeFailed,
    /// A suspension point exceeded its bound
    Timeout,
    /// The relayer rejected a submission
    RelaySubmissionFailed,
    /// A handle from an ended session was used
    HandleInvalidated,
    /// The result arrived after the session was ended or restarted
    Superseded,
    /// Wallet provider or signing fault
    Wallet,
    Configuration,
    /// HTTP or decoding failure talking to a backend
    Transport,
}

impl SessionErrorKind {
    /// Whether retrying the same operation can succeed without user intervention
    /// beyond asking again
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SessionErrorKind::Configuration | SessionErrorKind::HandleInvalidated
        )
    }
}

/// Structured error recorded on the session snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionErrorInfo {
    pub kind: SessionErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl SessionErrorInfo {
    pub fn new(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
        }
    }
}

impl fmt::Display for SessionErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// Whether a contract exists at the derived Safe address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    #[default]
    Unknown,
    Checking,
    Deployed,
    NotDeployed,
    /// Last check failed; retry is possible
    Unavailable,
}

/// Wallet identity as broadcast to observers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySnapshot {
    /// Checksummed EOA address, present only while connected
    pub eoa_address: Option<String>,
    pub email: Option<String>,
    /// Bumped on every identity change
    pub epoch: u64,
}

impl IdentitySnapshot {
    pub fn is_connected(&self) -> bool {
        self.eoa_address.is_some()
    }
}

/// Session machine state as broadcast to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub current_step: SessionStep,
    /// Step that was running when the machine entered `Failed`
    pub failed_step: Option<SessionStep>,
    pub eoa_address: Option<String>,
    pub safe_address: Option<String>,
    pub deployment: DeploymentStatus,
    pub session_id: Option<String>,
    pub session_created_at: Option<DateTime<Utc>>,
    pub session_error: Option<SessionErrorInfo>,
    pub is_trading_session_complete: bool,
    pub generation: u64,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            current_step: SessionStep::NotStarted,
            failed_step: None,
            eoa_address: None,
            safe_address: None,
            deployment: DeploymentStatus::Unknown,
            session_id: None,
            session_created_at: None,
            session_error: None,
            is_trading_session_complete: false,
            generation: 0,
        }
    }
}
