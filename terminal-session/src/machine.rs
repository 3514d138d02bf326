//! Trading session state machine
//!
//! Drives `NotStarted → AwaitingWalletAuth → DerivingSafeAddress →
//! AwaitingCredentials → Complete`, with `Failed` reachable from every running
//! step. The machine is the only writer of the step and of the session.
//!
//! Every attempt captures the machine generation when it starts. Ending the
//! session (explicitly, or because the wallet identity changed) bumps the
//! generation; an attempt that observes a different generation after any
//! await point drops its result with [`TradingError::Superseded`].

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use alloy::primitives::Address;
use parking_lot::Mutex;
use terminal_core::{DeploymentStatus, SessionErrorInfo, SessionSnapshot, SessionStep};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::{CredentialExchange, SignedChallenge};
use crate::config::SessionConfig;
use crate::identity::WalletIdentity;
use crate::relay::{NonceRegistry, RelayClient, RelayTransport};
use crate::safe::SafeAddressResolver;
use crate::session::{ReadySession, SessionState, TradingSession};
use crate::types::{Result, TradingError};
use crate::wallet::SessionSigner;

#[derive(Default)]
struct MachineState {
    step: SessionStep,
    failed_step: Option<SessionStep>,
    generation: u64,
    /// EOA the current (or last) attempt is bound to
    eoa: Option<Address>,
    safe: Option<Address>,
    deployment: DeploymentStatus,
    ready: Option<ReadySession>,
    error: Option<SessionErrorInfo>,
    /// Signature over the credential challenge, kept until credentials are
    /// obtained so a retry does not prompt the wallet again
    signed_challenge: Option<SignedChallenge>,
    /// Finished initialization attempts
    attempts: u64,
    last_outcome: Option<std::result::Result<ReadySession, SessionErrorInfo>>,
}

impl MachineState {
    fn snapshot(&self) -> SessionSnapshot {
        let session = self.ready.as_ref().map(|ready| &ready.session);
        SessionSnapshot {
            current_step: self.step,
            failed_step: self.failed_step,
            eoa_address: self.eoa.map(|a| a.to_checksum(None)),
            safe_address: self.safe.map(|a| a.to_checksum(None)),
            deployment: self.deployment,
            session_id: session.map(|s| s.id().to_string()),
            session_created_at: session.map(|s| s.created_at()),
            session_error: self.error.clone(),
            is_trading_session_complete: self.step == SessionStep::Complete && self.ready.is_some(),
            generation: self.generation,
        }
    }

    fn advance(&mut self, next: SessionStep) {
        if self.step.can_advance_to(next) {
            debug!(from = %self.step, to = %next, generation = self.generation, "Session step");
            self.step = next;
        } else {
            // Only reachable through a bug in the pipeline ordering
            error!(from = %self.step, to = %next, "Illegal session transition ignored");
        }
    }
}

/// Orchestrates wallet → Safe → credentials → ready
pub struct TradingSessionMachine {
    identity: Arc<WalletIdentity>,
    resolver: Arc<SafeAddressResolver>,
    exchange: Arc<dyn CredentialExchange>,
    relay_transport: Arc<dyn RelayTransport>,
    /// Outlives sessions: a rebuilt client for the same Safe must not reuse
    /// a nonce an ended client still has in flight
    nonces: NonceRegistry,
    config: SessionConfig,
    state: Mutex<MachineState>,
    updates: watch::Sender<SessionSnapshot>,
    /// Serializes initialization attempts
    init_lock: tokio::sync::Mutex<()>,
}

impl TradingSessionMachine {
    pub fn new(
        identity: Arc<WalletIdentity>,
        resolver: Arc<SafeAddressResolver>,
        exchange: Arc<dyn CredentialExchange>,
        relay_transport: Arc<dyn RelayTransport>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (updates, _) = watch::channel(SessionSnapshot::default());
        Arc::new(Self {
            identity,
            resolver,
            exchange,
            relay_transport,
            nonces: NonceRegistry::new(),
            config,
            state: Mutex::new(MachineState::default()),
            updates,
            init_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn identity(&self) -> &Arc<WalletIdentity> {
        &self.identity
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.lock().snapshot()
    }

    /// Receive every step, error and deployment change
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.updates.subscribe()
    }

    /// Ready session for the currently connected identity, if any
    pub fn state(&self) -> SessionState {
        let current_eoa = self.identity.eoa_address();
        let state = self.state.lock();
        match &state.ready {
            Some(ready)
                if state.step == SessionStep::Complete
                    && !ready.session.is_revoked()
                    && current_eoa == Some(ready.session.eoa()) =>
            {
                SessionState::Ready(ready.clone())
            }
            _ => SessionState::NotReady,
        }
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    /// Run (or resume) the pipeline until the session is ready
    ///
    /// Concurrent callers are serialized; a caller that waited on another
    /// attempt receives that attempt's outcome instead of starting a new one.
    pub async fn initialize_trading_session(self: &Arc<Self>) -> Result<ReadySession> {
        let seen_attempts = self.state.lock().attempts;
        let _guard = self.init_lock.lock().await;

        if let Some(joined) = self.joined_outcome(seen_attempts) {
            return joined;
        }

        let result = self.run_attempt().await;

        {
            let mut state = self.state.lock();
            state.attempts += 1;
            state.last_outcome = Some(match &result {
                Ok(ready) => Ok(ready.clone()),
                Err(e) => Err(e.to_info()),
            });
        }

        result
    }

    /// Outcome to hand back without running a new attempt, if any
    fn joined_outcome(&self, seen_attempts: u64) -> Option<Result<ReadySession>> {
        if let SessionState::Ready(ready) = self.state() {
            debug!(session = %ready.session.id(), "Session already complete");
            return Some(Ok(ready));
        }

        let state = self.state.lock();
        if state.attempts == seen_attempts {
            return None;
        }
        match &state.last_outcome {
            Some(Err(info)) => {
                debug!("Joining failed initialization attempt: {}", info);
                Some(Err(TradingError::JoinedAttempt(info.clone())))
            }
            // A success that is no longer ready was ended in between
            Some(Ok(_)) | None => None,
        }
    }

    async fn run_attempt(self: &Arc<Self>) -> Result<ReadySession> {
        // A completed session for a different identity must not survive
        if self.state.lock().ready.is_some() {
            self.end_trading_session();
        }

        let Some(eoa) = self.identity.eoa_address() else {
            let err = TradingError::IdentityMissing;
            warn!("Cannot initialize trading session: {}", err);
            self.modify(|state| state.error = Some(err.to_info()));
            return Err(err);
        };

        let (generation, resume_from) = self.begin_attempt(eoa);
        info!(eoa = %eoa, generation, from = %resume_from, "Initializing trading session");

        let mut step = resume_from;
        match self.drive(generation, eoa, &mut step).await {
            Ok(ready) => Ok(ready),
            Err(e) => {
                self.fail(generation, step, &e);
                Err(e)
            }
        }
    }

    /// Bind the attempt to `eoa` and decide where the pipeline (re)starts
    fn begin_attempt(&self, eoa: Address) -> (u64, SessionStep) {
        self.modify(|state| {
            if state.eoa != Some(eoa) {
                // New identity: everything derived from the old one is stale
                state.eoa = Some(eoa);
                state.safe = None;
                state.deployment = DeploymentStatus::Unknown;
                state.signed_challenge = None;
                state.failed_step = None;
            }

            let resume_from = match (state.step, state.failed_step) {
                (SessionStep::Failed, Some(failed)) => failed,
                _ => SessionStep::AwaitingWalletAuth,
            };
            state.error = None;
            (state.generation, resume_from)
        })
    }

    async fn drive(
        self: &Arc<Self>,
        generation: u64,
        eoa: Address,
        step: &mut SessionStep,
    ) -> Result<ReadySession> {
        // Wallet auth: signing capability for the authenticated EOA
        if *step == SessionStep::AwaitingWalletAuth {
            self.enter(generation, SessionStep::AwaitingWalletAuth)?;
        }
        let signer = self.acquire_signer(eoa)?;

        // Safe derivation is pure; the deployment check runs in the background
        if *step != SessionStep::AwaitingCredentials {
            *step = SessionStep::DerivingSafeAddress;
            self.enter(generation, SessionStep::DerivingSafeAddress)?;
        }
        let safe = self.resolver.derive(eoa);
        self.record_safe(generation, safe)?;

        // Credentials
        *step = SessionStep::AwaitingCredentials;
        self.enter(generation, SessionStep::AwaitingCredentials)?;

        let signed = self.signed_challenge(generation, eoa, safe, signer.as_ref()).await?;
        let credential_timeout = self.config.credential_timeout;
        let credentials = self
            .guarded(
                generation,
                bounded(
                    "credential exchange",
                    credential_timeout,
                    self.exchange.exchange(&signed),
                ),
            )
            .await?;

        let session = Arc::new(TradingSession::new(eoa, safe, credentials, generation));
        let relay = RelayClient::new(
            safe,
            signer,
            self.relay_transport.clone(),
            self.config.chain_id,
            self.config.relay_timeout,
        )
        .with_nonce(self.nonces.slot(safe));
        let ready = ReadySession {
            session,
            relay: Arc::new(relay),
        };

        self.complete(generation, &ready)?;
        Ok(ready)
    }

    fn acquire_signer(&self, eoa: Address) -> Result<Arc<dyn SessionSigner>> {
        let signer = self
            .identity
            .signer()
            .ok_or_else(|| TradingError::Wallet("Wallet has no signing capability".to_string()))?;

        if signer.address() != eoa {
            return Err(TradingError::Wallet(format!(
                "Signing capability belongs to {}, expected {}",
                signer.address(),
                eoa
            )));
        }
        Ok(signer)
    }

    /// Cached signature for (eoa, safe), or a fresh wallet prompt
    async fn signed_challenge(
        &self,
        generation: u64,
        eoa: Address,
        safe: Address,
        signer: &dyn SessionSigner,
    ) -> Result<SignedChallenge> {
        let cached = self.state.lock().signed_challenge.clone();
        if let Some(signed) = cached {
            if signed.challenge.eoa == eoa && signed.challenge.safe == safe {
                debug!(eoa = %eoa, "Reusing signed credential challenge");
                return Ok(signed);
            }
        }

        let challenge = self.exchange.challenge(eoa, safe);
        let signature_timeout = self.config.signature_timeout;
        let signature = self
            .guarded(
                generation,
                bounded(
                    "signature request",
                    signature_timeout,
                    signer.sign_hash(challenge.signing_hash),
                ),
            )
            .await?;

        let signed = SignedChallenge {
            challenge,
            signature: format!("0x{}", hex::encode(signature.as_bytes())),
        };

        let mut state = self.state.lock();
        check_generation(&state, generation)?;
        state.signed_challenge = Some(signed.clone());
        Ok(signed)
    }

    fn record_safe(self: &Arc<Self>, generation: u64, safe: Address) -> Result<()> {
        let spawn_check = self.try_modify(generation, |state| {
            state.safe = Some(safe);
            if self.resolver.cached(safe) == Some(true) {
                state.deployment = DeploymentStatus::Deployed;
            }
            // Answers hold for the generation; only Unknown and Unavailable
            // are checked again on a retry
            match state.deployment {
                DeploymentStatus::Deployed
                | DeploymentStatus::NotDeployed
                | DeploymentStatus::Checking => false,
                _ => {
                    state.deployment = DeploymentStatus::Checking;
                    true
                }
            }
        })?;

        debug!(safe = %safe, "Safe address derived");
        if spawn_check {
            self.spawn_deployment_check(generation, safe);
        }
        Ok(())
    }

    fn spawn_deployment_check(self: &Arc<Self>, generation: u64, safe: Address) {
        let machine = Arc::downgrade(self);
        let resolver = self.resolver.clone();

        tokio::spawn(async move {
            let status = deployment_status(&resolver, safe).await;
            if let Some(machine) = machine.upgrade() {
                machine.apply_deployment(generation, safe, status);
            }
        });
    }

    fn apply_deployment(&self, generation: u64, safe: Address, status: DeploymentStatus) {
        let applied = self.try_modify(generation, |state| {
            if state.safe == Some(safe) {
                state.deployment = status;
            }
        });
        if applied.is_err() {
            debug!(safe = %safe, "Discarding deployment result of an ended session");
        }
    }

    /// Re-run the deployment check for the current Safe
    pub async fn recheck_deployment(&self) -> Result<DeploymentStatus> {
        let (generation, safe) = {
            let state = self.state.lock();
            let safe = state.safe.ok_or_else(|| {
                TradingError::DerivationUnavailable("No Safe address derived yet".to_string())
            })?;
            (state.generation, safe)
        };

        self.try_modify(generation, |state| state.deployment = DeploymentStatus::Checking)?;
        let status = deployment_status(&self.resolver, safe).await;
        self.apply_deployment(generation, safe, status);
        Ok(status)
    }

    fn complete(&self, generation: u64, ready: &ReadySession) -> Result<()> {
        let result = self.try_modify(generation, |state| {
            state.advance(SessionStep::Complete);
            state.ready = Some(ready.clone());
            state.failed_step = None;
            state.error = None;
            state.signed_challenge = None;
        });

        match result {
            Ok(()) => {
                info!(
                    session = %ready.session.id(),
                    eoa = %ready.session.eoa(),
                    safe = %ready.session.safe(),
                    "Trading session complete"
                );
                Ok(())
            }
            Err(e) => {
                ready.session.revoke();
                ready.relay.invalidate();
                Err(e)
            }
        }
    }

    fn fail(&self, generation: u64, step: SessionStep, err: &TradingError) {
        if matches!(err, TradingError::Superseded { .. }) {
            debug!("Initialization attempt superseded: {}", err);
            return;
        }

        let recorded = self.try_modify(generation, |state| {
            // A resumed attempt can fail before it re-enters a step
            if state.step != SessionStep::Failed {
                state.advance(SessionStep::Failed);
            }
            state.failed_step = Some(step);
            state.error = Some(err.to_info());
        });

        if recorded.is_ok() {
            error!(step = %step, kind = ?err.kind(), "Trading session initialization failed: {}", err);
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// End the session from any state; idempotent and never waits on
    /// in-flight work, whose results are discarded when they arrive
    pub fn end_trading_session(&self) {
        let ended = {
            let mut state = self.state.lock();
            let idle = state.step == SessionStep::NotStarted
                && state.ready.is_none()
                && state.error.is_none()
                && state.eoa.is_none();
            if idle {
                return;
            }

            state.generation += 1;
            let ended = state.ready.take();
            state.step = SessionStep::NotStarted;
            state.failed_step = None;
            state.error = None;
            state.eoa = None;
            state.safe = None;
            state.deployment = DeploymentStatus::Unknown;
            state.signed_challenge = None;
            state.last_outcome = None;
            self.updates.send_replace(state.snapshot());
            ended
        };

        match ended {
            Some(ready) => {
                ready.session.revoke();
                ready.relay.invalidate();
                info!(session = %ready.session.id(), "Trading session ended");
            }
            None => info!("Trading session reset"),
        }
    }

    /// End any session bound to an EOA other than the connected one
    pub fn on_identity_changed(&self) {
        let current = self.identity.eoa_address();
        let bound = self.state.lock().eoa;

        if let Some(bound) = bound {
            if current != Some(bound) {
                info!(
                    previous = %bound,
                    current = ?current,
                    "Wallet identity changed, ending trading session"
                );
                self.end_trading_session();
            }
        }
    }

    /// Follow identity updates for the lifetime of the machine
    pub fn watch_identity(self: &Arc<Self>) -> JoinHandle<()> {
        let mut updates = self.identity.subscribe();
        let machine: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let Some(machine) = machine.upgrade() else {
                    break;
                };
                machine.on_identity_changed();
            }
            debug!("Identity watcher stopped");
        })
    }

    // ========================================================================
    // State helpers
    // ========================================================================

    fn enter(&self, generation: u64, step: SessionStep) -> Result<()> {
        self.try_modify(generation, |state| state.advance(step))
    }

    /// Mutate and broadcast
    fn modify<T>(&self, f: impl FnOnce(&mut MachineState) -> T) -> T {
        let mut state = self.state.lock();
        let out = f(&mut state);
        self.updates.send_replace(state.snapshot());
        out
    }

    /// Mutate and broadcast only if `generation` is still current
    fn try_modify<T>(&self, generation: u64, f: impl FnOnce(&mut MachineState) -> T) -> Result<T> {
        let mut state = self.state.lock();
        check_generation(&state, generation)?;
        let out = f(&mut state);
        self.updates.send_replace(state.snapshot());
        Ok(out)
    }

    /// Await `fut` unless the generation moves on first
    async fn guarded<T>(&self, generation: u64, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let mut updates = self.updates.subscribe();
        let superseded = async move {
            loop {
                let current = updates.borrow_and_update().generation;
                if current != generation {
                    return current;
                }
                if updates.changed().await.is_err() {
                    return std::future::pending().await;
                }
            }
        };

        tokio::select! {
            result = fut => {
                check_generation(&self.state.lock(), generation)?;
                result
            }
            actual = superseded => Err(TradingError::Superseded { expected: generation, actual }),
        }
    }
}

impl std::fmt::Debug for TradingSessionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TradingSessionMachine")
            .field("step", &state.step)
            .field("generation", &state.generation)
            .field("eoa", &state.eoa)
            .finish()
    }
}

fn check_generation(state: &MachineState, generation: u64) -> Result<()> {
    if state.generation != generation {
        return Err(TradingError::Superseded {
            expected: generation,
            actual: state.generation,
        });
    }
    Ok(())
}

async fn bounded<T>(
    operation: &'static str,
    after: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| TradingError::timeout(operation, after))?
}

async fn deployment_status(resolver: &SafeAddressResolver, safe: Address) -> DeploymentStatus {
    match resolver.check_deployment(safe).await {
        Ok(true) => DeploymentStatus::Deployed,
        Ok(false) => DeploymentStatus::NotDeployed,
        Err(e) => {
            warn!(safe = %safe, "Safe deployment status unavailable: {}", e);
            DeploymentStatus::Unavailable
        }
    }
}
