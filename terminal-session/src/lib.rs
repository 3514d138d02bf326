//! Terminal Session - trading session bootstrap for Polymarket
//!
//! This crate provides:
//! - Wallet identity over an embedded-wallet provider
//! - Safe address derivation and deployment checks
//! - CLOB credential exchange (EIP-712 L1 auth)
//! - Gasless Safe transactions through the relayer
//! - The session state machine and the trading client factory

pub mod auth;
pub mod clob_client;
pub mod config;
pub mod eip712;
pub mod factory;
pub mod identity;
pub mod machine;
pub mod relay;
pub mod safe;
pub mod session;
pub mod types;
pub mod wallet;

pub use auth::{AuthChallenge, ClobAuthExchange, CredentialExchange, SignedChallenge};
pub use clob_client::ClobClient;
pub use config::SessionConfig;
pub use factory::TradingClientFactory;
pub use identity::WalletIdentity;
pub use machine::TradingSessionMachine;
pub use relay::{
    HttpRelayTransport, MetaTransaction, NonceRegistry, OperationType, RelayClient, RelayReceipt,
    RelayRequest, RelayTransport, SafeNonce,
};
pub use safe::{
    derive_safe_address, ChainReader, JsonRpcChainReader, SafeAddressResolver, SafeDerivation,
};
pub use session::{ReadySession, SessionState, TradingSession};
pub use types::*;
pub use wallet::{LocalSigner, LocalWalletProvider, SessionSigner, UserInfo, WalletProvider};
