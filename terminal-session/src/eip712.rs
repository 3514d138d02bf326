//! EIP-712 typed data for the trading session
//!
//! Two payloads are signed with the EOA:
//! 1. `ClobAuth` - L1 authentication when deriving/creating CLOB API keys
//! 2. `SafeTx` - Safe transactions forwarded by the relayer

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::signers::Signature;
use alloy::sol;
use alloy::sol_types::{eip712_domain, Eip712Domain, SolStruct};

// ============================================================================
// L1 Auth Constants
// ============================================================================

/// The fixed message for CLOB auth
pub const CLOB_AUTH_MESSAGE: &str = "This message attests that I control the given wallet";

// ============================================================================
// EIP-712 Struct Definitions using sol! macro
// ============================================================================

// IMPORTANT: Alloy's sol! macro allows "address address;" syntax which produces
// the correct EIP-712 type hash "ClobAuth(address address,string timestamp,uint256 nonce,string message)"
sol! {
    struct ClobAuth {
        address address;
        string timestamp;
        uint256 nonce;
        string message;
    }
}

// Safe v1.3 transaction; field names are part of the type hash
sol! {
    #[derive(Debug)]
    struct SafeTx {
        address to;
        uint256 value;
        bytes data;
        uint8 operation;
        uint256 safeTxGas;
        uint256 baseGas;
        uint256 gasPrice;
        address gasToken;
        address refundReceiver;
        uint256 nonce;
    }
}

// ============================================================================
// EIP-712 Domains
// ============================================================================

/// Domain for ClobAuth (L1 authentication)
pub fn clob_auth_domain(chain_id: u64) -> Eip712Domain {
    eip712_domain! {
        name: "ClobAuthDomain",
        version: "1",
        chain_id: chain_id,
    }
}

/// Domain for transactions executed by a specific Safe
pub fn safe_domain(chain_id: u64, safe: Address) -> Eip712Domain {
    eip712_domain! {
        chain_id: chain_id,
        verifying_contract: safe,
    }
}

// ============================================================================
// Signing Hashes
// ============================================================================

/// EIP-712 signing hash of the L1 auth attestation
pub fn clob_auth_signing_hash(chain_id: u64, address: Address, timestamp: u64, nonce: u64) -> B256 {
    let clob_auth = ClobAuth {
        address,
        timestamp: timestamp.to_string(),
        nonce: U256::from(nonce),
        message: CLOB_AUTH_MESSAGE.to_string(),
    };

    clob_auth.eip712_signing_hash(&clob_auth_domain(chain_id))
}

/// EIP-712 signing hash of a plain call (no refund, no gas token) from `safe`
pub fn safe_tx_signing_hash(
    chain_id: u64,
    safe: Address,
    to: Address,
    value: U256,
    data: Bytes,
    operation: u8,
    nonce: U256,
) -> B256 {
    let safe_tx = SafeTx {
        to,
        value,
        data,
        operation,
        safeTxGas: U256::ZERO,
        baseGas: U256::ZERO,
        gasPrice: U256::ZERO,
        gasToken: Address::ZERO,
        refundReceiver: Address::ZERO,
        nonce,
    };

    safe_tx.eip712_signing_hash(&safe_domain(chain_id, safe))
}

/// Pack a personal-message signature over a Safe tx hash into Safe's
/// `eth_sign` format: v is shifted by 4 (27/28 -> 31/32)
pub fn pack_safe_signature(signature: &Signature) -> String {
    let mut bytes = signature.as_bytes();
    bytes[64] += 4;
    format!("0x{}", hex::encode(bytes))
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Get current timestamp in seconds
pub fn current_timestamp() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
