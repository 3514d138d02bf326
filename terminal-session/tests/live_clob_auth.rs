//! Live credential exchange against the Polymarket CLOB
//!
//! Needs TRADING_PRIVATE_KEY (in .env.local or the environment).
//! Run with: cargo test -p terminal-session --test live_clob_auth -- --ignored --nocapture

use std::sync::Arc;

use terminal_session::{
    ClobAuthExchange, CredentialExchange, LocalSigner, LocalWalletProvider, SessionConfig,
    SessionSigner, SignedChallenge, WalletIdentity, derive_safe_address,
};

fn load_env() {
    // Try multiple locations for .env file
    dotenvy::from_filename("../.env.local").ok();
    dotenvy::from_filename(".env.local").ok();
    dotenvy::dotenv().ok();
}

#[tokio::test]
#[ignore = "talks to clob.polymarket.com"]
async fn test_live_derive_api_key() {
    load_env();

    let private_key = std::env::var("TRADING_PRIVATE_KEY")
        .expect("TRADING_PRIVATE_KEY env var required - set in .env.local or as env var");
    let signer = LocalSigner::from_private_key(&private_key).expect("Invalid private key");
    let config = SessionConfig::from_env().expect("Invalid session config");

    let eoa = signer.address();
    let safe = derive_safe_address(eoa);
    println!("Wallet address: {}", eoa.to_checksum(None));
    println!("Safe address:   {}", safe.to_checksum(None));

    let exchange = ClobAuthExchange::new(config.clob_base_url.clone(), config.chain_id);
    let challenge = exchange.challenge(eoa, safe);
    let signature = signer.sign_hash(challenge.signing_hash).await.unwrap();
    let signed = SignedChallenge {
        challenge,
        signature: format!("0x{}", hex::encode(signature.as_bytes())),
    };

    let credentials = exchange.exchange(&signed).await.expect("credential exchange failed");
    println!("API key: {}", credentials.api_key);
    assert!(!credentials.api_key.is_empty());
}

#[tokio::test]
#[ignore = "needs TRADING_PRIVATE_KEY"]
async fn test_live_identity_from_env() {
    load_env();

    let provider = LocalWalletProvider::from_env().expect("TRADING_PRIVATE_KEY required");
    let identity = WalletIdentity::new(Arc::new(provider));

    let eoa = identity.connect().await.unwrap();
    println!("Connected as {}", eoa.to_checksum(None));
    assert_eq!(identity.signer().map(|s| s.address()), Some(eoa));
}
