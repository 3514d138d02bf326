//! Trading Session API Server
//!
//! HTTP API server exposing wallet identity and the trading session lifecycle.

mod routes;

use anyhow::Context;
use axum::{
    http::{header, Method},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use terminal_session::{
    ClobAuthExchange, HttpRelayTransport, JsonRpcChainReader, LocalWalletProvider,
    SafeAddressResolver, SessionConfig, TradingClientFactory, TradingSessionMachine,
    WalletIdentity,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub identity: Arc<WalletIdentity>,
    pub machine: Arc<TradingSessionMachine>,
    pub factory: Arc<TradingClientFactory>,
}

impl AppState {
    pub fn new(
        identity: Arc<WalletIdentity>,
        machine: Arc<TradingSessionMachine>,
        factory: Arc<TradingClientFactory>,
    ) -> Self {
        Self {
            identity,
            machine,
            factory,
        }
    }
}

/// Keep the trading client in step with the session: a client built for an
/// ended session is invalidated as soon as the machine reports the change
fn spawn_client_sync(state: &AppState) {
    let machine = state.machine.clone();
    let factory = state.factory.clone();
    let mut updates = machine.subscribe();

    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            if !machine.state().is_ready() {
                factory.reset();
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env.local file
    if let Err(e) = dotenvy::from_filename(".env.local") {
        // Not an error if the file doesn't exist
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env.local: {}", e);
        }
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,terminal_api=debug,terminal_session=debug")
            }),
        )
        .init();

    info!("Starting Trading Session API");

    let config = SessionConfig::from_env().context("Invalid session configuration")?;
    if config.builder_credentials.is_some() {
        info!("Builder credentials found - relay submissions will be attributed");
    } else {
        info!("No builder credentials found - relay submissions are unauthenticated");
    }

    // Wallet identity
    let provider = LocalWalletProvider::from_env().context("Failed to load wallet provider")?;
    let identity = Arc::new(WalletIdentity::new(Arc::new(provider)));

    // Silent resume of an existing provider session
    match identity.resume().await {
        Ok(Some(eoa)) => info!("Resumed wallet session for {}", eoa),
        Ok(None) => info!("No wallet session to resume - connect via POST /api/wallet/connect"),
        Err(e) => warn!("Failed to resume wallet session: {}", e),
    }

    // Session pipeline
    let chain = Arc::new(JsonRpcChainReader::new(config.rpc_url.clone()));
    let resolver = Arc::new(SafeAddressResolver::new(chain, &config));
    let exchange = Arc::new(ClobAuthExchange::new(
        config.clob_base_url.clone(),
        config.chain_id,
    ));
    let relay_transport = Arc::new(HttpRelayTransport::new(
        config.relay_base_url.clone(),
        config.builder_credentials.clone(),
    ));
    let factory = Arc::new(TradingClientFactory::new(config.clob_base_url.clone()));

    let machine = TradingSessionMachine::new(
        identity.clone(),
        resolver,
        exchange,
        relay_transport,
        config,
    );
    machine.watch_identity();

    // Create app state
    let state = AppState::new(identity, machine, factory);
    spawn_client_sync(&state);

    // Configure CORS for frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    // Build router
    let app = Router::new()
        .nest("/api", routes::api_routes())
        .layer(cors)
        .with_state(state);

    // Start server
    let port = std::env::var("SERVER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3001);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
