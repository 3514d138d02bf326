//! Core types for the trading session
//!
//! This crate defines the serializable vocabulary shared by the session
//! engine and its consumers: session steps, error classification, deployment
//! status and the snapshots broadcast to observers.

pub mod session;

pub use session::{
    DeploymentStatus, IdentitySnapshot, SessionErrorInfo, SessionErrorKind, SessionSnapshot,
    SessionStep,
};
