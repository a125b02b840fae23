//! TradeQR Core - the pairing-session protocol behind QR trade pairing.
//!
//! This crate implements:
//! - Pairing code generation and normalization
//! - Per-origin rate limiting of session creation
//! - The session store abstraction (in-memory and SQLite)
//! - The session lifecycle state machine (create, join, get, cancel, expiry)

#![forbid(unsafe_code)]

// Core state machine
pub mod session;

// Infrastructure
pub mod store;
pub mod rate_limit;
pub mod code;
pub mod clock;

// Supporting modules
pub mod errors;
pub mod types;

// Optional storage implementations
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

#[cfg(test)]
mod proptests;

pub use errors::{ErrorCategory, SessionError};
pub use session::{Cancellation, SessionConfig, SessionManager};
pub use types::{CreateSessionRequest, DomainParams, Session, SessionState, SessionView};
