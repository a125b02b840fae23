//! tradeqr-server: HTTP boundary for the TradeQR pairing-session protocol
//!
//! Resolves callers through an identity collaborator, maps lifecycle
//! outcomes to status codes, and runs the background expiry sweep.

pub mod api;
pub mod config;
pub mod identity;
pub mod metrics;
pub mod server;

pub use config::ServerConfig;
pub use server::TradeServer;
