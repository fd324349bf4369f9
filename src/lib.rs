//! Transparent credential rotation and request replay for the gateway
//! client shell.
//!
//! Every outgoing call to the API gateway goes through one shared
//! [`GatewayClient`]. The client keeps a durable belief about access- and
//! refresh-credential expiry in a session directory shared by all processes
//! of the same session, exchanges the refresh credential for a fresh pair
//! exactly once no matter how many requests (or processes) detect expiry
//! concurrently, and replays the original call once the exchange succeeds.

pub mod config;
pub mod error;
pub mod security;
pub mod transport;
pub mod utils;

pub use config::SessionConfig;
pub use error::SessionError;
pub use security::classify::FailureKind;
pub use security::rotation::SessionState;
pub use security::token_store::TokenExpiry;
pub use transport::interceptor::GatewayClient;
pub use transport::{GatewayRequest, GatewayResponse, RequestResource};

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
