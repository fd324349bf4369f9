use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the session subsystem.
///
/// Only `Rotation` and `RotationTimeout` mean the session is unrecoverable
/// and must be torn down. Every other failure reaches the caller exactly as
/// the network layer produced it; in particular a permission-denied response
/// is not an error of this layer and is returned as an ordinary response.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The gateway rejected the credential exchange. Carries the
    /// server-reported `message (code)` text when the gateway sent one,
    /// otherwise a generic rotation-failure message.
    #[error("{0}")]
    Rotation(String),

    /// The credential exchange did not complete within the configured window.
    #[error("credential rotation timed out after {0:?}")]
    RotationTimeout(Duration),

    /// The caller passed something this layer cannot resolve into a URL.
    #[error("unexpected request resource: {0}")]
    UnexpectedResource(String),

    /// The caller's request body could not be encoded. A programmer error
    /// on the calling side, not a session or storage fault.
    #[error("request body could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    /// Transport-level failure, bubbled to the caller untouched.
    #[error(transparent)]
    Network(#[from] reqwest::Error),

    /// The shared session storage could not be read or written.
    #[error("session storage: {0}")]
    Storage(#[from] std::io::Error),
}

/// Cloneable rotation outcome reason, broadcast to every in-flight waiter.
///
/// `SessionError` itself is not `Clone` (it owns `reqwest::Error`), so the
/// coordinator publishes this reduced form and each waiter lifts it back.
#[derive(Debug, Clone)]
pub enum RotationFailure {
    /// Gateway answered the refresh call with a non-success status.
    Server(String),
    /// The refresh call, or the wait on another holder, exceeded its bound.
    Timeout(Duration),
    /// The refresh call never produced a response.
    Transport(String),
}

impl From<RotationFailure> for SessionError {
    fn from(failure: RotationFailure) -> Self {
        match failure {
            RotationFailure::Server(msg) => SessionError::Rotation(msg),
            RotationFailure::Timeout(window) => SessionError::RotationTimeout(window),
            RotationFailure::Transport(msg) => SessionError::Rotation(msg),
        }
    }
}
