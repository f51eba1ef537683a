//! Registry error types.

use thiserror::Error;

/// Errors raised by the roster replica.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("roster replica already bootstrapped")]
    AlreadyBootstrapped,

    #[error("roster snapshot read failed: {0}")]
    Snapshot(#[from] upwatch_state::StateError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors from the registry event bus transport.
#[derive(Debug, Error)]
pub enum BusError {
    /// Connection-level failure; the consumer backs off and retries.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The source will never yield again.
    #[error("bus closed")]
    Closed,

    #[error("encode error: {0}")]
    Encode(String),
}
