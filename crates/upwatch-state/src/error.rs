//! Error types for the upwatch state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors surfaced by the roster and the status event log.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("encoding error: {0}")]
    Encode(String),

    #[error("corrupt record: {0}")]
    Decode(String),

    #[error("duplicate status event {0}")]
    DuplicateEvent(String),

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("invalid server id {0:?}")]
    InvalidId(String),

    #[error("invalid IPv4 address {0:?}")]
    InvalidAddress(String),
}
