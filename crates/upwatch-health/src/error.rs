//! Status recorder errors.

use thiserror::Error;
use upwatch_state::StateError;

/// A failed half (or both halves) of a status record.
///
/// The roster write and the event append are independent; whichever one
/// succeeded stays applied.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("roster status write failed for {server_id}: {source}")]
    Roster {
        server_id: String,
        #[source]
        source: StateError,
    },

    #[error("status event append failed for {server_id}: {source}")]
    Event {
        server_id: String,
        #[source]
        source: StateError,
    },

    #[error("roster write and event append both failed for {server_id}: {roster}; {event}")]
    Both {
        server_id: String,
        roster: StateError,
        event: StateError,
    },
}

impl RecordError {
    pub fn server_id(&self) -> &str {
        match self {
            Self::Roster { server_id, .. }
            | Self::Event { server_id, .. }
            | Self::Both { server_id, .. } => server_id,
        }
    }
}

pub type RecordResult<T> = Result<T, RecordError>;
