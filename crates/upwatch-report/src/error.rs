//! Report error types.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that fail a report generation.
#[derive(Debug, Error)]
pub enum ReportError {
    /// No server has a status event in the window.
    #[error("no server data found between {start} and {end}")]
    NoData {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("invalid report window: {0}")]
    InvalidWindow(String),

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("report delivery failed: {0}")]
    Delivery(String),

    #[error("state store error: {0}")]
    Store(#[from] upwatch_state::StateError),
}

pub type ReportResult<T> = Result<T, ReportError>;
