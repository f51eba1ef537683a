//! Domain types shared across upwatch.
//!
//! Endpoints and roster mutations describe the fleet; status events are the
//! immutable history that uptime is reconstructed from.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Opaque identifier of a registered server.
pub type ServerId = String;

/// Canonical roster write sequence. Strictly increasing across the roster.
pub type Revision = u64;

// ── Roster ────────────────────────────────────────────────────────

/// A registered network endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub id: ServerId,
    /// IPv4 address, dotted quad.
    pub address: String,
    pub display_name: String,
    pub last_known_status: bool,
    /// Revision of the roster write that produced this row.
    #[serde(default)]
    pub revision: Revision,
}

impl Endpoint {
    /// Build a fresh endpoint; the roster assigns the revision on write.
    pub fn new(id: impl Into<ServerId>, address: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            display_name: display_name.into(),
            last_known_status: false,
            revision: 0,
        }
    }

    /// Reject ids that would break the composite event key, and non-IPv4 addresses.
    pub fn validate(&self) -> StateResult<()> {
        validate_server_id(&self.id)?;
        self.address
            .parse::<Ipv4Addr>()
            .map_err(|_| StateError::InvalidAddress(self.address.clone()))?;
        Ok(())
    }
}

pub(crate) fn validate_server_id(id: &str) -> StateResult<()> {
    if id.is_empty() || id.contains(':') {
        return Err(StateError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Full roster read, together with the revision it is consistent with.
///
/// Every mutation at or below `revision` is already reflected in
/// `endpoints`, including drops, which leave no row behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterImage {
    pub endpoints: Vec<Endpoint>,
    pub revision: Revision,
}

/// A roster write as carried on the registry event bus.
///
/// Revision 0 marks an unversioned write request; the roster owner assigns
/// the revision when it persists it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RosterMutation {
    Upsert {
        id: ServerId,
        address: String,
        display_name: String,
        last_known_status: bool,
        revision: Revision,
    },
    Drop { id: ServerId, revision: Revision },
}

impl RosterMutation {
    pub fn id(&self) -> &str {
        match self {
            RosterMutation::Upsert { id, .. } | RosterMutation::Drop { id, .. } => id,
        }
    }

    pub fn revision(&self) -> Revision {
        match self {
            RosterMutation::Upsert { revision, .. } | RosterMutation::Drop { revision, .. } => {
                *revision
            }
        }
    }

    /// Same checks as a direct roster write, so a bad payload never reaches
    /// the replica.
    pub fn validate(&self) -> StateResult<()> {
        match self {
            RosterMutation::Upsert {
                id,
                address,
                display_name,
                ..
            } => Endpoint::new(id.as_str(), address.as_str(), display_name.as_str()).validate(),
            RosterMutation::Drop { id, .. } => validate_server_id(id),
        }
    }

    /// Decode a bus payload.
    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl From<&Endpoint> for RosterMutation {
    fn from(ep: &Endpoint) -> Self {
        RosterMutation::Upsert {
            id: ep.id.clone(),
            address: ep.address.clone(),
            display_name: ep.display_name.clone(),
            last_known_status: ep.last_known_status,
            revision: ep.revision,
        }
    }
}

// ── Status log ────────────────────────────────────────────────────

/// One observed status, appended by the status recorder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEvent {
    pub server_id: ServerId,
    pub status: bool,
    pub timestamp: DateTime<Utc>,
    /// Minutes the previous observation is credited for.
    pub credit_minutes: f64,
}

impl StatusEvent {
    /// Build the composite key for the status events table.
    pub fn table_key(&self) -> String {
        event_key(&self.server_id, &self.timestamp)
    }
}

// Pre-epoch instants clamp to zero; the log never holds them.
fn key_micros(at: &DateTime<Utc>) -> i64 {
    at.timestamp_micros().max(0)
}

pub(crate) fn event_key(server_id: &str, at: &DateTime<Utc>) -> String {
    format!("{server_id}:{:020}", key_micros(at))
}

/// Key in the time-ordered index: `{micros:020}:{server_id}`.
pub(crate) fn time_key(server_id: &str, at: &DateTime<Utc>) -> String {
    format!("{:020}:{server_id}", key_micros(at))
}

/// Lower bound of every time-index key at or after `at`'s microsecond.
pub(crate) fn time_key_floor(at: &DateTime<Utc>) -> String {
    format!("{:020}:", key_micros(at))
}

/// Lower bound of every time-index key past `at`'s microsecond.
pub(crate) fn time_key_ceil(at: &DateTime<Utc>) -> String {
    format!("{:020}:", key_micros(at).saturating_add(1))
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Every representable instant.
    pub fn all_time() -> Self {
        Self::new(DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
    }

    pub fn contains(&self, at: &DateTime<Utc>) -> bool {
        *at >= self.start && *at < self.end
    }
}

/// Per-server aggregate over a window.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerBucket {
    pub server_id: ServerId,
    pub event_count: u64,
    pub credit_minutes: f64,
    /// Status of the latest event inside the window.
    pub last_status: bool,
    pub last_seen: DateTime<Utc>,
}
