//! upwatch-state: embedded roster and status event log for upwatch.
//!
//! Backed by [redb](https://docs.rs/redb), holds the canonical server roster
//! and the append-only log of status events that uptime reports are
//! reconstructed from.
//!
//! # Architecture
//!
//! ```text
//! StateStore (Arc<Database>)
//!   ├── ENDPOINTS      {server_id} → Endpoint (JSON)
//!   ├── TOMBSTONES     {server_id} → u64 (revision of the drop)
//!   ├── STATUS_EVENTS  {server_id}:{micros} → StatusEvent (JSON)
//!   ├── STATUS_BY_TIME {micros}:{server_id} → StatusEvent (JSON)
//!   └── META           "revision" → u64 (global write sequence)
//! ```
//!
//! The collaborator seams the rest of the workspace programs against are the
//! traits in [`ports`]: [`RosterSource`], [`RosterWriter`] and [`EventLog`].
//! `StateStore` implements all three.

pub mod clock;
pub mod error;
pub mod ports;
pub mod store;
pub mod tables;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StateError, StateResult};
pub use ports::{EventLog, RosterSource, RosterWriter};
pub use store::StateStore;
pub use types::*;
