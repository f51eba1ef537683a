//! redb table definitions for the upwatch state store.
//!
//! Values are JSON-serialized domain types. Status events use the composite
//! key `{server_id}:{micros:020}` so a per-server time range is a single
//! ordered range scan; the same events are indexed under
//! `{micros:020}:{server_id}` so a fleet-wide window is one as well.

use redb::TableDefinition;

/// Canonical roster keyed by `{server_id}`.
pub const ENDPOINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("endpoints");

/// Status event log keyed by `{server_id}:{timestamp_micros}`.
pub const STATUS_EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("status_events");

/// Time-ordered index over the status log, keyed by
/// `{timestamp_micros}:{server_id}`. Written in the same transaction as
/// [`STATUS_EVENTS`].
pub const STATUS_BY_TIME: TableDefinition<&str, &[u8]> = TableDefinition::new("status_by_time");

/// Revision of the last drop per server id, so an older upsert arriving
/// late cannot resurrect it.
pub const TOMBSTONES: TableDefinition<&str, u64> = TableDefinition::new("tombstones");

/// Store-wide counters.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key in [`META`] holding the last issued roster revision.
pub const REVISION_KEY: &str = "revision";
