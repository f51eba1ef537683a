//! upwatch-registry: process-local replica of the server roster.
//!
//! The replica is bootstrapped from a full roster read and then kept current
//! by a single consumer task applying [`RosterMutation`]s from the registry
//! event bus.
//!
//! # Architecture
//!
//! ```text
//! MutationSource (MQTT topic | in-memory channel)
//!   └── RosterConsumer task ── decode ── RosterReplica::apply
//!                                          ├── buffer until bootstrap
//!                                          ├── last-write-wins on revision
//!                                          └── copy-on-write map swap
//! Health prober ── RosterReplica::snapshot() → Arc<HashMap<id, Endpoint>>
//! ```
//!
//! Delivery is at-least-once and may reorder, so every mutation carries the
//! canonical roster's revision. Drops leave a tombstone; an upsert older than
//! the tombstone is discarded.
//!
//! [`RosterMutation`]: upwatch_state::RosterMutation

pub mod backoff;
pub mod bus;
pub mod consumer;
pub mod error;
pub mod replica;

pub use backoff::Backoff;
pub use bus::{
    MemoryPublisher, MemorySource, MqttPublisher, MqttSettings, MqttSource, MutationSource,
    memory_bus,
};
pub use consumer::{ConsumerStats, RosterConsumer};
pub use error::{BusError, RegistryError, RegistryResult};
pub use replica::{ApplyOutcome, BootstrapReport, RosterReplica, RosterSnapshot};
