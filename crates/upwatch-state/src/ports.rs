//! Collaborator seams.
//!
//! The replica, recorder and reconstructor are written against these traits
//! rather than against [`StateStore`](crate::StateStore), so tests can swap in
//! failing or recording doubles.

use crate::error::StateResult;
use crate::types::{Endpoint, RosterImage, RosterMutation, ServerBucket, StatusEvent, TimeWindow};

/// Full read of the canonical roster.
pub trait RosterSource: Send + Sync {
    /// All non-deleted endpoints, in no particular order.
    fn list_endpoints(&self) -> StateResult<Vec<Endpoint>>;

    /// All endpoints plus the last issued revision, read atomically.
    fn roster_image(&self) -> StateResult<RosterImage>;
}

/// Authoritative status write-back.
pub trait RosterWriter: Send + Sync {
    /// Persist the observed status; returns the mutation the write produced.
    fn update_status(&self, server_id: &str, status: bool) -> StateResult<RosterMutation>;

    /// Persist a mutation received from the registry bus.
    ///
    /// A revision-0 request is assigned the next revision; a versioned
    /// mutation is last-write-wins against the stored row and tombstone.
    /// Returns the mutation as stored, or `None` when it changed nothing.
    fn persist(&self, mutation: &RosterMutation) -> StateResult<Option<RosterMutation>>;
}

/// Append-only status history.
pub trait EventLog: Send + Sync {
    fn append(&self, event: &StatusEvent) -> StateResult<()>;

    /// Events for one server with `timestamp ∈ [window.start, window.end)`,
    /// ascending by timestamp.
    fn query(&self, server_id: &str, window: TimeWindow) -> StateResult<Vec<StatusEvent>>;

    /// One bucket per server that has at least one event in the window,
    /// ordered by server id.
    fn aggregate_by_server(&self, window: TimeWindow) -> StateResult<Vec<ServerBucket>>;

    /// Latest event for one server inside the window.
    fn last_event(&self, server_id: &str, window: TimeWindow) -> StateResult<Option<StatusEvent>>;
}

impl<T: RosterSource + ?Sized> RosterSource for std::sync::Arc<T> {
    fn list_endpoints(&self) -> StateResult<Vec<Endpoint>> {
        (**self).list_endpoints()
    }

    fn roster_image(&self) -> StateResult<RosterImage> {
        (**self).roster_image()
    }
}

impl<T: RosterWriter + ?Sized> RosterWriter for std::sync::Arc<T> {
    fn update_status(&self, server_id: &str, status: bool) -> StateResult<RosterMutation> {
        (**self).update_status(server_id, status)
    }

    fn persist(&self, mutation: &RosterMutation) -> StateResult<Option<RosterMutation>> {
        (**self).persist(mutation)
    }
}

impl<T: EventLog + ?Sized> EventLog for std::sync::Arc<T> {
    fn append(&self, event: &StatusEvent) -> StateResult<()> {
        (**self).append(event)
    }

    fn query(&self, server_id: &str, window: TimeWindow) -> StateResult<Vec<StatusEvent>> {
        (**self).query(server_id, window)
    }

    fn aggregate_by_server(&self, window: TimeWindow) -> StateResult<Vec<ServerBucket>> {
        (**self).aggregate_by_server(window)
    }

    fn last_event(&self, server_id: &str, window: TimeWindow) -> StateResult<Option<StatusEvent>> {
        (**self).last_event(server_id, window)
    }
}
