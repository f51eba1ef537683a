//! StateStore: redb-backed roster and status event log.
//!
//! Every roster write draws the next value of a store-wide revision counter
//! inside the same write transaction, so revisions are strictly increasing
//! across all endpoints and survive restarts. Status events are stored under
//! `{server_id}:{micros}` for per-server range scans and indexed under
//! `{micros}:{server_id}` for fleet-wide ones.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::ports::{EventLog, RosterSource, RosterWriter};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create missing tables and rebuild the time index of a log written
    /// before it existed.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(ENDPOINTS).map_err(map_err!(Table))?;
        txn.open_table(TOMBSTONES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        {
            let events = txn.open_table(STATUS_EVENTS).map_err(map_err!(Table))?;
            let mut index = txn.open_table(STATUS_BY_TIME).map_err(map_err!(Table))?;
            let needs_backfill = index.first().map_err(map_err!(Storage))?.is_none()
                && events.first().map_err(map_err!(Storage))?.is_some();
            if needs_backfill {
                let mut rebuilt = 0u64;
                for entry in events.iter().map_err(map_err!(Storage))? {
                    let (_, value) = entry.map_err(map_err!(Storage))?;
                    let event: StatusEvent =
                        serde_json::from_slice(value.value()).map_err(map_err!(Decode))?;
                    let key = time_key(&event.server_id, &event.timestamp);
                    index
                        .insert(key.as_str(), value.value())
                        .map_err(map_err!(Storage))?;
                    rebuilt += 1;
                }
                info!(rebuilt, "status time index rebuilt");
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Draw the next roster revision inside an open write transaction.
    fn next_revision(txn: &WriteTransaction) -> StateResult<Revision> {
        let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
        let current = meta
            .get(REVISION_KEY)
            .map_err(map_err!(Storage))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        let next = current + 1;
        meta.insert(REVISION_KEY, next).map_err(map_err!(Storage))?;
        Ok(next)
    }

    /// Keep locally issued revisions ahead of a persisted foreign one.
    fn raise_revision(txn: &WriteTransaction, seen: Revision) -> StateResult<()> {
        let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
        let current = meta
            .get(REVISION_KEY)
            .map_err(map_err!(Storage))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        if seen > current {
            meta.insert(REVISION_KEY, seen).map_err(map_err!(Storage))?;
        }
        Ok(())
    }

    fn read_endpoint(txn: &WriteTransaction, server_id: &str) -> StateResult<Option<Endpoint>> {
        let table = txn.open_table(ENDPOINTS).map_err(map_err!(Table))?;
        let found = table.get(server_id).map_err(map_err!(Storage))?;
        match found {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Decode))?,
            )),
            None => Ok(None),
        }
    }

    fn read_endpoints(txn: &ReadTransaction) -> StateResult<Vec<Endpoint>> {
        let table = txn.open_table(ENDPOINTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Storage))? {
            let (_, value) = entry.map_err(map_err!(Storage))?;
            let ep: Endpoint = serde_json::from_slice(value.value()).map_err(map_err!(Decode))?;
            results.push(ep);
        }
        Ok(results)
    }

    /// Highest revision the roster holds for an id, live or dropped.
    fn known_revision(txn: &WriteTransaction, server_id: &str) -> StateResult<Revision> {
        let row = Self::read_endpoint(txn, server_id)?.map_or(0, |ep| ep.revision);
        let tombstones = txn.open_table(TOMBSTONES).map_err(map_err!(Table))?;
        let dropped = tombstones
            .get(server_id)
            .map_err(map_err!(Storage))?
            .map_or(0, |guard| guard.value());
        Ok(row.max(dropped))
    }

    fn write_endpoint(txn: &WriteTransaction, endpoint: &Endpoint) -> StateResult<()> {
        let value = serde_json::to_vec(endpoint).map_err(map_err!(Encode))?;
        let mut table = txn.open_table(ENDPOINTS).map_err(map_err!(Table))?;
        table
            .insert(endpoint.id.as_str(), value.as_slice())
            .map_err(map_err!(Storage))?;
        let mut tombstones = txn.open_table(TOMBSTONES).map_err(map_err!(Table))?;
        tombstones
            .remove(endpoint.id.as_str())
            .map_err(map_err!(Storage))?;
        Ok(())
    }

    /// Remove the row and leave a tombstone. Returns whether a row existed.
    fn remove_endpoint(
        txn: &WriteTransaction,
        server_id: &str,
        revision: Revision,
    ) -> StateResult<bool> {
        let mut table = txn.open_table(ENDPOINTS).map_err(map_err!(Table))?;
        let existed = table.remove(server_id).map_err(map_err!(Storage))?.is_some();
        let mut tombstones = txn.open_table(TOMBSTONES).map_err(map_err!(Table))?;
        tombstones
            .insert(server_id, revision)
            .map_err(map_err!(Storage))?;
        Ok(existed)
    }

    // ── Roster ─────────────────────────────────────────────────────

    /// Insert or replace an endpoint. Returns the stored row with its new revision.
    pub fn put_endpoint(&self, endpoint: &Endpoint) -> StateResult<Endpoint> {
        endpoint.validate()?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut stored = endpoint.clone();
        stored.revision = Self::next_revision(&txn)?;
        Self::write_endpoint(&txn, &stored)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(server_id = %stored.id, revision = stored.revision, "endpoint stored");
        Ok(stored)
    }

    /// Get an endpoint by id.
    pub fn get_endpoint(&self, server_id: &str) -> StateResult<Option<Endpoint>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENDPOINTS).map_err(map_err!(Table))?;
        match table.get(server_id).map_err(map_err!(Storage))? {
            Some(guard) => {
                let ep: Endpoint =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Decode))?;
                Ok(Some(ep))
            }
            None => Ok(None),
        }
    }

    /// Remove an endpoint. Returns the drop mutation when it existed.
    pub fn delete_endpoint(&self, server_id: &str) -> StateResult<Option<RosterMutation>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        if Self::read_endpoint(&txn, server_id)?.is_none() {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(None);
        }
        let revision = Self::next_revision(&txn)?;
        Self::remove_endpoint(&txn, server_id, revision)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%server_id, revision, "endpoint deleted");
        Ok(Some(RosterMutation::Drop {
            id: server_id.to_string(),
            revision,
        }))
    }

    /// Store an unversioned upsert request under the next revision. The
    /// observed status of an existing row is kept.
    fn persist_request(
        &self,
        id: &str,
        address: &str,
        display_name: &str,
    ) -> StateResult<RosterMutation> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let last_known_status = Self::read_endpoint(&txn, id)?.is_some_and(|ep| ep.last_known_status);
        let stored = Endpoint {
            last_known_status,
            revision: Self::next_revision(&txn)?,
            ..Endpoint::new(id, address, display_name)
        };
        Self::write_endpoint(&txn, &stored)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(server_id = %id, revision = stored.revision, "roster request stored");
        Ok(RosterMutation::from(&stored))
    }

    /// Delete every status event of a server. Returns the number removed.
    pub fn purge_server_events(&self, server_id: &str) -> StateResult<u64> {
        validate_server_id(server_id)?;
        let lo = format!("{server_id}:");
        let hi = format!("{server_id};");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut table = txn.open_table(STATUS_EVENTS).map_err(map_err!(Table))?;
            let mut keys: Vec<String> = Vec::new();
            for entry in table
                .range(lo.as_str()..hi.as_str())
                .map_err(map_err!(Storage))?
            {
                let (key, _) = entry.map_err(map_err!(Storage))?;
                keys.push(key.value().to_string());
            }
            let mut index = txn.open_table(STATUS_BY_TIME).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Storage))?;
                if let Some((_, micros)) = key.rsplit_once(':') {
                    index
                        .remove(format!("{micros}:{server_id}").as_str())
                        .map_err(map_err!(Storage))?;
                }
            }
            keys.len() as u64
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%server_id, removed, "status events purged");
        Ok(removed)
    }
}

impl RosterSource for StateStore {
    fn list_endpoints(&self) -> StateResult<Vec<Endpoint>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        Self::read_endpoints(&txn)
    }

    fn roster_image(&self) -> StateResult<RosterImage> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let endpoints = Self::read_endpoints(&txn)?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        let revision = meta
            .get(REVISION_KEY)
            .map_err(map_err!(Storage))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        Ok(RosterImage {
            endpoints,
            revision,
        })
    }
}

impl RosterWriter for StateStore {
    fn update_status(&self, server_id: &str, status: bool) -> StateResult<RosterMutation> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut ep = Self::read_endpoint(&txn, server_id)?
            .ok_or_else(|| StateError::UnknownServer(server_id.to_string()))?;
        ep.last_known_status = status;
        ep.revision = Self::next_revision(&txn)?;
        Self::write_endpoint(&txn, &ep)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(RosterMutation::from(&ep))
    }

    fn persist(&self, mutation: &RosterMutation) -> StateResult<Option<RosterMutation>> {
        mutation.validate()?;
        let revision = mutation.revision();
        if revision == 0 {
            return match mutation {
                RosterMutation::Upsert {
                    id,
                    address,
                    display_name,
                    ..
                } => self.persist_request(id, address, display_name).map(Some),
                RosterMutation::Drop { id, .. } => self.delete_endpoint(id),
            };
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        if revision <= Self::known_revision(&txn, mutation.id())? {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(None);
        }
        match mutation {
            RosterMutation::Upsert {
                id,
                address,
                display_name,
                last_known_status,
                revision,
            } => {
                let ep = Endpoint {
                    id: id.clone(),
                    address: address.clone(),
                    display_name: display_name.clone(),
                    last_known_status: *last_known_status,
                    revision: *revision,
                };
                Self::write_endpoint(&txn, &ep)?;
            }
            RosterMutation::Drop { id, revision } => {
                Self::remove_endpoint(&txn, id, *revision)?;
            }
        }
        Self::raise_revision(&txn, revision)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(server_id = %mutation.id(), revision, "roster mutation persisted");
        Ok(Some(mutation.clone()))
    }
}

impl EventLog for StateStore {
    fn append(&self, event: &StatusEvent) -> StateResult<()> {
        validate_server_id(&event.server_id)?;
        let key = event.table_key();
        let index_key = time_key(&event.server_id, &event.timestamp);
        let value = serde_json::to_vec(event).map_err(map_err!(Encode))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(STATUS_EVENTS).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Storage))?.is_some() {
                return Err(StateError::DuplicateEvent(key));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Storage))?;
            let mut index = txn.open_table(STATUS_BY_TIME).map_err(map_err!(Table))?;
            index
                .insert(index_key.as_str(), value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn query(&self, server_id: &str, window: TimeWindow) -> StateResult<Vec<StatusEvent>> {
        if window.end <= window.start {
            return Ok(Vec::new());
        }
        let lo = event_key(server_id, &window.start);
        let hi = event_key(server_id, &window.end);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STATUS_EVENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(lo.as_str()..hi.as_str())
            .map_err(map_err!(Storage))?
        {
            let (_, value) = entry.map_err(map_err!(Storage))?;
            let event: StatusEvent =
                serde_json::from_slice(value.value()).map_err(map_err!(Decode))?;
            // Keys are truncated to microseconds; the window is exact.
            if window.contains(&event.timestamp) {
                results.push(event);
            }
        }
        Ok(results)
    }

    fn aggregate_by_server(&self, window: TimeWindow) -> StateResult<Vec<ServerBucket>> {
        if window.end <= window.start {
            return Ok(Vec::new());
        }
        let lo = time_key_floor(&window.start);
        let hi = time_key_ceil(&window.end);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STATUS_BY_TIME).map_err(map_err!(Table))?;
        let mut buckets: BTreeMap<ServerId, ServerBucket> = BTreeMap::new();
        for entry in table
            .range(lo.as_str()..hi.as_str())
            .map_err(map_err!(Storage))?
        {
            let (_, value) = entry.map_err(map_err!(Storage))?;
            let event: StatusEvent =
                serde_json::from_slice(value.value()).map_err(map_err!(Decode))?;
            if !window.contains(&event.timestamp) {
                continue;
            }
            let bucket = buckets
                .entry(event.server_id.clone())
                .or_insert_with(|| ServerBucket {
                    server_id: event.server_id.clone(),
                    event_count: 0,
                    credit_minutes: 0.0,
                    last_status: event.status,
                    last_seen: event.timestamp,
                });
            bucket.event_count += 1;
            bucket.credit_minutes += event.credit_minutes;
            // The index ascends by time.
            bucket.last_status = event.status;
            bucket.last_seen = event.timestamp;
        }
        Ok(buckets.into_values().collect())
    }

    fn last_event(&self, server_id: &str, window: TimeWindow) -> StateResult<Option<StatusEvent>> {
        if window.end <= window.start {
            return Ok(None);
        }
        let lo = event_key(server_id, &window.start);
        let hi = event_key(server_id, &window.end);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STATUS_EVENTS).map_err(map_err!(Table))?;
        let mut range = table
            .range(lo.as_str()..hi.as_str())
            .map_err(map_err!(Storage))?;
        while let Some(entry) = range.next_back() {
            let (_, value) = entry.map_err(map_err!(Storage))?;
            let event: StatusEvent =
                serde_json::from_slice(value.value()).map_err(map_err!(Decode))?;
            if window.contains(&event.timestamp) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}
