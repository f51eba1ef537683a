//! Roster consumer: the single writer of the replica.
//!
//! With a store attached the consumer is also the only roster writer of the
//! daemon process: every valid mutation is persisted first and the replica
//! applies what the store kept.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use upwatch_state::{RosterMutation, RosterWriter};

use crate::backoff::Backoff;
use crate::bus::MutationSource;
use crate::error::BusError;
use crate::replica::{ApplyOutcome, RosterReplica};

/// Counters returned when the consumer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub applied: u64,
    pub stale: u64,
    pub buffered: u64,
    pub malformed: u64,
    pub transport_errors: u64,
    pub store_errors: u64,
}

/// Drains a [`MutationSource`] into a [`RosterReplica`].
pub struct RosterConsumer<S> {
    source: S,
    replica: Arc<RosterReplica>,
    store: Option<Arc<dyn RosterWriter>>,
    backoff: Backoff,
}

impl<S: MutationSource> RosterConsumer<S> {
    pub fn new(source: S, replica: Arc<RosterReplica>) -> Self {
        Self {
            source,
            replica,
            store: None,
            backoff: Backoff::default(),
        }
    }

    /// Persist every mutation to `store` before it reaches the replica.
    pub fn with_store(mut self, store: Arc<dyn RosterWriter>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run until shutdown is signalled or the source closes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ConsumerStats {
        let mut stats = ConsumerStats::default();
        info!("roster consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                r = self.source.recv() => r,
                _ = shutdown.changed() => break,
            };

            match received {
                Ok(payload) => {
                    self.backoff.reset();
                    self.handle_payload(&payload, &mut stats).await;
                }
                Err(BusError::Closed) => {
                    info!("roster bus closed");
                    break;
                }
                Err(e) => {
                    stats.transport_errors += 1;
                    let delay = self.backoff.next_delay();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "roster bus error");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        info!(
            applied = stats.applied,
            stale = stats.stale,
            buffered = stats.buffered,
            malformed = stats.malformed,
            transport_errors = stats.transport_errors,
            store_errors = stats.store_errors,
            "roster consumer stopped"
        );
        stats
    }

    async fn handle_payload(&mut self, payload: &[u8], stats: &mut ConsumerStats) {
        let mutation = match RosterMutation::from_json(payload) {
            Ok(m) => m,
            Err(e) => {
                stats.malformed += 1;
                warn!(error = %e, bytes = payload.len(), "malformed roster mutation dropped");
                return;
            }
        };
        if let Err(e) = mutation.validate() {
            stats.malformed += 1;
            warn!(error = %e, server_id = %mutation.id(), "invalid roster mutation dropped");
            return;
        }

        let server_id = mutation.id().to_string();
        let mutation = match &self.store {
            Some(store) => {
                let store = Arc::clone(store);
                let persisted =
                    tokio::task::spawn_blocking(move || store.persist(&mutation)).await;
                match persisted {
                    Ok(Ok(Some(stored))) => stored,
                    Ok(Ok(None)) => {
                        stats.stale += 1;
                        debug!(%server_id, "stale roster mutation ignored by store");
                        return;
                    }
                    Ok(Err(e)) => {
                        stats.store_errors += 1;
                        warn!(%server_id, error = %e, "roster mutation not persisted");
                        return;
                    }
                    Err(e) => {
                        stats.store_errors += 1;
                        warn!(%server_id, error = %e, "roster persist task failed");
                        return;
                    }
                }
            }
            None => mutation,
        };
        match self.replica.apply(mutation) {
            ApplyOutcome::Applied => stats.applied += 1,
            ApplyOutcome::Stale => {
                stats.stale += 1;
                debug!(%server_id, "stale roster mutation ignored");
            }
            ApplyOutcome::Buffered => stats.buffered += 1,
        }
    }
}
