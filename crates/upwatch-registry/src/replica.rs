//! Roster replica: copy-on-write map of the fleet.
//!
//! Readers take an `Arc` to the current map and never hold a lock while they
//! iterate. The single writer builds the next map off to the side and swaps
//! the pointer, so a snapshot can never observe a half-applied mutation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use upwatch_state::{Endpoint, Revision, RosterImage, RosterMutation, RosterSource, ServerId};

use crate::error::{RegistryError, RegistryResult};

/// Point-in-time view of the roster handed to the prober.
pub type RosterSnapshot = Arc<HashMap<ServerId, Endpoint>>;

/// What happened to a single mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Older than (or equal to) what the replica already holds for that id,
    /// or already covered by the bootstrap snapshot.
    Stale,
    /// Held until the snapshot is installed.
    Buffered,
}

/// Summary of [`RosterReplica::bootstrap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BootstrapReport {
    pub loaded: usize,
    pub replayed: usize,
    pub stale: usize,
}

/// Writer-side bookkeeping, only touched under the writer mutex.
#[derive(Default)]
struct WriterState {
    bootstrapped: bool,
    pending: Vec<RosterMutation>,
    /// Roster revision the bootstrap snapshot was read at.
    watermark: Revision,
    /// Revision of the last drop per id, above the watermark.
    tombstones: HashMap<ServerId, Revision>,
}

/// Process-local, eventually-consistent copy of the roster.
pub struct RosterReplica {
    current: RwLock<RosterSnapshot>,
    writer: Mutex<WriterState>,
}

impl RosterReplica {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(HashMap::new())),
            writer: Mutex::new(WriterState::default()),
        }
    }

    /// Read the roster image from `source` and install it.
    pub fn bootstrap_from(&self, source: &dyn RosterSource) -> RegistryResult<BootstrapReport> {
        let image = source.roster_image()?;
        self.bootstrap(image)
    }

    /// Install the startup snapshot, then replay deltas buffered meanwhile.
    ///
    /// Any versioned mutation at or below `image.revision` is already
    /// reflected in the snapshot and is discarded, including upserts for ids
    /// the snapshot no longer holds.
    pub fn bootstrap(&self, image: RosterImage) -> RegistryResult<BootstrapReport> {
        let mut writer = self.writer.lock();
        if writer.bootstrapped {
            return Err(RegistryError::AlreadyBootstrapped);
        }

        let RosterImage {
            endpoints,
            revision: watermark,
        } = image;
        let mut map: HashMap<ServerId, Endpoint> = HashMap::with_capacity(endpoints.len());
        for ep in endpoints {
            map.insert(ep.id.clone(), ep);
        }
        let mut report = BootstrapReport {
            loaded: map.len(),
            ..Default::default()
        };

        writer.watermark = watermark;
        let pending = std::mem::take(&mut writer.pending);
        let WriterState { tombstones, .. } = &mut *writer;
        for mutation in &pending {
            match apply_to(&mut map, tombstones, watermark, mutation) {
                ApplyOutcome::Stale => report.stale += 1,
                _ => report.replayed += 1,
            }
        }
        // The watermark outranks every tombstone at or below it.
        tombstones.retain(|_, revision| *revision > watermark);

        *self.current.write() = Arc::new(map);
        writer.bootstrapped = true;
        info!(
            loaded = report.loaded,
            watermark,
            replayed = report.replayed,
            stale = report.stale,
            "roster replica bootstrapped"
        );
        Ok(report)
    }

    /// Apply one mutation.
    pub fn apply(&self, mutation: RosterMutation) -> ApplyOutcome {
        self.apply_batch(std::iter::once(mutation))
            .pop()
            .unwrap_or(ApplyOutcome::Stale)
    }

    /// Apply mutations in delivery order with a single map swap.
    pub fn apply_batch(
        &self,
        mutations: impl IntoIterator<Item = RosterMutation>,
    ) -> Vec<ApplyOutcome> {
        let mut writer = self.writer.lock();
        if !writer.bootstrapped {
            let before = writer.pending.len();
            writer.pending.extend(mutations);
            let buffered = writer.pending.len() - before;
            debug!(buffered, "roster mutations buffered until bootstrap");
            return vec![ApplyOutcome::Buffered; buffered];
        }

        // Clone outside the pointer lock; only the swap blocks readers.
        let base = Arc::clone(&self.current.read());
        let mut next: HashMap<ServerId, Endpoint> = (*base).clone();
        drop(base);

        let WriterState {
            tombstones,
            watermark,
            ..
        } = &mut *writer;
        let outcomes: Vec<ApplyOutcome> = mutations
            .into_iter()
            .map(|m| {
                let outcome = apply_to(&mut next, tombstones, *watermark, &m);
                debug!(server_id = %m.id(), revision = m.revision(), ?outcome, "roster mutation");
                outcome
            })
            .collect();

        if outcomes.contains(&ApplyOutcome::Applied) {
            *self.current.write() = Arc::new(next);
        }
        outcomes
    }

    /// Consistent point-in-time copy of the roster.
    pub fn snapshot(&self) -> RosterSnapshot {
        Arc::clone(&self.current.read())
    }

    pub fn get(&self, server_id: &str) -> Option<Endpoint> {
        self.current.read().get(server_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.writer.lock().bootstrapped
    }

    /// Number of drop tombstones still held above the watermark.
    pub fn tombstone_count(&self) -> usize {
        self.writer.lock().tombstones.len()
    }
}

impl Default for RosterReplica {
    fn default() -> Self {
        Self::new()
    }
}

/// Last-write-wins on revision. Revision 0 marks an unversioned producer and
/// falls back to arrival order.
fn apply_to(
    map: &mut HashMap<ServerId, Endpoint>,
    tombstones: &mut HashMap<ServerId, Revision>,
    watermark: Revision,
    mutation: &RosterMutation,
) -> ApplyOutcome {
    let id = mutation.id();
    let revision = mutation.revision();
    if revision != 0 {
        if revision <= watermark {
            return ApplyOutcome::Stale;
        }
        let known = map
            .get(id)
            .map(|ep| ep.revision)
            .into_iter()
            .chain(tombstones.get(id).copied())
            .max();
        if known.is_some_and(|known| revision <= known) {
            return ApplyOutcome::Stale;
        }
    }

    match mutation {
        RosterMutation::Upsert {
            id,
            address,
            display_name,
            last_known_status,
            revision,
        } => {
            tombstones.remove(id);
            map.insert(
                id.clone(),
                Endpoint {
                    id: id.clone(),
                    address: address.clone(),
                    display_name: display_name.clone(),
                    last_known_status: *last_known_status,
                    revision: *revision,
                },
            );
        }
        RosterMutation::Drop { id, revision } => {
            map.remove(id);
            tombstones.insert(id.clone(), *revision);
        }
    }
    ApplyOutcome::Applied
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(id: &str, address: &str, revision: Revision) -> RosterMutation {
        RosterMutation::Upsert {
            id: id.to_string(),
            address: address.to_string(),
            display_name: format!("srv-{id}"),
            last_known_status: false,
            revision,
        }
    }

    fn drop_(id: &str, revision: Revision) -> RosterMutation {
        RosterMutation::Drop {
            id: id.to_string(),
            revision,
        }
    }

    fn endpoint(id: &str, revision: Revision) -> Endpoint {
        Endpoint {
            revision,
            ..Endpoint::new(id, "10.0.0.1", format!("srv-{id}"))
        }
    }

    fn image(endpoints: Vec<Endpoint>, revision: Revision) -> RosterImage {
        RosterImage {
            endpoints,
            revision,
        }
    }

    fn bootstrapped() -> RosterReplica {
        let replica = RosterReplica::new();
        replica.bootstrap(RosterImage::default()).unwrap();
        replica
    }

    #[test]
    fn bootstrap_loads_snapshot() {
        let replica = RosterReplica::new();
        let report = replica
            .bootstrap(image(vec![endpoint("1", 1), endpoint("2", 2)], 2))
            .unwrap();
        assert_eq!(report.loaded, 2);
        assert_eq!(replica.len(), 2);
        assert!(replica.is_bootstrapped());
    }

    #[test]
    fn bootstrap_twice_is_rejected() {
        let replica = bootstrapped();
        assert!(matches!(
            replica.bootstrap(RosterImage::default()),
            Err(RegistryError::AlreadyBootstrapped)
        ));
    }

    #[test]
    fn deltas_before_bootstrap_are_buffered_then_replayed() {
        let replica = RosterReplica::new();
        assert_eq!(replica.apply(upsert("3", "10.0.0.3", 7)), ApplyOutcome::Buffered);
        assert_eq!(replica.apply(drop_("1", 8)), ApplyOutcome::Buffered);
        // Already reflected by the snapshot below.
        assert_eq!(replica.apply(upsert("2", "10.0.0.2", 2)), ApplyOutcome::Buffered);
        assert!(replica.is_empty());

        let report = replica
            .bootstrap(image(vec![endpoint("1", 1), endpoint("2", 5)], 6))
            .unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(report.stale, 1);

        let snap = replica.snapshot();
        assert!(snap.contains_key("3"));
        assert!(!snap.contains_key("1"));
        assert_eq!(snap["2"].revision, 5);
    }

    #[test]
    fn upsert_dropped_before_snapshot_is_stale() {
        let replica = RosterReplica::new();
        // Upsert at 4 and drop at 5 both happened before the snapshot read;
        // only the upsert was delivered in time to be buffered.
        assert_eq!(replica.apply(upsert("7", "10.0.0.7", 4)), ApplyOutcome::Buffered);
        let report = replica.bootstrap(image(vec![endpoint("1", 1)], 5)).unwrap();
        assert_eq!(report.stale, 1);
        assert!(replica.get("7").is_none());

        // Late redelivery after bootstrap is discarded too.
        assert_eq!(replica.apply(upsert("7", "10.0.0.7", 4)), ApplyOutcome::Stale);
        assert!(replica.get("7").is_none());
        assert_eq!(replica.apply(upsert("7", "10.0.0.7", 6)), ApplyOutcome::Applied);
    }

    #[test]
    fn bootstrap_prunes_tombstones_under_watermark() {
        let replica = RosterReplica::new();
        replica.apply(drop_("1", 3));
        replica.apply(drop_("2", 9));
        replica.bootstrap(image(Vec::new(), 6)).unwrap();
        assert_eq!(replica.tombstone_count(), 1);
        assert_eq!(replica.apply(upsert("1", "10.0.0.1", 5)), ApplyOutcome::Stale);
        assert_eq!(replica.apply(upsert("2", "10.0.0.2", 8)), ApplyOutcome::Stale);
    }

    #[test]
    fn bootstrap_from_reads_store_image() {
        let store = upwatch_state::StateStore::open_in_memory().unwrap();
        store
            .put_endpoint(&Endpoint::new("1", "10.0.0.1", "a"))
            .unwrap();
        let gone = store
            .put_endpoint(&Endpoint::new("2", "10.0.0.2", "b"))
            .unwrap();
        store.delete_endpoint("2").unwrap();

        let replica = RosterReplica::new();
        replica.bootstrap_from(&store).unwrap();
        assert_eq!(replica.len(), 1);
        assert_eq!(
            replica.apply(RosterMutation::from(&gone)),
            ApplyOutcome::Stale
        );
    }

    #[test]
    fn upsert_replaces_and_drop_removes() {
        let replica = bootstrapped();
        replica.apply(upsert("1", "10.0.0.1", 1));
        replica.apply(upsert("1", "10.0.0.9", 2));
        assert_eq!(replica.get("1").unwrap().address, "10.0.0.9");

        assert_eq!(replica.apply(drop_("1", 3)), ApplyOutcome::Applied);
        assert!(replica.get("1").is_none());
    }

    #[test]
    fn duplicate_upsert_is_idempotent() {
        let replica = bootstrapped();
        assert_eq!(replica.apply(upsert("1", "10.0.0.1", 4)), ApplyOutcome::Applied);
        let before = replica.snapshot();
        assert_eq!(replica.apply(upsert("1", "10.0.0.1", 4)), ApplyOutcome::Stale);
        assert_eq!(*replica.snapshot(), *before);
    }

    #[test]
    fn stale_upsert_after_drop_is_ignored() {
        let replica = bootstrapped();
        replica.apply(upsert("1", "10.0.0.1", 1));
        replica.apply(drop_("1", 3));
        // Redelivered older upsert.
        assert_eq!(replica.apply(upsert("1", "10.0.0.1", 2)), ApplyOutcome::Stale);
        assert!(replica.get("1").is_none());

        // A genuine re-create carries a newer revision.
        assert_eq!(replica.apply(upsert("1", "10.0.0.5", 4)), ApplyOutcome::Applied);
        assert_eq!(replica.get("1").unwrap().address, "10.0.0.5");
    }

    #[test]
    fn drop_of_unknown_id_leaves_tombstone() {
        let replica = bootstrapped();
        assert_eq!(replica.apply(drop_("9", 10)), ApplyOutcome::Applied);
        assert_eq!(replica.apply(upsert("9", "10.0.0.9", 6)), ApplyOutcome::Stale);
        assert!(replica.is_empty());
    }

    #[test]
    fn unversioned_mutations_apply_in_arrival_order() {
        let replica = bootstrapped();
        replica.apply(upsert("1", "10.0.0.1", 0));
        replica.apply(upsert("1", "10.0.0.2", 0));
        assert_eq!(replica.get("1").unwrap().address, "10.0.0.2");
        replica.apply(drop_("1", 0));
        assert!(replica.is_empty());
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let replica = bootstrapped();
        replica.apply(upsert("1", "10.0.0.1", 1));
        let snap = replica.snapshot();

        replica.apply(upsert("2", "10.0.0.2", 2));
        replica.apply(drop_("1", 3));

        assert_eq!(snap.len(), 1);
        assert!(snap.contains_key("1"));
        assert_eq!(replica.len(), 1);
        assert!(replica.get("2").is_some());
    }

    #[test]
    fn batch_swaps_once_and_reports_each() {
        let replica = bootstrapped();
        let outcomes = replica.apply_batch(vec![
            upsert("1", "10.0.0.1", 1),
            upsert("1", "10.0.0.1", 1),
            upsert("2", "10.0.0.2", 2),
        ]);
        assert_eq!(
            outcomes,
            vec![ApplyOutcome::Applied, ApplyOutcome::Stale, ApplyOutcome::Applied]
        );
        assert_eq!(replica.len(), 2);
    }

    #[test]
    fn concurrent_readers_see_whole_mutations() {
        let replica = Arc::new(bootstrapped());
        let writer = {
            let replica = Arc::clone(&replica);
            std::thread::spawn(move || {
                for rev in 1..=500u64 {
                    // Each batch swaps two ids in one step.
                    replica.apply_batch(vec![
                        upsert("a", &format!("10.0.{}.{}", rev / 256, rev % 256), rev * 2),
                        upsert("b", &format!("10.0.{}.{}", rev / 256, rev % 256), rev * 2 + 1),
                    ]);
                }
            })
        };
        for _ in 0..500 {
            let snap = replica.snapshot();
            if let (Some(a), Some(b)) = (snap.get("a"), snap.get("b")) {
                assert_eq!(a.address, b.address);
            }
        }
        writer.join().unwrap();
    }
}
