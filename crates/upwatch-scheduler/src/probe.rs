//! Probe cycle scheduling.
//!
//! Every tick starts one `Snapshot → Probe → Record` cycle on its own task.
//! A tick that fires while the previous cycle is still running is skipped
//! and counted; cycles never overlap.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use upwatch_health::{HealthProber, Pinger, StatusRecorder};
use upwatch_registry::RosterReplica;

use crate::stats::CycleStats;

/// One unit of periodic work.
pub trait ProbeCycle: Send + Sync + 'static {
    fn run_cycle(&self, shutdown: watch::Receiver<bool>) -> impl Future<Output = ()> + Send;
}

/// Snapshot the replica, probe it, record the results, and feed the status
/// write-backs into the replica.
pub struct HealthCycle<P> {
    replica: Arc<RosterReplica>,
    prober: HealthProber<P>,
    recorder: Arc<StatusRecorder>,
}

impl<P: Pinger> HealthCycle<P> {
    pub fn new(
        replica: Arc<RosterReplica>,
        prober: HealthProber<P>,
        recorder: Arc<StatusRecorder>,
    ) -> Self {
        Self {
            replica,
            prober,
            recorder,
        }
    }
}

impl<P: Pinger> ProbeCycle for HealthCycle<P> {
    async fn run_cycle(&self, shutdown: watch::Receiver<bool>) {
        let snapshot = self.replica.snapshot();
        if snapshot.is_empty() {
            debug!(bootstrapped = self.replica.is_bootstrapped(), "roster empty, nothing to probe");
            return;
        }

        let deadline = self.prober.config().probe_deadline();
        let report = self.prober.probe_until(&snapshot, deadline, shutdown).await;
        if report.cancelled {
            // Aborted probes read as false; recording them would invent downtime.
            warn!(endpoints = snapshot.len(), "cancelled cycle not recorded");
            return;
        }

        let recorder = Arc::clone(&self.recorder);
        let results = report.results;
        match tokio::task::spawn_blocking(move || recorder.record_cycle(&results)).await {
            Ok(cycle) => {
                if !cycle.failures.is_empty() {
                    warn!(failed = cycle.failures.len(), recorded = cycle.recorded, "probe cycle partially recorded");
                }
                self.replica.apply_batch(cycle.updates);
            }
            Err(e) => error!(error = %e, "status recording task failed"),
        }
    }
}

/// Drives a [`ProbeCycle`] on a fixed period.
pub struct ProbeScheduler<C> {
    cycle: Arc<C>,
    interval: Duration,
    stats: Arc<CycleStats>,
}

impl<C: ProbeCycle> ProbeScheduler<C> {
    pub fn new(cycle: C, interval: Duration, stats: Arc<CycleStats>) -> Self {
        Self {
            cycle: Arc::new(cycle),
            interval,
            stats,
        }
    }

    /// Tick until shutdown, then wait for the in-flight cycle to wind down.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "probe scheduler started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut running: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if running.as_ref().is_some_and(|h| !h.is_finished()) {
                        self.stats.probe_skipped();
                        warn!("previous probe cycle still running, tick skipped");
                        continue;
                    }
                    self.stats.probe_started();
                    let cycle = Arc::clone(&self.cycle);
                    let stats = Arc::clone(&self.stats);
                    let rx = shutdown.clone();
                    running = Some(tokio::spawn(async move {
                        cycle.run_cycle(rx).await;
                        stats.probe_completed();
                    }));
                }
                _ = shutdown.changed() => {
                    info!("probe scheduler shutting down");
                    break;
                }
            }
        }

        if let Some(handle) = running {
            if let Err(e) = handle.await {
                error!(error = %e, "probe cycle task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Sleeps for a fixed time, counting runs.
    struct SlowCycle {
        took: Duration,
        runs: Arc<AtomicU32>,
    }

    impl ProbeCycle for SlowCycle {
        async fn run_cycle(&self, mut shutdown: watch::Receiver<bool>) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = tokio::time::sleep(self.took) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn drive(took: Duration, interval: Duration, for_how_long: Duration) -> (u32, crate::CycleStatsSnapshot) {
        let runs = Arc::new(AtomicU32::new(0));
        let stats = Arc::new(CycleStats::new());
        let scheduler = ProbeScheduler::new(
            SlowCycle {
                took,
                runs: Arc::clone(&runs),
            },
            interval,
            Arc::clone(&stats),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(for_how_long).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        (runs.load(Ordering::SeqCst), stats.snapshot())
    }

    #[tokio::test(start_paused = true)]
    async fn fast_cycles_never_skip() {
        // Ticks at 0, 10, 20, 30, 40, 50; stop at 55.
        let (runs, stats) = drive(Duration::from_secs(1), Duration::from_secs(10), Duration::from_secs(55)).await;
        assert_eq!(runs, 6);
        assert_eq!(stats.probe_started, 6);
        assert_eq!(stats.probe_completed, 6);
        assert_eq!(stats.probe_skipped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_tick_is_skipped() {
        // A 25s cycle on a 10s period: ticks at 10 and 20 land while the
        // first cycle runs, 30 starts the next one, 40 and 50 are skipped.
        let (runs, stats) = drive(Duration::from_secs(25), Duration::from_secs(10), Duration::from_secs(55)).await;
        assert_eq!(runs, 2);
        assert_eq!(stats.probe_started, 2);
        assert_eq!(stats.probe_skipped, 4);
        // The second cycle is cut short by shutdown but still completes.
        assert_eq!(stats.probe_completed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_before_first_tick_completes() {
        let (runs, stats) = drive(Duration::from_secs(1), Duration::from_secs(10), Duration::ZERO).await;
        assert!(runs <= 1);
        assert_eq!(stats.probe_started, stats.probe_completed);
    }

    use chrono::Utc;
    use upwatch_health::ProberConfig;
    use upwatch_state::{
        Endpoint, EventLog, RosterSource, StateStore, SystemClock, TimeWindow,
    };

    /// Every address answers `up` after `delay`.
    struct FixedPinger {
        up: bool,
        delay: Duration,
    }

    impl Pinger for FixedPinger {
        async fn ping(&self, _address: &str, _attempts: u32, _timeout: Duration) -> bool {
            tokio::time::sleep(self.delay).await;
            self.up
        }
    }

    fn health_cycle(pinger: FixedPinger, attempt_timeout: Duration) -> (Arc<StateStore>, Arc<RosterReplica>, HealthCycle<FixedPinger>) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        store
            .put_endpoint(&Endpoint::new("web-1", "10.0.0.1", "web"))
            .unwrap();
        let replica = Arc::new(RosterReplica::new());
        replica.bootstrap(store.roster_image().unwrap()).unwrap();
        let recorder = Arc::new(StatusRecorder::new(
            store.clone(),
            store.clone(),
            Arc::new(SystemClock),
            Duration::from_secs(60),
        ));
        let prober = HealthProber::new(
            pinger,
            ProberConfig {
                attempts: 1,
                attempt_timeout,
                max_in_flight: 4,
            },
        );
        (store, Arc::clone(&replica), HealthCycle::new(replica, prober, recorder))
    }

    fn around_now() -> TimeWindow {
        let now = Utc::now();
        TimeWindow::new(now - chrono::Duration::hours(1), now + chrono::Duration::hours(1))
    }

    #[tokio::test]
    async fn recorded_status_reaches_replica() {
        let (store, replica, cycle) = health_cycle(
            FixedPinger { up: true, delay: Duration::ZERO },
            Duration::from_secs(1),
        );
        assert!(!replica.get("web-1").unwrap().last_known_status);

        let (_tx, rx) = watch::channel(false);
        cycle.run_cycle(rx).await;

        let stored = store.get_endpoint("web-1").unwrap().unwrap();
        let replicated = replica.get("web-1").unwrap();
        assert!(replicated.last_known_status);
        assert_eq!(replicated.revision, stored.revision);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_cycle_records_nothing() {
        let (store, replica, cycle) = health_cycle(
            FixedPinger { up: true, delay: Duration::from_secs(3600) },
            Duration::from_secs(7200),
        );
        let (tx, rx) = watch::channel(false);
        let trigger = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(true).unwrap();
        };
        tokio::join!(cycle.run_cycle(rx), trigger);

        assert!(store.query("web-1", around_now()).unwrap().is_empty());
        assert!(!store.get_endpoint("web-1").unwrap().unwrap().last_known_status);
        assert!(!replica.get("web-1").unwrap().last_known_status);
    }
}
