//! Probe fan-out over a roster snapshot.
//!
//! One task per endpoint, at most `max_in_flight` running at once. The call
//! returns only after every launched task finished, timed out, or was
//! cancelled, so nothing outlives the cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use upwatch_state::{Endpoint, ServerId};

use crate::checker::Pinger;

/// Prober tuning.
#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Echo attempts per endpoint.
    pub attempts: u32,
    /// Bound on a single attempt.
    pub attempt_timeout: Duration,
    /// Ceiling on concurrently running probes.
    pub max_in_flight: usize,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            attempt_timeout: Duration::from_secs(5),
            max_in_flight: 256,
        }
    }
}

impl ProberConfig {
    /// Hard deadline for one endpoint: every attempt plus a second of slack.
    /// Saturates at `Duration::MAX`.
    pub fn probe_deadline(&self) -> Duration {
        self.attempt_timeout
            .saturating_mul(self.attempts.max(1))
            .saturating_add(Duration::from_secs(1))
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    /// Exactly one entry per snapshot id.
    pub results: HashMap<ServerId, bool>,
    pub timed_out: usize,
    /// Tasks that panicked or were aborted.
    pub lost: usize,
    /// Shutdown interrupted the cycle.
    pub cancelled: bool,
}

impl ProbeReport {
    pub fn reachable(&self) -> usize {
        self.results.values().filter(|up| **up).count()
    }
}

pub struct HealthProber<P> {
    pinger: Arc<P>,
    config: ProberConfig,
    permits: Arc<Semaphore>,
}

impl<P: Pinger> HealthProber<P> {
    pub fn new(pinger: P, config: ProberConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            pinger: Arc::new(pinger),
            config,
            permits,
        }
    }

    pub fn config(&self) -> &ProberConfig {
        &self.config
    }

    /// Probe every endpoint in `snapshot` with the configured deadline.
    pub async fn probe(&self, snapshot: &HashMap<ServerId, Endpoint>) -> ProbeReport {
        let (_tx, rx) = watch::channel(false);
        self.probe_until(snapshot, self.config.probe_deadline(), rx)
            .await
    }

    /// Probe every endpoint, aborting outstanding probes once `shutdown`
    /// flips. Endpoints that never produced a result are reported `false`.
    pub async fn probe_until(
        &self,
        snapshot: &HashMap<ServerId, Endpoint>,
        per_probe_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> ProbeReport {
        let started = Instant::now();
        let mut report = ProbeReport {
            results: snapshot.keys().map(|id| (id.clone(), false)).collect(),
            ..Default::default()
        };
        let mut tasks: JoinSet<(ServerId, Option<bool>)> = JoinSet::new();

        'launch: for ep in snapshot.values() {
            let permit = tokio::select! {
                p = Arc::clone(&self.permits).acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => {
                        warn!("probe semaphore closed");
                        break 'launch;
                    }
                },
                _ = shutdown_signalled(&mut shutdown) => {
                    report.cancelled = true;
                    break 'launch;
                }
            };

            let pinger = Arc::clone(&self.pinger);
            let id = ep.id.clone();
            let address = ep.address.clone();
            let attempts = self.config.attempts;
            let attempt_timeout = self.config.attempt_timeout;
            tasks.spawn(async move {
                let _permit = permit;
                let up = tokio::time::timeout(
                    per_probe_timeout,
                    pinger.ping(&address, attempts, attempt_timeout),
                )
                .await
                .ok();
                (id, up)
            });
        }

        if report.cancelled {
            tasks.abort_all();
        }

        // Join barrier.
        loop {
            let mut interrupted = false;
            let joined = if report.cancelled {
                tasks.join_next().await
            } else {
                tokio::select! {
                    j = tasks.join_next() => j,
                    _ = shutdown_signalled(&mut shutdown) => {
                        interrupted = true;
                        None
                    }
                }
            };
            if interrupted {
                report.cancelled = true;
                tasks.abort_all();
                continue;
            }
            let Some(joined) = joined else { break };

            match joined {
                Ok((id, Some(up))) => {
                    debug!(server_id = %id, up, "probe result");
                    report.results.insert(id, up);
                }
                Ok((id, None)) => {
                    debug!(server_id = %id, "probe deadline exceeded");
                    report.timed_out += 1;
                }
                Err(e) => {
                    if !e.is_cancelled() {
                        warn!(error = %e, "probe task failed");
                    }
                    report.lost += 1;
                }
            }
        }

        if report.cancelled {
            warn!(endpoints = snapshot.len(), "probe cycle cancelled by shutdown");
        }
        info!(
            endpoints = report.results.len(),
            reachable = report.reachable(),
            timed_out = report.timed_out,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "probe fan-out complete"
        );
        report
    }
}

/// Resolves once shutdown is requested; never resolves if the sender is gone.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let sender_gone = shutdown.wait_for(|stop| *stop).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}
