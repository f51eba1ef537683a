//! Cycle counters shared between the scheduler loops and the daemon.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CycleStats {
    probe_started: AtomicU64,
    probe_completed: AtomicU64,
    probe_skipped: AtomicU64,
    reports_sent: AtomicU64,
    reports_failed: AtomicU64,
}

/// Plain copy of [`CycleStats`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStatsSnapshot {
    pub probe_started: u64,
    pub probe_completed: u64,
    /// Ticks dropped because the previous cycle was still running.
    pub probe_skipped: u64,
    pub reports_sent: u64,
    pub reports_failed: u64,
}

impl CycleStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn probe_started(&self) {
        self.probe_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn probe_completed(&self) {
        self.probe_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn probe_skipped(&self) {
        self.probe_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn report_sent(&self) {
        self.reports_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn report_failed(&self) {
        self.reports_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CycleStatsSnapshot {
        CycleStatsSnapshot {
            probe_started: self.probe_started.load(Ordering::Relaxed),
            probe_completed: self.probe_completed.load(Ordering::Relaxed),
            probe_skipped: self.probe_skipped.load(Ordering::Relaxed),
            reports_sent: self.reports_sent.load(Ordering::Relaxed),
            reports_failed: self.reports_failed.load(Ordering::Relaxed),
        }
    }
}
