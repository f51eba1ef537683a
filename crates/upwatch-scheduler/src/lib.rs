//! upwatch-scheduler: the two periodic drivers of the daemon.
//!
//! ```text
//! ProbeScheduler (fixed interval)
//!   └── HealthCycle: replica.snapshot() → prober.probe_until() → recorder.record_cycle()
//!       overlapping ticks are skipped and counted
//! DailyReport (local time of day in the reporting zone)
//!   └── yesterday() → reconstructor.fleet() → sink.send()
//! ```
//!
//! Both loops stop on the shared shutdown signal. The probe loop waits for
//! its in-flight cycle, which itself aborts outstanding probes.

pub mod daily;
pub mod probe;
pub mod stats;

pub use daily::{DailyReport, next_run_after};
pub use probe::{HealthCycle, ProbeCycle, ProbeScheduler};
pub use stats::{CycleStats, CycleStatsSnapshot};
