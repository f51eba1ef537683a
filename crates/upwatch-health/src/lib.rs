//! upwatch-health: reachability probing and status recording.
//!
//! Each probe cycle takes a roster snapshot, fans out one probe per endpoint
//! under a semaphore, and hands the complete result map to the recorder.
//!
//! # Architecture
//!
//! ```text
//! HealthProber::probe(snapshot)
//!   ├── Semaphore (max_in_flight permits)
//!   ├── JoinSet of probe tasks, each under a hard deadline
//!   │   └── Pinger::ping(address, attempts, timeout) → bool
//!   └── join barrier → ProbeReport { id → bool }
//! StatusRecorder::record_cycle(results)
//!   ├── RosterWriter::update_status
//!   └── EventLog::append(StatusEvent { credit_minutes })
//! ```
//!
//! Anything short of a positive answer is `false`: timeouts, spawn failures,
//! malformed addresses and panicked tasks included.

pub mod checker;
pub mod error;
pub mod prober;
pub mod recorder;

pub use checker::{IcmpPinger, NetworkPinger, Pinger, ProbeMethod, TcpPinger};
pub use error::{RecordError, RecordResult};
pub use prober::{HealthProber, ProbeReport, ProberConfig};
pub use recorder::{CycleRecord, StatusRecorder};
