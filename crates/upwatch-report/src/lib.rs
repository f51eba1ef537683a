//! upwatch-report: uptime reconstruction and fleet reports.
//!
//! Reads the status event log over half-open windows whose bounds are local
//! midnights in the reporting timezone, rebuilds "on" intervals per server,
//! and hands fleet summaries to a [`ReportSink`].
//!
//! ```text
//! window::day_window / yesterday / date_range_window  (chrono-tz)
//!   └── UptimeReconstructor
//!         ├── server_uptime      EventLog::query → reconstruct()
//!         ├── fleet_summary      aggregate_by_server + reconstruct per server
//!         └── fleet_credit_average  aggregate_by_server credit sums
//!               └── ReportSink::send (LogSink | OutboxSink)
//! ```

pub mod error;
pub mod notifier;
pub mod reconstructor;
pub mod report;
pub mod window;

pub use error::{ReportError, ReportResult};
pub use notifier::{LogSink, OutboxSink, ReportSink};
pub use reconstructor::{UptimeReconstructor, reconstruct};
pub use report::{FleetMode, FleetReport, Subject, UptimeReport};
pub use window::{DEFAULT_TIMEZONE, date_range_window, day_window, parse_date, parse_zone, yesterday};
