//! Daily fleet report.
//!
//! Fires once a day at a local time of day in the reporting zone, summarizes
//! the previous local calendar day, and hands the result to the report sink.
//! A failed run is logged and counted; the next day's run tries again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::watch;
use tracing::{error, info};

use upwatch_report::{FleetMode, FleetReport, ReportResult, ReportSink, UptimeReconstructor, yesterday};
use upwatch_state::Clock;

use crate::stats::CycleStats;

/// First instant strictly after `after` whose local time in `zone` is `at`.
pub fn next_run_after(after: DateTime<Utc>, at: NaiveTime, zone: Tz) -> DateTime<Utc> {
    let mut date = after.with_timezone(&zone).date_naive();
    // Two candidates always suffice outside of a DST gap; a third covers one.
    for _ in 0..3 {
        let local = date.and_time(at);
        let candidate = zone
            .from_local_datetime(&local)
            .earliest()
            .or_else(|| zone.from_local_datetime(&(local + chrono::Duration::hours(1))).earliest())
            .map(|t| t.with_timezone(&Utc));
        if let Some(candidate) = candidate {
            if candidate > after {
                return candidate;
            }
        }
        match date.checked_add_days(Days::new(1)) {
            Some(next) => date = next,
            None => break,
        }
    }
    after + chrono::Duration::days(1)
}

pub struct DailyReport {
    reconstructor: Arc<UptimeReconstructor>,
    sink: Arc<dyn ReportSink>,
    recipients: Vec<String>,
    at: NaiveTime,
    mode: FleetMode,
    clock: Arc<dyn Clock>,
    stats: Arc<CycleStats>,
}

impl DailyReport {
    pub fn new(
        reconstructor: Arc<UptimeReconstructor>,
        sink: Arc<dyn ReportSink>,
        recipients: Vec<String>,
        at: NaiveTime,
        clock: Arc<dyn Clock>,
        stats: Arc<CycleStats>,
    ) -> Self {
        Self {
            reconstructor,
            sink,
            recipients,
            at,
            mode: FleetMode::Exact,
            clock,
            stats,
        }
    }

    pub fn with_mode(mut self, mode: FleetMode) -> Self {
        self.mode = mode;
        self
    }

    fn zone(&self) -> Tz {
        self.reconstructor.zone()
    }

    /// Summarize yesterday and deliver it.
    pub fn run_once(&self) -> ReportResult<FleetReport> {
        let window = yesterday(self.clock.now(), self.zone())?;
        let report = self.reconstructor.fleet(window, self.mode)?;
        self.sink.send(&self.recipients, &report)?;
        Ok(report)
    }

    /// Fire at the configured time each day until shutdown. Each run reads
    /// the whole day from the store, so it goes to the blocking pool.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let job = Arc::new(self);
        info!(at = %job.at, zone = %job.zone(), "daily report scheduler started");
        let mut last_fire: Option<DateTime<Utc>> = None;

        loop {
            let now = job.clock.now();
            // Never fire twice for the same slot, even if the clock lags.
            let from = last_fire.map_or(now, |fired| fired.max(now));
            let next = next_run_after(from, job.at, job.zone());
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(next = %next, wait_secs = wait.as_secs(), "next daily report scheduled");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    last_fire = Some(next);
                    let task = Arc::clone(&job);
                    match tokio::task::spawn_blocking(move || task.run_once()).await {
                        Ok(Ok(report)) => {
                            job.stats.report_sent();
                            info!(online = report.online, total = report.total, "daily report sent");
                        }
                        Ok(Err(e)) => {
                            job.stats.report_failed();
                            error!(error = %e, "daily report failed");
                        }
                        Err(e) => {
                            job.stats.report_failed();
                            error!(error = %e, "daily report task failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("daily report scheduler shutting down");
                    break;
                }
            }
        }
    }
}
