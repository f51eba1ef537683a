//! Uptime reconstruction from the status event log.
//!
//! Uptime is rebuilt by a paired scan over a server's events in ascending
//! timestamp order. An "on" opens an interval (closing any interval already
//! open at that instant), an "off" closes it, and an interval still open at
//! the end of the scan runs to `min(window.end, now)`. Nothing outside the
//! window is credited and no event is ever synthesized.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use tracing::{debug, info};

use upwatch_state::{Clock, EventLog, StatusEvent, TimeWindow};

use crate::error::{ReportError, ReportResult};
use crate::report::{FleetMode, FleetReport, Subject, UptimeReport};
use crate::window;

/// Total "on" time of an ascending event stream inside `window`.
pub fn reconstruct(events: &[StatusEvent], window: TimeWindow, now: DateTime<Utc>) -> Duration {
    let mut total = Duration::ZERO;
    let mut open: Option<DateTime<Utc>> = None;

    for event in events.iter().filter(|e| window.contains(&e.timestamp)) {
        if let Some(since) = open.take() {
            total += span(since, event.timestamp);
        }
        if event.status {
            open = Some(event.timestamp);
        }
    }

    if let Some(since) = open {
        total += span(since, window.end.min(now));
    }
    total
}

fn span(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or_default()
}

pub struct UptimeReconstructor {
    events: Arc<dyn EventLog>,
    clock: Arc<dyn Clock>,
    zone: Tz,
}

impl UptimeReconstructor {
    pub fn new(events: Arc<dyn EventLog>, clock: Arc<dyn Clock>, zone: Tz) -> Self {
        Self { events, clock, zone }
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }

    /// Uptime of one server over `window`. No events means zero, not an error.
    pub fn server_uptime(&self, server_id: &str, window: TimeWindow) -> ReportResult<UptimeReport> {
        let events = self.events.query(server_id, window)?;
        let total_uptime = reconstruct(&events, window, self.clock.now());
        debug!(%server_id, events = events.len(), uptime_secs = total_uptime.as_secs(), "server uptime reconstructed");
        Ok(UptimeReport {
            subject: Subject::Server(server_id.to_string()),
            window,
            total_uptime,
        })
    }

    /// Uptime of one server over a calendar day in the reporting zone.
    pub fn server_uptime_on(&self, server_id: &str, date: NaiveDate) -> ReportResult<UptimeReport> {
        self.server_uptime(server_id, window::day_window(date, self.zone)?)
    }

    /// Fleet summary using exact reconstruction per server.
    pub fn fleet_summary(&self, window: TimeWindow) -> ReportResult<FleetReport> {
        self.fleet(window, FleetMode::Exact)
    }

    /// Fleet summary averaging recorded duration credits instead.
    pub fn fleet_credit_average(&self, window: TimeWindow) -> ReportResult<FleetReport> {
        self.fleet(window, FleetMode::Credit)
    }

    pub fn fleet(&self, window: TimeWindow, mode: FleetMode) -> ReportResult<FleetReport> {
        let buckets = self.events.aggregate_by_server(window)?;
        if buckets.is_empty() {
            return Err(ReportError::NoData {
                start: window.start,
                end: window.end,
            });
        }

        let now = self.clock.now();
        let total = buckets.len();
        let online = buckets.iter().filter(|b| b.last_status).count();

        let total_uptime = match mode {
            FleetMode::Exact => {
                let mut sum = Duration::ZERO;
                for bucket in &buckets {
                    let events = self.events.query(&bucket.server_id, window)?;
                    sum += reconstruct(&events, window, now);
                }
                sum
            }
            FleetMode::Credit => {
                let minutes: f64 = buckets.iter().map(|b| b.credit_minutes).sum();
                Duration::from_secs_f64((minutes * 60.0).max(0.0))
            }
        };

        let average_uptime_hours = if online == 0 {
            0.0
        } else {
            total_uptime.as_secs_f64() / 3600.0 / online as f64
        };

        let report = FleetReport {
            window,
            mode,
            total,
            online,
            offline: total - online,
            total_uptime,
            average_uptime_hours,
            generated_at: now,
        };
        info!(
            ?mode,
            total = report.total,
            online = report.online,
            offline = report.offline,
            average_hours = report.average_uptime_hours,
            "fleet report computed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use upwatch_state::{ManualClock, StateStore};

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn mins(m: i64) -> chrono::Duration {
        chrono::Duration::minutes(m)
    }

    fn ev(id: &str, status: bool, at: DateTime<Utc>) -> StatusEvent {
        StatusEvent {
            server_id: id.to_string(),
            status,
            timestamp: at,
            credit_minutes: if status { 5.0 } else { 0.0 },
        }
    }

    fn window(hours: i64) -> TimeWindow {
        TimeWindow::new(t0() - chrono::Duration::hours(1), t0() + chrono::Duration::hours(hours))
    }

    #[test]
    fn on_then_off_is_the_gap() {
        let events = [ev("a", true, t0()), ev("a", false, t0() + mins(30))];
        let now = t0() + chrono::Duration::days(1);
        assert_eq!(reconstruct(&events, window(2), now), Duration::from_secs(30 * 60));
    }

    #[test]
    fn open_interval_runs_to_now() {
        let events = [ev("a", true, t0())];
        let now = t0() + mins(45);
        let w = TimeWindow::new(t0(), now);
        assert_eq!(reconstruct(&events, w, now), Duration::from_secs(45 * 60));
        // A window reaching past now still stops at now.
        assert_eq!(reconstruct(&events, window(24), now), Duration::from_secs(45 * 60));
    }

    #[test]
    fn open_interval_stops_at_window_end() {
        let events = [ev("a", true, t0())];
        let now = t0() + chrono::Duration::days(3);
        assert_eq!(reconstruct(&events, window(2), now), Duration::from_secs(2 * 3600));
    }

    #[test]
    fn repeated_on_keeps_counting() {
        let events = [
            ev("a", true, t0()),
            ev("a", true, t0() + mins(5)),
            ev("a", true, t0() + mins(10)),
            ev("a", false, t0() + mins(12)),
            ev("a", false, t0() + mins(20)),
            ev("a", true, t0() + mins(30)),
            ev("a", false, t0() + mins(33)),
        ];
        let now = t0() + chrono::Duration::days(1);
        assert_eq!(reconstruct(&events, window(2), now), Duration::from_secs(15 * 60));
    }

    #[test]
    fn no_events_is_zero() {
        assert_eq!(reconstruct(&[], window(2), t0()), Duration::ZERO);
    }

    #[test]
    fn events_outside_window_ignored() {
        let events = [
            ev("a", true, t0() - chrono::Duration::hours(5)),
            ev("a", false, t0() + chrono::Duration::hours(5)),
        ];
        assert_eq!(reconstruct(&events, window(2), t0() + chrono::Duration::days(1)), Duration::ZERO);
    }

    fn seeded() -> (Arc<StateStore>, UptimeReconstructor) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        for e in [
            ev("A", true, t0()),
            ev("A", true, t0() + mins(5)),
            ev("B", true, t0()),
            ev("B", false, t0() + mins(20)),
            ev("C", false, t0()),
            ev("C", true, t0() + mins(10)),
        ] {
            store.append(&e).unwrap();
        }
        let clock = Arc::new(ManualClock::new(t0() + mins(40)));
        let rec = UptimeReconstructor::new(store.clone(), clock, chrono_tz::Asia::Bangkok);
        (store, rec)
    }

    #[test]
    fn fleet_counts_by_last_status() {
        let (_, rec) = seeded();
        let report = rec.fleet_summary(window(2)).unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.online, 2);
        assert_eq!(report.offline, 1);
        // A: 40m, B: 20m, C: 30m over 2 online servers.
        assert_eq!(report.total_uptime, Duration::from_secs(90 * 60));
        assert!((report.average_uptime_hours - 0.75).abs() < 1e-9);
    }

    #[test]
    fn credit_mode_sums_credits() {
        let (_, rec) = seeded();
        let report = rec.fleet_credit_average(window(2)).unwrap();
        assert_eq!(report.mode, FleetMode::Credit);
        // Four "on" events of 5 minutes each.
        assert_eq!(report.total_uptime, Duration::from_secs(20 * 60));
        assert!((report.average_uptime_hours - 20.0 / 60.0 / 2.0).abs() < 1e-9);
    }

    #[test]
    fn empty_fleet_is_no_data() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let rec = UptimeReconstructor::new(store, Arc::new(ManualClock::new(t0())), chrono_tz::UTC);
        assert!(matches!(rec.fleet_summary(window(2)), Err(ReportError::NoData { .. })));
    }

    #[test]
    fn all_offline_averages_zero() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        store.append(&ev("a", true, t0())).unwrap();
        store.append(&ev("a", false, t0() + mins(10))).unwrap();
        let rec = UptimeReconstructor::new(store, Arc::new(ManualClock::new(t0() + mins(60))), chrono_tz::UTC);
        let report = rec.fleet_summary(window(2)).unwrap();
        assert_eq!(report.online, 0);
        assert_eq!(report.average_uptime_hours, 0.0);
        assert_eq!(report.total_uptime, Duration::from_secs(600));
    }

    #[test]
    fn server_without_events_is_zero() {
        let (_, rec) = seeded();
        let report = rec.server_uptime("nobody", window(2)).unwrap();
        assert_eq!(report.total_uptime, Duration::ZERO);
        assert_eq!(report.subject, Subject::Server("nobody".into()));
    }

    #[test]
    fn server_uptime_on_local_day() {
        let (_, rec) = seeded();
        // 08:00 UTC on 2024-03-01 is 15:00 in Bangkok, same date.
        let report = rec
            .server_uptime_on("B", NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
            .unwrap();
        assert_eq!(report.total_uptime, Duration::from_secs(20 * 60));
    }
}
