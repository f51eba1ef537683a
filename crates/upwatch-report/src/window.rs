//! Calendar windows in the reporting timezone.
//!
//! Report boundaries are local midnights in a named IANA zone, converted to
//! UTC instants. All windows are half-open.

use std::str::FromStr;

use chrono::{DateTime, Days, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use upwatch_state::TimeWindow;

use crate::error::{ReportError, ReportResult};

/// Zone used when the configuration names none.
pub const DEFAULT_TIMEZONE: &str = "Asia/Bangkok";

/// Date format accepted on the command line.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parse an IANA zone name.
pub fn parse_zone(name: &str) -> ReportResult<Tz> {
    Tz::from_str(name).map_err(|_| ReportError::UnknownTimezone(name.to_string()))
}

/// Parse `YYYY-MM-DD`.
pub fn parse_date(s: &str) -> ReportResult<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
        .map_err(|e| ReportError::InvalidWindow(format!("bad date {s:?}: {e}")))
}

/// First instant of `date` in `zone`, as UTC.
pub fn start_of_day(date: NaiveDate, zone: Tz) -> ReportResult<DateTime<Utc>> {
    let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| {
        ReportError::InvalidWindow(format!("no midnight on {date}"))
    })?;
    match zone.from_local_datetime(&midnight) {
        LocalResult::Single(t) => Ok(t.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        // Midnight skipped by a DST jump: the day starts an hour later.
        LocalResult::None => zone
            .from_local_datetime(&(midnight + chrono::Duration::hours(1)))
            .earliest()
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| ReportError::InvalidWindow(format!("no local midnight on {date} in {zone}"))),
    }
}

/// `[date 00:00, date+1 00:00)` in `zone`.
pub fn day_window(date: NaiveDate, zone: Tz) -> ReportResult<TimeWindow> {
    date_range_window(date, date, zone)
}

/// `[from 00:00, to+1 00:00)` in `zone`; both dates inclusive.
pub fn date_range_window(from: NaiveDate, to: NaiveDate, zone: Tz) -> ReportResult<TimeWindow> {
    if to < from {
        return Err(ReportError::InvalidWindow(format!(
            "end date {to} is before start date {from}"
        )));
    }
    let after = to
        .checked_add_days(Days::new(1))
        .ok_or_else(|| ReportError::InvalidWindow(format!("date {to} out of range")))?;
    Ok(TimeWindow::new(
        start_of_day(from, zone)?,
        start_of_day(after, zone)?,
    ))
}

/// The local calendar day before `now`.
pub fn yesterday(now: DateTime<Utc>, zone: Tz) -> ReportResult<TimeWindow> {
    let today = now.with_timezone(&zone).date_naive();
    let date = today
        .checked_sub_days(Days::new(1))
        .ok_or_else(|| ReportError::InvalidWindow(format!("no day before {today}")))?;
    day_window(date, zone)
}
