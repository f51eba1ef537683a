//! Status recorder: turns probe results into roster writes and status events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use upwatch_state::{Clock, EventLog, RosterMutation, RosterWriter, ServerId, StatusEvent, TimeWindow};

use crate::error::{RecordError, RecordResult};

/// Totals for one recorded cycle.
#[derive(Debug, Default)]
pub struct CycleRecord {
    pub recorded: usize,
    pub failures: Vec<RecordError>,
    /// Roster mutations produced by the status write-backs, for the replica.
    pub updates: Vec<RosterMutation>,
}

pub struct StatusRecorder {
    roster: Arc<dyn RosterWriter>,
    events: Arc<dyn EventLog>,
    clock: Arc<dyn Clock>,
    probe_interval: Duration,
    /// Last timestamp issued per server, to keep each server's events strictly
    /// ordered. Seeded from the log on first use, pruned to the last cycle's servers.
    last_stamp: Mutex<HashMap<ServerId, DateTime<Utc>>>,
}

impl StatusRecorder {
    pub fn new(
        roster: Arc<dyn RosterWriter>,
        events: Arc<dyn EventLog>,
        clock: Arc<dyn Clock>,
        probe_interval: Duration,
    ) -> Self {
        Self {
            roster,
            events,
            clock,
            probe_interval,
            last_stamp: Mutex::new(HashMap::new()),
        }
    }

    /// Minutes an "on" observation is worth: one probe interval.
    pub fn credit_minutes(&self, status: bool) -> f64 {
        if status {
            self.probe_interval.as_secs_f64() / 60.0
        } else {
            0.0
        }
    }

    /// Write the observed status to the roster and append a status event.
    ///
    /// Both writes are attempted regardless of the other's outcome.
    pub fn record(&self, server_id: &str, status: bool) -> RecordResult<StatusEvent> {
        self.record_with_update(server_id, status).1
    }

    /// As [`record`](Self::record), also returning the roster mutation the
    /// status write produced.
    fn record_with_update(
        &self,
        server_id: &str,
        status: bool,
    ) -> (Option<RosterMutation>, RecordResult<StatusEvent>) {
        let event = StatusEvent {
            server_id: server_id.to_string(),
            status,
            timestamp: self.stamp(server_id),
            credit_minutes: self.credit_minutes(status),
        };

        let (update, roster) = match self.roster.update_status(server_id, status) {
            Ok(mutation) => (Some(mutation), None),
            Err(e) => (None, Some(e)),
        };
        let appended = self.events.append(&event).err();

        let result = match (roster, appended) {
            (None, None) => {
                debug!(%server_id, status, timestamp = %event.timestamp, "status recorded");
                Ok(event)
            }
            (Some(source), None) => Err(RecordError::Roster {
                server_id: server_id.to_string(),
                source,
            }),
            (None, Some(source)) => Err(RecordError::Event {
                server_id: server_id.to_string(),
                source,
            }),
            (Some(roster), Some(event)) => Err(RecordError::Both {
                server_id: server_id.to_string(),
                roster,
                event,
            }),
        };
        (update, result)
    }

    /// Record every result of a probe cycle. Failures are logged and returned,
    /// never short-circuiting the remaining servers.
    pub fn record_cycle(&self, results: &HashMap<ServerId, bool>) -> CycleRecord {
        let mut ids: Vec<&ServerId> = results.keys().collect();
        ids.sort();

        self.last_stamp.lock().retain(|id, _| results.contains_key(id));

        let mut cycle = CycleRecord::default();
        for id in ids {
            let (update, result) = self.record_with_update(id, results[id]);
            cycle.updates.extend(update);
            match result {
                Ok(_) => cycle.recorded += 1,
                Err(e) => {
                    error!(server_id = %id, error = %e, "status record failed");
                    cycle.failures.push(e);
                }
            }
        }
        info!(
            recorded = cycle.recorded,
            failed = cycle.failures.len(),
            "probe cycle recorded"
        );
        cycle
    }

    /// Now, truncated to the log's microsecond resolution and nudged past the
    /// previous stamp for this server.
    fn stamp(&self, server_id: &str) -> DateTime<Utc> {
        let now = self.clock.now().trunc_subsecs(6);
        let cached = self.last_stamp.lock().get(server_id).copied();
        let prev = cached.or_else(|| self.logged_stamp(server_id));

        let stamp = match prev {
            Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_stamp.lock().insert(server_id.to_string(), stamp);
        stamp
    }

    /// Timestamp of the newest logged event, after a restart or a roster gap.
    fn logged_stamp(&self, server_id: &str) -> Option<DateTime<Utc>> {
        match self.events.last_event(server_id, TimeWindow::all_time()) {
            Ok(last) => last.map(|e| e.timestamp),
            Err(e) => {
                debug!(%server_id, error = %e, "last event lookup failed");
                None
            }
        }
    }

    #[cfg(test)]
    fn tracked_servers(&self) -> usize {
        self.last_stamp.lock().len()
    }
}
