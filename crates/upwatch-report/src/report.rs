//! Report values and their plain-text rendering.

use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use upwatch_state::{ServerId, TimeWindow};

/// What a report is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Subject {
    Server(ServerId),
    Fleet,
}

/// Reconstructed uptime of one subject over a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UptimeReport {
    pub subject: Subject,
    pub window: TimeWindow,
    pub total_uptime: Duration,
}

impl UptimeReport {
    pub fn hours(&self) -> f64 {
        self.total_uptime.as_secs_f64() / 3600.0
    }

    pub fn render_text(&self, zone: Tz) -> String {
        let name = match &self.subject {
            Subject::Server(id) => format!("server {id}"),
            Subject::Fleet => "fleet".to_string(),
        };
        format!(
            "Uptime of {name}\nFrom: {}\nTo: {}\nUptime: {:.2} hours\n",
            local(self.window.start, zone),
            local(self.window.end, zone),
            self.hours(),
        )
    }
}

/// How the fleet average was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FleetMode {
    /// Paired-interval reconstruction per server.
    #[default]
    Exact,
    /// Sum of per-event duration credits.
    Credit,
}

/// Fleet-wide summary over a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetReport {
    pub window: TimeWindow,
    pub mode: FleetMode,
    /// Servers with at least one event in the window.
    pub total: usize,
    /// Servers whose last status in the window was on.
    pub online: usize,
    pub offline: usize,
    pub total_uptime: Duration,
    /// Average uptime per online server; zero when none are online.
    pub average_uptime_hours: f64,
    pub generated_at: DateTime<Utc>,
}

impl FleetReport {
    pub fn render_text(&self, zone: Tz) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Server uptime report ({})", match self.mode {
            FleetMode::Exact => "exact",
            FleetMode::Credit => "credit",
        });
        let _ = writeln!(out, "From: {}", local(self.window.start, zone));
        let _ = writeln!(out, "To: {}", local(self.window.end, zone));
        let _ = writeln!(out, "Average Uptime: {:.2} hours", self.average_uptime_hours);
        let _ = writeln!(out, "Online: {}", self.online);
        let _ = writeln!(out, "Offline: {}", self.offline);
        let _ = writeln!(out, "Total: {}", self.total);
        out
    }

    pub fn subject_line(&self, zone: Tz) -> String {
        format!(
            "Server report {} to {}",
            self.window.start.with_timezone(&zone).format("%Y-%m-%d"),
            self.window.end.with_timezone(&zone).format("%Y-%m-%d"),
        )
    }
}

fn local(at: DateTime<Utc>, zone: Tz) -> String {
    at.with_timezone(&zone).format("%Y-%m-%d %H:%M:%S %Z").to_string()
}
