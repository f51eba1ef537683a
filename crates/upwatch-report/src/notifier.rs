//! Report delivery.
//!
//! Mail is an external collaborator; upwatch hands it a rendered report
//! through [`ReportSink`]. The outbox sink drops one JSON file per delivery
//! into a directory a mailer can pick up from.

use std::fs;
use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use serde::Serialize;
use tracing::info;

use crate::error::{ReportError, ReportResult};
use crate::report::FleetReport;

/// Destination for generated fleet reports.
pub trait ReportSink: Send + Sync {
    fn send(&self, recipients: &[String], report: &FleetReport) -> ReportResult<()>;
}

/// Writes the rendered report to the log.
pub struct LogSink {
    zone: Tz,
}

impl LogSink {
    pub fn new(zone: Tz) -> Self {
        Self { zone }
    }
}

impl ReportSink for LogSink {
    fn send(&self, recipients: &[String], report: &FleetReport) -> ReportResult<()> {
        info!(
            recipients = ?recipients,
            subject = %report.subject_line(self.zone),
            "\n{}",
            report.render_text(self.zone)
        );
        Ok(())
    }
}

/// One outbox message.
#[derive(Debug, Serialize)]
struct OutboxMessage<'a> {
    recipients: &'a [String],
    subject: String,
    body: String,
    report: &'a FleetReport,
}

/// Writes `report-<timestamp>.json` files into a directory.
pub struct OutboxSink {
    dir: PathBuf,
    zone: Tz,
}

impl OutboxSink {
    /// Create the sink, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>, zone: Tz) -> ReportResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| ReportError::Delivery(format!("create {}: {e}", dir.display())))?;
        Ok(Self { dir, zone })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ReportSink for OutboxSink {
    fn send(&self, recipients: &[String], report: &FleetReport) -> ReportResult<()> {
        if recipients.is_empty() {
            return Err(ReportError::Delivery("no recipients configured".into()));
        }
        let message = OutboxMessage {
            recipients,
            subject: report.subject_line(self.zone),
            body: report.render_text(self.zone),
            report,
        };
        let json = serde_json::to_vec_pretty(&message)
            .map_err(|e| ReportError::Delivery(e.to_string()))?;

        let name = format!(
            "report-{}.json",
            report.generated_at.format("%Y%m%dT%H%M%S%.6fZ")
        );
        let path = self.dir.join(name);
        // Write then rename so a mailer never sees a partial file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| ReportError::Delivery(format!("write {}: {e}", path.display())))?;

        info!(path = %path.display(), recipients = recipients.len(), "report written to outbox");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use upwatch_state::TimeWindow;

    use super::*;
    use crate::report::FleetMode;

    fn report() -> FleetReport {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 17, 0, 0).unwrap();
        FleetReport {
            window: TimeWindow::new(start, start + chrono::Duration::days(1)),
            mode: FleetMode::Exact,
            total: 2,
            online: 1,
            offline: 1,
            total_uptime: Duration::from_secs(3600),
            average_uptime_hours: 1.0,
            generated_at: start + chrono::Duration::days(1),
        }
    }

    #[test]
    fn outbox_writes_json_message() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OutboxSink::new(dir.path().join("outbox"), chrono_tz::Asia::Bangkok).unwrap();
        sink.send(&["ops@example.com".to_string()], &report()).unwrap();

        let files: Vec<_> = fs::read_dir(sink.dir()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let path = files[0].as_ref().unwrap().path();
        assert_eq!(path.extension().unwrap(), "json");

        let value: serde_json::Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        assert_eq!(value["recipients"][0], "ops@example.com");
        assert_eq!(value["report"]["online"], 1);
        assert!(value["body"].as_str().unwrap().contains("Average Uptime: 1.00 hours"));
    }

    #[test]
    fn outbox_requires_recipients() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OutboxSink::new(dir.path(), chrono_tz::UTC).unwrap();
        assert!(matches!(sink.send(&[], &report()), Err(ReportError::Delivery(_))));
    }

    #[test]
    fn log_sink_accepts_everything() {
        assert!(LogSink::new(chrono_tz::UTC).send(&[], &report()).is_ok());
    }
}
