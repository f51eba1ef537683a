//! upwatch.toml configuration.
//!
//! Every section and key is optional; missing values fall back to the
//! defaults below. Durations are written as `"500ms"`, `"10s"`, `"5m"` or
//! `"1h"`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use upwatch_health::{ProbeMethod, ProberConfig};
use upwatch_registry::MqttSettings;
use upwatch_report::{DEFAULT_TIMEZONE, FleetMode};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpwatchConfig {
    pub store: StoreConfig,
    pub bus: BusConfig,
    pub probe: ProbeConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// redb file holding the roster and the status event log.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/upwatch/upwatch.redb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Without a broker the replica only sees the startup snapshot.
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub channel_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        let mqtt = MqttSettings::default();
        Self {
            enabled: true,
            host: mqtt.host,
            port: mqtt.port,
            topic: mqtt.topic,
            client_id: mqtt.client_id,
            keep_alive_secs: mqtt.keep_alive.as_secs(),
            channel_capacity: mqtt.channel_capacity,
        }
    }
}

impl BusConfig {
    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.host.clone(),
            port: self.port,
            topic: self.topic.clone(),
            client_id: self.client_id.clone(),
            keep_alive: Duration::from_secs(self.keep_alive_secs.max(5)),
            channel_capacity: self.channel_capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Probe cycle period; also the duration credit of an "on" event.
    pub interval: String,
    /// Per-attempt timeout.
    pub timeout: String,
    pub attempts: u32,
    pub max_in_flight: usize,
    pub method: ProbeMethod,
    /// Port for `method = "tcp"`.
    pub tcp_port: u16,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: "5m".to_string(),
            timeout: "5s".to_string(),
            attempts: 3,
            max_in_flight: 256,
            method: ProbeMethod::Icmp,
            tcp_port: 22,
        }
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> anyhow::Result<Duration> {
        let d = parse_duration(&self.interval).context("probe.interval")?;
        if d.is_zero() {
            bail!("probe.interval must be positive");
        }
        Ok(d)
    }

    pub fn prober_config(&self) -> anyhow::Result<ProberConfig> {
        if self.attempts == 0 {
            bail!("probe.attempts must be at least 1");
        }
        let attempt_timeout = parse_duration(&self.timeout).context("probe.timeout")?;
        if attempt_timeout
            .checked_mul(self.attempts)
            .and_then(|total| total.checked_add(Duration::from_secs(1)))
            .is_none()
        {
            bail!("probe.timeout {:?} times {} attempts is out of range", self.timeout, self.attempts);
        }
        Ok(ProberConfig {
            attempts: self.attempts,
            attempt_timeout,
            max_in_flight: self.max_in_flight.max(1),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// IANA zone that calendar days are cut in.
    pub timezone: String,
    /// Local time of day of the daily report, `HH:MM`.
    pub daily_at: String,
    pub recipients: Vec<String>,
    /// Write reports here as JSON; log them when unset.
    pub outbox_dir: Option<PathBuf>,
    pub mode: FleetMode,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE.to_string(),
            daily_at: "08:00".to_string(),
            recipients: Vec::new(),
            outbox_dir: None,
            mode: FleetMode::Exact,
        }
    }
}

impl ReportConfig {
    pub fn zone(&self) -> anyhow::Result<Tz> {
        Ok(upwatch_report::parse_zone(&self.timezone)?)
    }

    pub fn daily_at(&self) -> anyhow::Result<NaiveTime> {
        NaiveTime::parse_from_str(self.daily_at.trim(), "%H:%M")
            .with_context(|| format!("report.daily_at {:?} is not HH:MM", self.daily_at))
    }
}

impl UpwatchConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: UpwatchConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    /// Check every derived value once, up front.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.probe.interval()?;
        self.probe.prober_config()?;
        self.report.zone()?;
        self.report.daily_at()?;
        Ok(())
    }
}

/// Parse a duration string like `"500ms"`, `"10s"`, `"5m"`, `"1h"`.
/// A bare number is seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let (digits, unit): (&str, fn(u64) -> Option<Duration>) = if let Some(n) = s.strip_suffix("ms") {
        (n, |ms| Some(Duration::from_millis(ms)))
    } else if let Some(n) = s.strip_suffix('s') {
        (n, |secs| Some(Duration::from_secs(secs)))
    } else if let Some(n) = s.strip_suffix('m') {
        (n, |m| m.checked_mul(60).map(Duration::from_secs))
    } else if let Some(n) = s.strip_suffix('h') {
        (n, |h| h.checked_mul(3600).map(Duration::from_secs))
    } else {
        (s, |secs| Some(Duration::from_secs(secs)))
    };
    let value: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid duration {s:?}"))?;
    unit(value).with_context(|| format!("duration {s:?} is out of range"))
}
