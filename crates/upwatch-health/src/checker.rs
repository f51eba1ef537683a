//! Reachability checks.
//!
//! A [`Pinger`] answers one question: did the address answer within the
//! given attempts? Every failure mode (unreachable, refused, spawn failure,
//! bad address) collapses to `false`.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, warn};

/// Reachability check against a single address.
pub trait Pinger: Send + Sync + 'static {
    /// `timeout` bounds each attempt; the result is `true` as soon as one
    /// attempt succeeds.
    fn ping(
        &self,
        address: &str,
        attempts: u32,
        timeout: Duration,
    ) -> impl Future<Output = bool> + Send;
}

/// How endpoints are probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    /// ICMP echo through the system `ping` binary.
    #[default]
    Icmp,
    /// TCP connect to a fixed port.
    Tcp,
}

/// ICMP echo via the system `ping` binary (no raw socket privileges needed).
#[derive(Debug, Clone)]
pub struct IcmpPinger {
    program: String,
}

impl IcmpPinger {
    pub fn new() -> Self {
        Self {
            program: "ping".to_string(),
        }
    }

    /// Use a different executable, e.g. an absolute path.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for IcmpPinger {
    fn default() -> Self {
        Self::new()
    }
}

impl Pinger for IcmpPinger {
    async fn ping(&self, address: &str, attempts: u32, timeout: Duration) -> bool {
        // Only dotted quads reach the command line.
        let Ok(ip) = address.parse::<Ipv4Addr>() else {
            warn!(%address, "not an IPv4 address, reported unreachable");
            return false;
        };
        let wait_secs = timeout.as_secs().max(1);

        let status = Command::new(&self.program)
            .arg("-c")
            .arg(attempts.max(1).to_string())
            .arg("-W")
            .arg(wait_secs.to_string())
            .arg(ip.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;

        match status {
            Ok(s) => {
                debug!(%address, code = ?s.code(), "ping finished");
                s.success()
            }
            Err(e) => {
                warn!(%address, program = %self.program, error = %e, "failed to launch ping");
                false
            }
        }
    }
}

/// TCP connect reachability. Only a completed handshake counts.
#[derive(Debug, Clone, Copy)]
pub struct TcpPinger {
    port: u16,
}

impl TcpPinger {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl Pinger for TcpPinger {
    async fn ping(&self, address: &str, attempts: u32, timeout: Duration) -> bool {
        let Ok(ip) = address.parse::<Ipv4Addr>() else {
            warn!(%address, "not an IPv4 address, reported unreachable");
            return false;
        };
        let target = SocketAddrV4::new(ip, self.port);

        for attempt in 1..=attempts.max(1) {
            match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
                Ok(Ok(_)) => return true,
                Ok(Err(e)) => debug!(%target, attempt, error = %e, "tcp probe failed"),
                Err(_) => debug!(%target, attempt, "tcp probe timed out"),
            }
        }
        false
    }
}

/// The pinger selected by configuration.
#[derive(Debug, Clone)]
pub enum NetworkPinger {
    Icmp(IcmpPinger),
    Tcp(TcpPinger),
}

impl NetworkPinger {
    pub fn from_method(method: ProbeMethod, tcp_port: u16) -> Self {
        match method {
            ProbeMethod::Icmp => Self::Icmp(IcmpPinger::new()),
            ProbeMethod::Tcp => Self::Tcp(TcpPinger::new(tcp_port)),
        }
    }
}

impl Pinger for NetworkPinger {
    async fn ping(&self, address: &str, attempts: u32, timeout: Duration) -> bool {
        match self {
            Self::Icmp(p) => p.ping(address, attempts, timeout).await,
            Self::Tcp(p) => p.ping(address, attempts, timeout).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_ping_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let pinger = TcpPinger::new(port);
        assert!(pinger.ping("127.0.0.1", 1, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn tcp_ping_closed_port() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let pinger = TcpPinger::new(port);
        assert!(!pinger.ping("127.0.0.1", 2, Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn invalid_address_is_unreachable() {
        assert!(!TcpPinger::new(80).ping("not-an-ip", 1, Duration::from_millis(50)).await);
        assert!(!IcmpPinger::new().ping("-f", 1, Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn missing_ping_binary_is_unreachable() {
        let pinger = IcmpPinger::with_program("/nonexistent/upwatch-ping");
        assert!(!pinger.ping("127.0.0.1", 1, Duration::from_secs(1)).await);
    }

    #[test]
    fn probe_method_from_config_string() {
        #[derive(Deserialize)]
        struct Wrapper {
            method: ProbeMethod,
        }
        let w: Wrapper = serde_json::from_str(r#"{"method":"tcp"}"#).unwrap();
        assert_eq!(w.method, ProbeMethod::Tcp);
        assert!(matches!(
            NetworkPinger::from_method(ProbeMethod::Tcp, 22),
            NetworkPinger::Tcp(_)
        ));
    }
}
