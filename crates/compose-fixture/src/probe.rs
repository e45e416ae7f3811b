use std::{fmt, net::IpAddr, str::FromStr, sync::Arc, time::Duration};

use serde::Serialize;

use crate::error::ComposeError;

/// Caller-supplied readiness predicate. An `Err` aborts the whole bring-up.
pub type CheckFn = Arc<dyn Fn() -> anyhow::Result<bool> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A container port in `port/proto` form, e.g. `5432/tcp`. A bare port means tcp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Udp,
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol.as_str())
    }
}

impl FromStr for PortSpec {
    type Err = ComposeError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ComposeError::InvalidPort {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = spec.trim();
        let (port, protocol) = match trimmed.split_once('/') {
            Some((port, proto)) => (port, proto),
            None => (trimmed, "tcp"),
        };
        let protocol = match protocol.to_ascii_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            _ => return Err(invalid("protocol must be tcp or udp")),
        };
        let port = port
            .parse::<u16>()
            .map_err(|_| invalid("port must be a number between 1 and 65535"))?;
        if port == 0 {
            return Err(invalid("port must be a number between 1 and 65535"));
        }
        Ok(Self { port, protocol })
    }
}

pub enum Probe {
    Custom {
        check: CheckFn,
        timeout: Duration,
    },
    Port {
        port: PortSpec,
        timeout: Duration,
        address: Option<IpAddr>,
    },
    Process {
        process: String,
        timeout: Duration,
    },
}

impl Probe {
    pub fn kind(&self) -> &'static str {
        match self {
            Probe::Custom { .. } => "custom",
            Probe::Port { .. } => "port",
            Probe::Process { .. } => "process",
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            Probe::Custom { timeout, .. }
            | Probe::Port { timeout, .. }
            | Probe::Process { timeout, .. } => *timeout,
        }
    }
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Probe::Custom { timeout, .. } => f
                .debug_struct("Custom")
                .field("timeout", timeout)
                .finish_non_exhaustive(),
            Probe::Port {
                port,
                timeout,
                address,
            } => f
                .debug_struct("Port")
                .field("port", port)
                .field("timeout", timeout)
                .field("address", address)
                .finish(),
            Probe::Process { process, timeout } => f
                .debug_struct("Process")
                .field("process", process)
                .field("timeout", timeout)
                .finish(),
        }
    }
}

/// A probe bound to the compose service it checks.
#[derive(Debug)]
pub struct WaitCondition {
    pub service: String,
    pub probe: Probe,
}

/// Serializable description of a wait condition, without the predicate itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitSummary {
    pub service: String,
    pub kind: &'static str,
    pub target: Option<String>,
    pub timeout_ms: u64,
}

impl WaitCondition {
    pub fn summary(&self) -> WaitSummary {
        let target = match &self.probe {
            Probe::Custom { .. } => None,
            Probe::Port { port, address, .. } => Some(match address {
                Some(address) => format!("{port}@{address}"),
                None => port.to_string(),
            }),
            Probe::Process { process, .. } => Some(process.clone()),
        };
        WaitSummary {
            service: self.service.clone(),
            kind: self.probe.kind(),
            target,
            timeout_ms: u64::try_from(self.probe.timeout().as_millis()).unwrap_or(u64::MAX),
        }
    }
}
