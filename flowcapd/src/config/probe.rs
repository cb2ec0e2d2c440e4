//! Probe configuration: a named receiver endpoint bound to a transport.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Wire protocol a probe speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeType {
    NetflowV5,
    Ipfix,
    NetflowV9,
    SFlow,
    File,
}

impl ProbeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetflowV5 => "netflow-v5",
            Self::Ipfix => "ipfix",
            Self::NetflowV9 => "netflow-v9",
            Self::SFlow => "sflow",
            Self::File => "file",
        }
    }
}

impl std::str::FromStr for ProbeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "netflow-v5" => Ok(Self::NetflowV5),
            "ipfix" => Ok(Self::Ipfix),
            "netflow-v9" => Ok(Self::NetflowV9),
            "sflow" => Ok(Self::SFlow),
            "file" => Ok(Self::File),
            other => Err(format!("unknown probe type '{other}'")),
        }
    }
}

/// How a probe receives bytes off the wire (or from disk).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Udp(SocketAddr),
    Tcp(SocketAddr),
    File(PathBuf),
}

impl Transport {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Udp(_) => "udp",
            Self::Tcp(_) => "tcp",
            Self::File(_) => "file",
        }
    }
}

/// Quirks that change decode or codec behavior for records from this probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeQuirks {
    /// Treat zero-packet records as legitimate rather than malformed, and
    /// use the codec's explicit-bytes fallback layout for them.
    pub zero_packets: bool,
    /// Interpret vendor firewall-event information elements
    /// (`firewallEvent`, `NF_F_FW_EVENT`, `NF_F_FW_EXT_EVENT`).
    pub firewall_events: bool,
}

/// A configured receiver endpoint, immutable once built from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub name: String,
    pub probe_type: ProbeType,
    pub transport: Transport,
    pub quirks: ProbeQuirks,
    /// Names of sensors this probe feeds; resolved to indexes by
    /// [`super::loading::SensorConfig`] after both probes and sensors have
    /// been parsed by name.
    pub sensors: Vec<String>,
}

impl Probe {
    pub fn new(name: impl Into<String>, probe_type: ProbeType, transport: Transport) -> Self {
        Self {
            name: name.into(),
            probe_type,
            transport,
            quirks: ProbeQuirks::default(),
            sensors: Vec::new(),
        }
    }
}
