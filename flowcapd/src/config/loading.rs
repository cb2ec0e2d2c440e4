//! Sensor-configuration file parsing.
//!
//! Probes and sensors reference each other by name (a probe feeds sensors; a
//! sensor doesn't know its probes). Per the cyclic-wiring design note we
//! build both collections by name in one pass, then resolve probe->sensor
//! references to indexes in a second pass rather than using shared
//! ownership.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use super::probe::{Probe, ProbeQuirks, ProbeType, Transport};
use super::sensor::{Decider, Sensor, SensorConfigError};

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to read sensor configuration '{}': {source}", path.display()))]
    Read { path: PathBuf, source: std::io::Error },
    #[snafu(display("failed to parse sensor configuration: {source}"))]
    Parse { source: toml::de::Error },
    #[snafu(display("duplicate probe name '{name}'"))]
    DuplicateProbeName { name: String },
    #[snafu(display("duplicate sensor name '{name}'"))]
    DuplicateSensorName { name: String },
    #[snafu(display("probe '{probe}' references unknown sensor '{sensor}'"))]
    UnknownSensorReference { probe: String, sensor: String },
    #[snafu(display("probe '{name}' has no valid transport binding: {reason}"))]
    InvalidTransport { name: String, reason: String },
    #[snafu(display("sensor '{name}' has an invalid decider: {reason}"))]
    InvalidDecider { name: String, reason: String },
    #[snafu(display("{source}"))]
    Sensor { source: SensorConfigError },
    #[snafu(display("probe '{name}' has type 'file' but no file source path configured"))]
    FileProbeMissingPath { name: String },
    #[snafu(display("probe '{name}' has type 'file', which has no receive-loop implementation"))]
    FileProbeUnsupported { name: String },
    #[snafu(display(
        "probe '{name}' has type '{probe_type}' but a '{transport_kind}' transport; only a 'file' probe may use a 'file' transport"
    ))]
    TransportTypeMismatch {
        name: String,
        probe_type: String,
        transport_kind: String,
    },
}

/// A fully parsed and cross-referenced sensor configuration.
#[derive(Debug, Clone)]
pub struct SensorConfig {
    pub probes: Vec<Probe>,
    pub sensors: Vec<Sensor>,
    /// `probe_index -> sensor_index` resolved from [`Probe::sensors`] names.
    pub probe_sensor_links: Vec<Vec<usize>>,
}

impl SensorConfig {
    pub fn probe_names(&self) -> impl Iterator<Item = &str> {
        self.probes.iter().map(|p| p.name.as_str())
    }

    /// Parses and fully verifies a configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).context(ReadSnafu { path: path.to_path_buf() })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text).context(ParseSnafu)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut seen_probes = BTreeSet::new();
        let mut probes = Vec::with_capacity(raw.probes.len());
        for rp in raw.probes {
            if !seen_probes.insert(rp.name.clone()) {
                return Err(ConfigError::DuplicateProbeName { name: rp.name });
            }
            probes.push(rp.into_probe()?);
        }

        let mut seen_sensors = BTreeSet::new();
        let mut sensors = Vec::with_capacity(raw.sensors.len());
        for rs in raw.sensors {
            if !seen_sensors.insert(rs.name.clone()) {
                return Err(ConfigError::DuplicateSensorName { name: rs.name });
            }
            let sensor = rs.into_sensor()?;
            sensor.verify().context(SensorSnafu)?;
            sensors.push(sensor);
        }

        let sensor_index: HashMap<&str, usize> =
            sensors.iter().enumerate().map(|(i, s)| (s.name.as_str(), i)).collect();

        let mut probe_sensor_links = Vec::with_capacity(probes.len());
        for probe in &probes {
            if probe.probe_type == ProbeType::File {
                if !matches!(probe.transport, Transport::File(_)) {
                    return Err(ConfigError::FileProbeMissingPath { name: probe.name.clone() });
                }
                return Err(ConfigError::FileProbeUnsupported { name: probe.name.clone() });
            }
            if matches!(probe.transport, Transport::File(_)) {
                return Err(ConfigError::TransportTypeMismatch {
                    name: probe.name.clone(),
                    probe_type: probe.probe_type.as_str().to_string(),
                    transport_kind: probe.transport.kind().to_string(),
                });
            }
            let mut links = Vec::with_capacity(probe.sensors.len());
            for sensor_name in &probe.sensors {
                let idx = sensor_index.get(sensor_name.as_str()).copied().ok_or_else(|| {
                    ConfigError::UnknownSensorReference {
                        probe: probe.name.clone(),
                        sensor: sensor_name.clone(),
                    }
                })?;
                links.push(idx);
            }
            probe_sensor_links.push(links);
        }

        Ok(Self {
            probes,
            sensors,
            probe_sensor_links,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    probes: Vec<RawProbe>,
    #[serde(default)]
    sensors: Vec<RawSensor>,
}

#[derive(Debug, Deserialize)]
struct RawProbe {
    name: String,
    #[serde(rename = "type")]
    probe_type: String,
    transport: RawTransport,
    #[serde(default)]
    sensors: Vec<String>,
    #[serde(default)]
    zero_packets: bool,
    #[serde(default)]
    firewall_events: bool,
}

impl RawProbe {
    fn into_probe(self) -> Result<Probe, ConfigError> {
        let probe_type = ProbeType::from_str(&self.probe_type).map_err(|reason| ConfigError::InvalidTransport {
            name: self.name.clone(),
            reason,
        })?;
        let transport = self.transport.into_transport(&self.name)?;
        let mut probe = Probe::new(self.name, probe_type, transport);
        probe.sensors = self.sensors;
        probe.quirks = ProbeQuirks {
            zero_packets: self.zero_packets,
            firewall_events: self.firewall_events,
        };
        Ok(probe)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum RawTransport {
    Udp { addr: String },
    Tcp { addr: String },
    File { path: String },
}

impl RawTransport {
    fn into_transport(self, probe_name: &str) -> Result<Transport, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidTransport {
            name: probe_name.to_string(),
            reason,
        };
        Ok(match self {
            RawTransport::Udp { addr } => {
                Transport::Udp(SocketAddr::from_str(&addr).map_err(|e| invalid(e.to_string()))?)
            }
            RawTransport::Tcp { addr } => {
                Transport::Tcp(SocketAddr::from_str(&addr).map_err(|e| invalid(e.to_string()))?)
            }
            RawTransport::File { path } => Transport::File(PathBuf::from(path)),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawSensor {
    name: String,
    id: u32,
    class: String,
    #[serde(default)]
    external: RawDecider,
    #[serde(default)]
    internal: RawDecider,
    #[serde(default)]
    null: RawDecider,
}

impl RawSensor {
    fn into_sensor(self) -> Result<Sensor, ConfigError> {
        let mut sensor = Sensor::new(self.name.clone(), self.id, self.class);
        sensor.external = self.external.into_decider(&self.name)?;
        sensor.internal = self.internal.into_decider(&self.name)?;
        sensor.null = self.null.into_decider(&self.name)?;
        Ok(sensor)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawDecider {
    #[default]
    Unset,
    InterfaceSet {
        interfaces: Vec<u32>,
    },
    InterfaceRemainder,
    IpBlockSet {
        blocks: Vec<String>,
    },
    IpBlockRemainder,
    IpSet {
        addrs: Vec<String>,
    },
    IpSetRemainder,
    NegatedIpBlockSet {
        blocks: Vec<String>,
    },
    NegatedIpSet {
        addrs: Vec<String>,
    },
}

impl RawDecider {
    fn into_decider(self, sensor_name: &str) -> Result<Decider, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidDecider {
            name: sensor_name.to_string(),
            reason,
        };
        Ok(match self {
            RawDecider::Unset => Decider::Unset,
            RawDecider::InterfaceSet { interfaces } => Decider::InterfaceSet(interfaces.into_iter().collect()),
            RawDecider::InterfaceRemainder => Decider::InterfaceRemainder,
            RawDecider::IpBlockSet { blocks } => Decider::IpBlockSet(parse_blocks(&blocks).map_err(invalid)?),
            RawDecider::IpBlockRemainder => Decider::IpBlockRemainder,
            RawDecider::IpSet { addrs } => Decider::IpSet(parse_addrs(&addrs).map_err(invalid)?),
            RawDecider::IpSetRemainder => Decider::IpSetRemainder,
            RawDecider::NegatedIpBlockSet { blocks } => {
                Decider::NegatedIpBlockSet(parse_blocks(&blocks).map_err(invalid)?)
            }
            RawDecider::NegatedIpSet { addrs } => Decider::NegatedIpSet(parse_addrs(&addrs).map_err(invalid)?),
        })
    }
}

fn parse_blocks(blocks: &[String]) -> Result<BTreeSet<(u32, u8)>, String> {
    blocks
        .iter()
        .map(|b| {
            let net = Ipv4Network::from_str(b).map_err(|e| format!("bad IP block '{b}': {e}"))?;
            Ok((u32::from(net.network()), net.prefix()))
        })
        .collect()
}

fn parse_addrs(addrs: &[String]) -> Result<BTreeSet<u32>, String> {
    addrs
        .iter()
        .map(|a| {
            std::net::Ipv4Addr::from_str(a)
                .map(u32::from)
                .map_err(|e| format!("bad IP address '{a}': {e}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
        [[sensors]]
        name = "S0"
        id = 1
        class = "all"
        [sensors.external]
        kind = "ip_block_set"
        blocks = ["10.0.0.0/8"]
        [sensors.internal]
        kind = "ip_block_remainder"

        [[probes]]
        name = "P0"
        type = "netflow-v5"
        sensors = ["S0"]
        [probes.transport]
        kind = "udp"
        addr = "127.0.0.1:9995"
    "#;

    #[test]
    fn parses_and_links_probe_to_sensor() {
        let cfg = SensorConfig::parse(VALID).unwrap();
        assert_eq!(cfg.probes.len(), 1);
        assert_eq!(cfg.sensors.len(), 1);
        assert_eq!(cfg.probe_sensor_links, vec![vec![0]]);
    }

    #[test]
    fn rejects_duplicate_probe_names() {
        let text = format!(
            "{VALID}\n[[probes]]\nname = \"P0\"\ntype = \"netflow-v5\"\nsensors = []\n[probes.transport]\nkind = \"udp\"\naddr = \"127.0.0.1:9996\"\n"
        );
        let err = SensorConfig::parse(&text).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateProbeName { .. }));
    }

    #[test]
    fn rejects_unknown_sensor_reference() {
        let text = VALID.replace("\"S0\"", "\"S0\", \"S-missing\"");
        let err = SensorConfig::parse(&text).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSensorReference { .. }));
    }

    #[test]
    fn rejects_non_file_probe_with_file_transport() {
        let text = r#"
            [[probes]]
            name = "P0"
            type = "netflow-v5"
            sensors = []
            [probes.transport]
            kind = "file"
            path = "/tmp/replay.bin"
        "#;
        let err = SensorConfig::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::TransportTypeMismatch { .. }));
    }

    #[test]
    fn rejects_mixed_decider_kinds_via_sensor_verify() {
        let text = r#"
            [[sensors]]
            name = "S0"
            id = 1
            class = "all"
            [sensors.external]
            kind = "interface_set"
            interfaces = [1]
            [sensors.internal]
            kind = "ip_block_set"
            blocks = ["10.0.0.0/8"]
        "#;
        let err = SensorConfig::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::Sensor { .. }));
    }
}
