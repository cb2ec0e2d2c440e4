//! Sensor configuration: logical categorization targets and their network
//! deciders.

use std::collections::BTreeSet;

use flow_record::Record;
use snafu::Snafu;

/// One of the three roles a decider classifies addresses/interfaces into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NetworkRole {
    External,
    Internal,
    Null,
}

impl NetworkRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::External => "external",
            Self::Internal => "internal",
            Self::Null => "null",
        }
    }

    fn code(self) -> u16 {
        match self {
            Self::External => 0,
            Self::Internal => 1,
            Self::Null => 2,
        }
    }
}

/// Which side of a flow a decider is being evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Source,
    Destination,
}

/// How a [`NetworkRole`] is decided for a given flow record. Exactly one
/// decider is configured per role, or the role is left [`Decider::Unset`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decider {
    Unset,
    InterfaceSet(BTreeSet<u32>),
    InterfaceRemainder,
    IpBlockSet(BTreeSet<(u32, u8)>),
    IpBlockRemainder,
    IpSet(BTreeSet<u32>),
    IpSetRemainder,
    NegatedIpBlockSet(BTreeSet<(u32, u8)>),
    NegatedIpSet(BTreeSet<u32>),
}

impl Decider {
    fn kind(&self) -> DeciderKind {
        match self {
            Decider::Unset => DeciderKind::Unset,
            Decider::InterfaceSet(_) | Decider::InterfaceRemainder => DeciderKind::Interface,
            Decider::IpBlockSet(_)
            | Decider::IpBlockRemainder
            | Decider::IpSet(_)
            | Decider::IpSetRemainder => DeciderKind::Address,
            Decider::NegatedIpBlockSet(_) | Decider::NegatedIpSet(_) => DeciderKind::Negated,
        }
    }

    fn is_remainder(&self) -> bool {
        matches!(
            self,
            Decider::InterfaceRemainder | Decider::IpBlockRemainder | Decider::IpSetRemainder
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeciderKind {
    Unset,
    Interface,
    Address,
    Negated,
}

/// Errors raised while verifying a [`Sensor`]'s deciders. These are
/// configuration errors: rejected at startup, never at runtime.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum SensorConfigError {
    #[snafu(display("sensor '{name}': the external decider must be set"))]
    ExternalDeciderUnset { name: String },
    #[snafu(display(
        "sensor '{name}': deciders mix interface-based and address-based kinds, which is not allowed"
    ))]
    MixedDeciderKinds { name: String },
    #[snafu(display("sensor '{name}': at most one decider may use \"remainder\""))]
    MultipleRemainders { name: String },
    #[snafu(display("sensor '{name}': negated deciders are not implemented"))]
    NegatedDeciderNotImplemented { name: String },
}

/// A labeled categorization target. One probe may feed many sensors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sensor {
    pub name: String,
    pub id: u32,
    pub class: String,
    pub external: Decider,
    pub internal: Decider,
    pub null: Decider,
}

impl Sensor {
    pub fn new(name: impl Into<String>, id: u32, class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id,
            class: class.into(),
            external: Decider::Unset,
            internal: Decider::Unset,
            null: Decider::Unset,
        }
    }

    fn decider(&self, role: NetworkRole) -> &Decider {
        match role {
            NetworkRole::External => &self.external,
            NetworkRole::Internal => &self.internal,
            NetworkRole::Null => &self.null,
        }
    }

    /// Validates the (a)-(d) invariants from the sensor data model.
    pub fn verify(&self) -> Result<(), SensorConfigError> {
        if matches!(self.external, Decider::Unset) {
            return Err(SensorConfigError::ExternalDeciderUnset {
                name: self.name.clone(),
            });
        }

        let deciders = [
            self.decider(NetworkRole::External),
            self.decider(NetworkRole::Internal),
            self.decider(NetworkRole::Null),
        ];

        for d in &deciders {
            if matches!(d.kind(), DeciderKind::Negated) {
                return Err(SensorConfigError::NegatedDeciderNotImplemented {
                    name: self.name.clone(),
                });
            }
        }

        let configured_kinds: BTreeSet<&str> = deciders
            .iter()
            .filter(|d| !matches!(d.kind(), DeciderKind::Unset))
            .map(|d| match d.kind() {
                DeciderKind::Interface => "interface",
                DeciderKind::Address => "address",
                DeciderKind::Negated | DeciderKind::Unset => unreachable!(),
            })
            .collect();
        if configured_kinds.len() > 1 {
            return Err(SensorConfigError::MixedDeciderKinds {
                name: self.name.clone(),
            });
        }

        let remainder_count = deciders.iter().filter(|d| d.is_remainder()).count();
        if remainder_count > 1 {
            return Err(SensorConfigError::MultipleRemainders {
                name: self.name.clone(),
            });
        }

        Ok(())
    }

    /// Classifies one side of a flow against this sensor's three deciders.
    /// The first non-remainder decider that matches wins; a configured
    /// remainder decider catches everything else; otherwise the endpoint is
    /// [`NetworkRole::Null`].
    fn classify_endpoint(&self, record: &Record, endpoint: Endpoint) -> NetworkRole {
        let addr = match endpoint {
            Endpoint::Source => record.src_addr(),
            Endpoint::Destination => record.dst_addr(),
        }
        .to_ipv4()
        .map(u32::from);
        let iface = match endpoint {
            Endpoint::Source => record.input_if(),
            Endpoint::Destination => record.output_if(),
        };

        let mut remainder = None;
        for role in [NetworkRole::External, NetworkRole::Internal, NetworkRole::Null] {
            match self.decider(role) {
                Decider::Unset => {}
                Decider::InterfaceSet(set) => {
                    if set.contains(&iface) {
                        return role;
                    }
                }
                Decider::InterfaceRemainder => remainder = Some(role),
                Decider::IpBlockSet(blocks) => {
                    if let Some(addr) = addr {
                        if blocks.iter().any(|&(net, prefix)| block_contains(net, prefix, addr)) {
                            return role;
                        }
                    }
                }
                Decider::IpBlockRemainder => remainder = Some(role),
                Decider::IpSet(set) => {
                    if let Some(addr) = addr {
                        if set.contains(&addr) {
                            return role;
                        }
                    }
                }
                Decider::IpSetRemainder => remainder = Some(role),
                Decider::NegatedIpBlockSet(_) | Decider::NegatedIpSet(_) => {
                    // `verify()` rejects negated deciders at load time.
                }
            }
        }
        remainder.unwrap_or(NetworkRole::Null)
    }
}

fn block_contains(network: u32, prefix: u8, addr: u32) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - u32::from(prefix));
    addr & mask == network & mask
}

/// Classifies a record against the sensors feeding its probe, in the order
/// they're listed, returning the first sensor whose deciders place either
/// endpoint in a non-null role. `None` means no linked sensor claims the
/// record, and it should be written with its decoder-assigned defaults
/// (sensor ID 0, flowtype ID 0).
///
/// The flowtype ID is this sensor's own numbering: `role(source) * 3 +
/// role(destination)`, with roles ordered external=0/internal=1/null=2 — a
/// compact encoding of the nine source/destination role pairs, not a
/// standardized flow-type table.
pub fn classify(sensors: &[&Sensor], record: &Record) -> Option<(u32, u16)> {
    for sensor in sensors {
        let src = sensor.classify_endpoint(record, Endpoint::Source);
        let dst = sensor.classify_endpoint(record, Endpoint::Destination);
        if src == NetworkRole::Null && dst == NetworkRole::Null {
            continue;
        }
        let flowtype_id = src.code() * 3 + dst.code();
        return Some((sensor.id, flowtype_id));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_must_be_set() {
        let sensor = Sensor::new("S0", 0, "all");
        assert_eq!(
            sensor.verify().unwrap_err(),
            SensorConfigError::ExternalDeciderUnset { name: "S0".into() }
        );
    }

    #[test]
    fn rejects_mixed_interface_and_address_deciders() {
        let mut sensor = Sensor::new("S0", 0, "all");
        sensor.external = Decider::InterfaceSet([1].into());
        sensor.internal = Decider::IpBlockSet([(0x0A00_0000, 8)].into());
        assert_eq!(
            sensor.verify().unwrap_err(),
            SensorConfigError::MixedDeciderKinds { name: "S0".into() }
        );
    }

    #[test]
    fn rejects_multiple_remainders() {
        let mut sensor = Sensor::new("S0", 0, "all");
        sensor.external = Decider::InterfaceSet([1].into());
        sensor.internal = Decider::InterfaceRemainder;
        sensor.null = Decider::InterfaceRemainder;
        assert_eq!(
            sensor.verify().unwrap_err(),
            SensorConfigError::MultipleRemainders { name: "S0".into() }
        );
    }

    #[test]
    fn rejects_negated_deciders() {
        let mut sensor = Sensor::new("S0", 0, "all");
        sensor.external = Decider::NegatedIpSet([1].into());
        assert_eq!(
            sensor.verify().unwrap_err(),
            SensorConfigError::NegatedDeciderNotImplemented { name: "S0".into() }
        );
    }

    #[test]
    fn accepts_single_remainder_and_kind() {
        let mut sensor = Sensor::new("S0", 0, "all");
        sensor.external = Decider::IpBlockSet([(0x0A00_0000, 8)].into());
        sensor.internal = Decider::IpBlockRemainder;
        assert!(sensor.verify().is_ok());
    }

    fn record_with(src: u32, dst: u32) -> flow_record::Record {
        flow_record::Record::new(
            0,
            0,
            flow_record::FlowAddr::V4(src),
            flow_record::FlowAddr::V4(dst),
            flow_record::FlowAddr::V4(0),
            0,
            0,
            0,
            flow_record::TcpFlags::default(),
            0,
            0,
            1,
            1,
            0,
            0,
            0,
            0,
            0,
        )
        .unwrap()
    }

    #[test]
    fn classify_tags_outbound_flow_crossing_ip_block_boundary() {
        let mut sensor = Sensor::new("S0", 7, "all");
        sensor.external = Decider::IpBlockSet([(0x0A00_0000, 8)].into()); // 10.0.0.0/8
        sensor.internal = Decider::IpBlockRemainder;

        // src inside the configured ip block -> external; dst outside it
        // falls through to the internal remainder.
        let record = record_with(0x0A00_0001, 0xC0A80001);
        let (sensor_id, flowtype_id) = classify(&[&sensor], &record).unwrap();
        assert_eq!(sensor_id, 7);
        assert_eq!(flowtype_id, NetworkRole::External.code() * 3 + NetworkRole::Internal.code());
    }

    #[test]
    fn classify_skips_sensor_that_claims_neither_endpoint() {
        let mut sensor = Sensor::new("S0", 7, "all");
        sensor.external = Decider::IpSet([0x0A00_0001].into());
        sensor.internal = Decider::Unset;

        let record = record_with(0xC0A80001, 0xC0A80002);
        assert!(classify(&[&sensor], &record).is_none());
    }
}
