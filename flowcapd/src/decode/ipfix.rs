//! Template-driven decoding shared by IPFIX and NetFlow v9 (component C2).
//!
//! Both protocols describe data records with a template announced earlier
//! in the stream, keyed by `(observation domain, template id)`. This module
//! doesn't depend on a third-party field dictionary: it understands just
//! the handful of information elements needed to populate a
//! [`flow_record::Record`], keeping everything else as an opaque byte span.
//! That mirrors how a hand-rolled IPFIX reader without a full IANA IE table
//! works in practice — known fields are mapped, the rest is skipped.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::SystemTime;

use bytes::{Buf, Bytes, BytesMut};
use flow_record::{FlowAddr, Record, TcpFlags};

use super::{boot_relative_to_epoch_ms, system_time_to_epoch_ms, Decoded, DecodeError, WireDecoder};
use crate::config::ProbeQuirks;

const IPFIX_HEADER_LEN: usize = 16;
const V9_HEADER_LEN: usize = 20;
const SET_HEADER_LEN: usize = 4;

const TEMPLATE_SET_ID: u16 = 0;
const OPTIONS_TEMPLATE_SET_ID_V9: u16 = 1;
const TEMPLATE_SET_ID_IPFIX: u16 = 2;
const OPTIONS_TEMPLATE_SET_ID_IPFIX: u16 = 3;
const DATA_SET_ID_MIN: u16 = 256;

/// How long an out-of-order data set waits for its template before it's
/// dropped as unrecoverable.
const TEMPLATE_WAIT: std::time::Duration = std::time::Duration::from_secs(60);
const MAX_PENDING_UNRESOLVED: usize = 256;

// Information-element numbers this decoder understands. Numbering is shared
// between NetFlow v9 and IPFIX for the low IDs (RFC 7012 inherited the v9
// field-type registry).
mod ie {
    pub const OCTET_DELTA_COUNT: u16 = 1;
    pub const PACKET_DELTA_COUNT: u16 = 2;
    pub const PROTOCOL_IDENTIFIER: u16 = 4;
    pub const TCP_CONTROL_BITS: u16 = 6;
    pub const SOURCE_TRANSPORT_PORT: u16 = 7;
    pub const SOURCE_IPV4_ADDRESS: u16 = 8;
    pub const INGRESS_INTERFACE: u16 = 10;
    pub const DESTINATION_TRANSPORT_PORT: u16 = 11;
    pub const DESTINATION_IPV4_ADDRESS: u16 = 12;
    pub const EGRESS_INTERFACE: u16 = 14;
    pub const IP_NEXT_HOP_IPV4_ADDRESS: u16 = 15;
    pub const FLOW_END_SYSUPTIME: u16 = 21;
    pub const FLOW_START_SYSUPTIME: u16 = 22;
    pub const SOURCE_IPV6_ADDRESS: u16 = 27;
    pub const DESTINATION_IPV6_ADDRESS: u16 = 28;
    pub const IPV6_NEXT_HOP: u16 = 62;
    pub const APPLICATION_ID: u16 = 95;
    pub const FLOW_END_MILLISECONDS: u16 = 153;
    pub const FLOW_START_MILLISECONDS: u16 = 152;
    pub const FIREWALL_EVENT: u16 = 233;
    pub const NF_F_FW_EXT_EVENT: u16 = 33002;
    pub const NF_F_FW_EVENT: u16 = 40005;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    V9,
    Ipfix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TemplateField {
    id: u16,
    length: u16,
}

#[derive(Debug, Clone)]
struct Template {
    fields: Vec<TemplateField>,
    cached_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TemplateKey {
    domain_id: u32,
    template_id: u16,
}

struct PendingDataSet {
    key: TemplateKey,
    bytes: Bytes,
    header_uptime_ms: Option<u32>,
    wall_ms: i64,
    deadline_ms: i64,
}

/// Decodes NetFlow v9 or IPFIX messages, dispatching on the version field
/// in each message header. The two protocols differ only in header layout
/// and set-id numbering; data-set field extraction is identical.
pub struct TemplatedDecoder {
    buf: BytesMut,
    templates: HashMap<TemplateKey, Template>,
    pending_unresolved: VecDeque<PendingDataSet>,
    ready: VecDeque<Record>,
    quirks: ProbeQuirks,
}

impl TemplatedDecoder {
    pub fn new(quirks: ProbeQuirks) -> Self {
        Self {
            buf: BytesMut::new(),
            templates: HashMap::new(),
            pending_unresolved: VecDeque::new(),
            ready: VecDeque::new(),
            quirks,
        }
    }

    fn drain_messages(&mut self, wall_ms: i64) {
        loop {
            if self.buf.len() < 2 {
                return;
            }
            let version = u16::from_be_bytes([self.buf[0], self.buf[1]]);
            let dialect = match version {
                9 => Dialect::V9,
                10 => Dialect::Ipfix,
                other => {
                    tracing::warn!(version = other, "unsupported netflow v9/ipfix version, discarding buffer");
                    self.buf.clear();
                    return;
                }
            };

            let header_len = match dialect {
                Dialect::V9 => V9_HEADER_LEN,
                Dialect::Ipfix => IPFIX_HEADER_LEN,
            };
            if self.buf.len() < header_len {
                return;
            }

            let total_len = match dialect {
                Dialect::Ipfix => u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize,
                // v9 has no total-length field; assume one message per feed
                // (UDP datagram boundary) and consume the whole buffer.
                Dialect::V9 => self.buf.len(),
            };
            if total_len < header_len || self.buf.len() < total_len {
                return;
            }

            let message = self.buf.split_to(total_len).freeze();
            if let Err(err) = self.process_message(dialect, message, wall_ms) {
                tracing::warn!(%err, "dropping malformed netflow v9/ipfix message");
            }
        }
    }

    fn process_message(&mut self, dialect: Dialect, message: Bytes, wall_ms: i64) -> Result<(), DecodeError> {
        let mut cursor = message.clone();
        let (domain_id, header_uptime_ms) = match dialect {
            Dialect::Ipfix => {
                cursor.advance(4);
                let _export_time = cursor.get_u32();
                let _seq = cursor.get_u32();
                let domain_id = cursor.get_u32();
                (domain_id, None)
            }
            Dialect::V9 => {
                cursor.advance(2);
                let _count = cursor.get_u16();
                let sys_up_time = cursor.get_u32();
                let _unix_secs = cursor.get_u32();
                let _seq = cursor.get_u32();
                let domain_id = cursor.get_u32();
                (domain_id, Some(sys_up_time))
            }
        };

        while cursor.remaining() >= SET_HEADER_LEN {
            let set_id = cursor.get_u16();
            let set_len = cursor.get_u16() as usize;
            if set_len < SET_HEADER_LEN || cursor.remaining() < set_len - SET_HEADER_LEN {
                break;
            }
            let body = cursor.copy_to_bytes(set_len - SET_HEADER_LEN);
            self.process_set(dialect, domain_id, set_id, body, header_uptime_ms, wall_ms);
        }

        Ok(())
    }

    fn process_set(
        &mut self,
        dialect: Dialect,
        domain_id: u32,
        set_id: u16,
        body: Bytes,
        header_uptime_ms: Option<u32>,
        wall_ms: i64,
    ) {
        let is_template_set = match dialect {
            Dialect::V9 => set_id == TEMPLATE_SET_ID,
            Dialect::Ipfix => set_id == TEMPLATE_SET_ID_IPFIX,
        };
        let is_options_template = match dialect {
            Dialect::V9 => set_id == OPTIONS_TEMPLATE_SET_ID_V9,
            Dialect::Ipfix => set_id == OPTIONS_TEMPLATE_SET_ID_IPFIX,
        };

        if is_template_set {
            self.learn_templates(domain_id, body, wall_ms);
            self.retry_pending();
            return;
        }
        if is_options_template {
            // Options templates describe scope/exporter metadata we don't
            // project into a record; skip without caching them.
            return;
        }
        if set_id < DATA_SET_ID_MIN {
            return;
        }

        let key = TemplateKey { domain_id, template_id: set_id };
        match self.templates.get(&key) {
            Some(template) => self.decode_data_set(&key, template.clone(), &body, header_uptime_ms, wall_ms),
            None => {
                if self.pending_unresolved.len() >= MAX_PENDING_UNRESOLVED {
                    self.pending_unresolved.pop_front();
                }
                self.pending_unresolved.push_back(PendingDataSet {
                    key,
                    bytes: body,
                    header_uptime_ms,
                    wall_ms,
                    deadline_ms: wall_ms + TEMPLATE_WAIT.as_millis() as i64,
                });
            }
        }
    }

    fn learn_templates(&mut self, domain_id: u32, mut body: Bytes, wall_ms: i64) {
        while body.remaining() >= 4 {
            let template_id = body.get_u16();
            let field_count = body.get_u16();
            let mut fields = Vec::with_capacity(field_count as usize);
            for _ in 0..field_count {
                if body.remaining() < 4 {
                    return;
                }
                let raw_id = body.get_u16();
                let length = body.get_u16();
                let enterprise_flag = raw_id & 0x8000 != 0;
                let id = raw_id & 0x7FFF;
                if enterprise_flag {
                    if body.remaining() < 4 {
                        return;
                    }
                    let _enterprise = body.get_u32();
                }
                fields.push(TemplateField { id, length });
            }
            self.templates.insert(
                TemplateKey { domain_id, template_id },
                Template { fields, cached_at_ms: wall_ms },
            );
        }
    }

    fn retry_pending(&mut self) {
        let mut still_pending = VecDeque::new();
        while let Some(pending) = self.pending_unresolved.pop_front() {
            if let Some(template) = self.templates.get(&pending.key).cloned() {
                self.decode_data_set(&pending.key, template, &pending.bytes, pending.header_uptime_ms, pending.wall_ms);
            } else {
                still_pending.push_back(pending);
            }
        }
        self.pending_unresolved = still_pending;
    }

    fn expire_pending(&mut self, now_ms: i64) {
        let before = self.pending_unresolved.len();
        self.pending_unresolved.retain(|p| p.deadline_ms > now_ms);
        let dropped = before - self.pending_unresolved.len();
        if dropped > 0 {
            tracing::warn!(dropped, "discarding data sets whose template never arrived");
        }
    }

    fn decode_data_set(
        &mut self,
        key: &TemplateKey,
        template: Template,
        body: &Bytes,
        header_uptime_ms: Option<u32>,
        wall_ms: i64,
    ) {
        let record_len: usize = template.fields.iter().map(|f| f.length as usize).sum();
        if record_len == 0 {
            return;
        }
        let mut offset = 0;
        while offset + record_len <= body.len() {
            let fields = &body[offset..offset + record_len];
            match build_record(&template.fields, fields, header_uptime_ms, wall_ms, self.quirks) {
                Ok(Some(record)) => self.ready.push_back(record),
                Ok(None) => {}
                Err(err) => tracing::warn!(%err, domain_id = key.domain_id, template_id = key.template_id, "dropping malformed data record"),
            }
            offset += record_len;
        }
    }
}

#[derive(Default, Clone, Copy)]
struct Fields {
    bytes: Option<u64>,
    packets: Option<u64>,
    protocol: Option<u8>,
    tcp_flags: Option<u8>,
    src_port: Option<u16>,
    dst_port: Option<u16>,
    src_v4: Option<Ipv4Addr>,
    dst_v4: Option<Ipv4Addr>,
    src_v6: Option<Ipv6Addr>,
    dst_v6: Option<Ipv6Addr>,
    next_hop_v4: Option<Ipv4Addr>,
    next_hop_v6: Option<Ipv6Addr>,
    input_if: Option<u32>,
    output_if: Option<u32>,
    start_sysuptime_ms: Option<u32>,
    end_sysuptime_ms: Option<u32>,
    start_ms_absolute: Option<i64>,
    end_ms_absolute: Option<i64>,
    application_id: Option<u32>,
    memo: u16,
}

fn build_record(
    template_fields: &[TemplateField],
    buf: &[u8],
    header_uptime_ms: Option<u32>,
    wall_ms: i64,
    quirks: ProbeQuirks,
) -> Result<Option<Record>, DecodeError> {
    let mut parsed = Fields::default();
    let mut offset = 0usize;
    for field in template_fields {
        let len = field.length as usize;
        if offset + len > buf.len() {
            return Err(DecodeError::ShortBuffer { need: offset + len, got: buf.len() });
        }
        let slice = &buf[offset..offset + len];
        apply_field(&mut parsed, field.id, slice, quirks)?;
        offset += len;
    }

    let packets = match parsed.packets {
        Some(0) if quirks.zero_packets => 1,
        Some(p) => p,
        None => return Ok(None),
    };
    let bytes = parsed.bytes.unwrap_or(packets).max(packets);

    let (src_addr, dst_addr, next_hop) = if let (Some(s), Some(d)) = (parsed.src_v6, parsed.dst_v6) {
        (
            FlowAddr::from(s),
            FlowAddr::from(d),
            parsed.next_hop_v6.map(FlowAddr::from).unwrap_or(FlowAddr::from(s)),
        )
    } else if let (Some(s), Some(d)) = (parsed.src_v4, parsed.dst_v4) {
        (
            FlowAddr::from(s),
            FlowAddr::from(d),
            parsed.next_hop_v4.map(FlowAddr::from).unwrap_or(FlowAddr::from(s)),
        )
    } else {
        return Ok(None);
    };

    let start_time_ms = if let Some(abs) = parsed.start_ms_absolute {
        abs
    } else if let (Some(device_uptime), Some(event_uptime)) = (header_uptime_ms, parsed.start_sysuptime_ms) {
        boot_relative_to_epoch_ms(wall_ms, device_uptime, event_uptime)
    } else {
        wall_ms
    };
    let end_time_ms = if let Some(abs) = parsed.end_ms_absolute {
        abs
    } else if let (Some(device_uptime), Some(event_uptime)) = (header_uptime_ms, parsed.end_sysuptime_ms) {
        boot_relative_to_epoch_ms(wall_ms, device_uptime, event_uptime)
    } else {
        start_time_ms
    };
    let duration_ms = end_time_ms.saturating_sub(start_time_ms).max(0) as u32;

    let tcp_flags_val = parsed.tcp_flags.unwrap_or(0);
    Record::new(
        start_time_ms,
        duration_ms,
        src_addr,
        dst_addr,
        next_hop,
        parsed.src_port.unwrap_or(0),
        parsed.dst_port.unwrap_or(0),
        parsed.protocol.unwrap_or(0),
        TcpFlags {
            all: tcp_flags_val,
            initial: tcp_flags_val,
            session: 0,
        },
        parsed.input_if.unwrap_or(0),
        parsed.output_if.unwrap_or(0),
        packets,
        bytes,
        0,
        0,
        parsed.application_id.unwrap_or(0),
        0,
        parsed.memo,
    )
    .map(Some)
    .map_err(|source| DecodeError::InvalidRecord { source })
}

fn apply_field(parsed: &mut Fields, id: u16, slice: &[u8], quirks: ProbeQuirks) -> Result<(), DecodeError> {
    match id {
        ie::OCTET_DELTA_COUNT => parsed.bytes = Some(uint_field(slice)?),
        ie::PACKET_DELTA_COUNT => parsed.packets = Some(uint_field(slice)?),
        ie::PROTOCOL_IDENTIFIER => parsed.protocol = Some(u8_field(slice)?),
        ie::TCP_CONTROL_BITS => parsed.tcp_flags = Some(uint_field(slice)? as u8),
        ie::SOURCE_TRANSPORT_PORT => parsed.src_port = Some(u16_field(slice)?),
        ie::DESTINATION_TRANSPORT_PORT => parsed.dst_port = Some(u16_field(slice)?),
        ie::SOURCE_IPV4_ADDRESS => parsed.src_v4 = Some(ipv4_field(slice)?),
        ie::DESTINATION_IPV4_ADDRESS => parsed.dst_v4 = Some(ipv4_field(slice)?),
        ie::SOURCE_IPV6_ADDRESS => parsed.src_v6 = Some(ipv6_field(slice)?),
        ie::DESTINATION_IPV6_ADDRESS => parsed.dst_v6 = Some(ipv6_field(slice)?),
        ie::IP_NEXT_HOP_IPV4_ADDRESS => parsed.next_hop_v4 = Some(ipv4_field(slice)?),
        ie::IPV6_NEXT_HOP => parsed.next_hop_v6 = Some(ipv6_field(slice)?),
        ie::INGRESS_INTERFACE => parsed.input_if = Some(uint_field(slice)? as u32),
        ie::EGRESS_INTERFACE => parsed.output_if = Some(uint_field(slice)? as u32),
        ie::FLOW_START_SYSUPTIME => parsed.start_sysuptime_ms = Some(uint_field(slice)? as u32),
        ie::FLOW_END_SYSUPTIME => parsed.end_sysuptime_ms = Some(uint_field(slice)? as u32),
        ie::FLOW_START_MILLISECONDS => parsed.start_ms_absolute = Some(uint_field(slice)? as i64),
        ie::FLOW_END_MILLISECONDS => parsed.end_ms_absolute = Some(uint_field(slice)? as i64),
        ie::APPLICATION_ID => parsed.application_id = Some(uint_field(slice)? as u32),
        ie::FIREWALL_EVENT | ie::NF_F_FW_EXT_EVENT | ie::NF_F_FW_EVENT if quirks.firewall_events => {
            parsed.memo = (parsed.memo << 4) | (uint_field(slice)? as u16 & 0x0F);
        }
        _ => {}
    }
    Ok(())
}

fn u8_field(slice: &[u8]) -> Result<u8, DecodeError> {
    slice
        .first()
        .copied()
        .ok_or(DecodeError::UnsupportedFieldLength { field: "u8", length: slice.len() })
}

fn u16_field(slice: &[u8]) -> Result<u16, DecodeError> {
    match slice.len() {
        2 => Ok(u16::from_be_bytes([slice[0], slice[1]])),
        _ => Err(DecodeError::UnsupportedFieldLength { field: "u16", length: slice.len() }),
    }
}

fn uint_field(slice: &[u8]) -> Result<u64, DecodeError> {
    if slice.is_empty() || slice.len() > 8 {
        return Err(DecodeError::UnsupportedFieldLength { field: "uint", length: slice.len() });
    }
    let mut buf = [0u8; 8];
    buf[8 - slice.len()..].copy_from_slice(slice);
    Ok(u64::from_be_bytes(buf))
}

fn ipv4_field(slice: &[u8]) -> Result<Ipv4Addr, DecodeError> {
    match slice.len() {
        4 => Ok(Ipv4Addr::new(slice[0], slice[1], slice[2], slice[3])),
        _ => Err(DecodeError::UnsupportedFieldLength { field: "ipv4", length: slice.len() }),
    }
}

fn ipv6_field(slice: &[u8]) -> Result<Ipv6Addr, DecodeError> {
    match slice.len() {
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(slice);
            Ok(Ipv6Addr::from(octets))
        }
        _ => Err(DecodeError::UnsupportedFieldLength { field: "ipv6", length: slice.len() }),
    }
}

impl WireDecoder for TemplatedDecoder {
    fn feed(&mut self, bytes: &[u8], received_at: SystemTime) {
        let wall_ms = system_time_to_epoch_ms(received_at);
        self.buf.extend_from_slice(bytes);
        self.drain_messages(wall_ms);
        self.expire_pending(wall_ms);
    }

    fn next(&mut self) -> Result<Decoded, DecodeError> {
        Ok(match self.ready.pop_front() {
            Some(record) => Decoded::Record(record),
            None => Decoded::EndOfStream,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn ipfix_template_message(domain_id: u32, template_id: u16) -> Vec<u8> {
        let mut fields = Vec::new();
        fields.extend_from_slice(&ie::SOURCE_IPV4_ADDRESS.to_be_bytes());
        fields.extend_from_slice(&4u16.to_be_bytes());
        fields.extend_from_slice(&ie::DESTINATION_IPV4_ADDRESS.to_be_bytes());
        fields.extend_from_slice(&4u16.to_be_bytes());
        fields.extend_from_slice(&ie::SOURCE_TRANSPORT_PORT.to_be_bytes());
        fields.extend_from_slice(&2u16.to_be_bytes());
        fields.extend_from_slice(&ie::DESTINATION_TRANSPORT_PORT.to_be_bytes());
        fields.extend_from_slice(&2u16.to_be_bytes());
        fields.extend_from_slice(&ie::PROTOCOL_IDENTIFIER.to_be_bytes());
        fields.extend_from_slice(&1u16.to_be_bytes());
        fields.extend_from_slice(&ie::PACKET_DELTA_COUNT.to_be_bytes());
        fields.extend_from_slice(&4u16.to_be_bytes());
        fields.extend_from_slice(&ie::OCTET_DELTA_COUNT.to_be_bytes());
        fields.extend_from_slice(&4u16.to_be_bytes());
        fields.extend_from_slice(&ie::FLOW_START_MILLISECONDS.to_be_bytes());
        fields.extend_from_slice(&8u16.to_be_bytes());
        fields.extend_from_slice(&ie::FLOW_END_MILLISECONDS.to_be_bytes());
        fields.extend_from_slice(&8u16.to_be_bytes());

        let field_count = 8u16;
        let mut set_body = Vec::new();
        set_body.extend_from_slice(&template_id.to_be_bytes());
        set_body.extend_from_slice(&field_count.to_be_bytes());
        set_body.extend_from_slice(&fields);

        let mut set = Vec::new();
        set.extend_from_slice(&TEMPLATE_SET_ID_IPFIX.to_be_bytes());
        set.extend_from_slice(&((set_body.len() + SET_HEADER_LEN) as u16).to_be_bytes());
        set.extend_from_slice(&set_body);

        wrap_ipfix_message(domain_id, set)
    }

    fn ipfix_data_message(domain_id: u32, template_id: u16) -> Vec<u8> {
        let mut record = Vec::new();
        record.extend_from_slice(&Ipv4Addr::new(10, 1, 1, 1).octets());
        record.extend_from_slice(&Ipv4Addr::new(8, 8, 8, 8).octets());
        record.extend_from_slice(&51000u16.to_be_bytes());
        record.extend_from_slice(&443u16.to_be_bytes());
        record.push(6);
        record.extend_from_slice(&7u32.to_be_bytes());
        record.extend_from_slice(&5000u32.to_be_bytes());
        record.extend_from_slice(&1_700_000_000_000u64.to_be_bytes());
        record.extend_from_slice(&1_700_000_001_500u64.to_be_bytes());

        let mut set = Vec::new();
        set.extend_from_slice(&template_id.to_be_bytes());
        set.extend_from_slice(&((record.len() + SET_HEADER_LEN) as u16).to_be_bytes());
        set.extend_from_slice(&record);

        wrap_ipfix_message(domain_id, set)
    }

    fn wrap_ipfix_message(domain_id: u32, set: Vec<u8>) -> Vec<u8> {
        let mut msg = Vec::new();
        let total_len = (IPFIX_HEADER_LEN + set.len()) as u16;
        msg.extend_from_slice(&10u16.to_be_bytes());
        msg.extend_from_slice(&total_len.to_be_bytes());
        msg.extend_from_slice(&0u32.to_be_bytes());
        msg.extend_from_slice(&0u32.to_be_bytes());
        msg.extend_from_slice(&domain_id.to_be_bytes());
        msg.extend_from_slice(&set);
        msg
    }

    #[test]
    fn decodes_data_record_once_template_is_known() {
        let mut decoder = TemplatedDecoder::new(ProbeQuirks::default());
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_100);
        decoder.feed(&ipfix_template_message(7, 256), now);
        decoder.feed(&ipfix_data_message(7, 256), now);

        match decoder.next().unwrap() {
            Decoded::Record(record) => {
                assert_eq!(record.packets(), 7);
                assert_eq!(record.bytes(), 5000);
                assert_eq!(record.dst_port(), 443);
                assert_eq!(record.duration_ms(), 1500);
            }
            Decoded::EndOfStream => panic!("expected a record"),
        }
    }

    #[test]
    fn buffers_data_records_that_precede_their_template() {
        let mut decoder = TemplatedDecoder::new(ProbeQuirks::default());
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_100);
        decoder.feed(&ipfix_data_message(7, 257), now);
        assert!(matches!(decoder.next().unwrap(), Decoded::EndOfStream));

        decoder.feed(&ipfix_template_message(7, 257), now);
        match decoder.next().unwrap() {
            Decoded::Record(record) => assert_eq!(record.dst_port(), 443),
            Decoded::EndOfStream => panic!("expected the buffered record to resolve"),
        }
    }
}
