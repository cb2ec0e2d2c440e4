//! NetFlow v5 decoding, built on the `netflow_parser` crate's static V5
//! structures.
//!
//! A V5 datagram is self-describing and arrives whole over UDP, so decoding
//! is a single pass: parse the header and up to 30 flow sets, translate each
//! set's boot-relative timestamps to wall-clock millis anchored on the
//! header's own embedded timestamp, and hand back [`flow_record::Record`]
//! values with sensor classification left at zero for a later stage to fill
//! in. The header's `flow_sequence` counter is also tracked per decoder
//! instance so a dropped export can be counted as a loss distinct from a
//! malformed packet.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::time::SystemTime;

use flow_record::{FlowAddr, Record, TcpFlags};
use netflow_parser::NetflowParser;
use netflow_parser::NetflowPacket;

use super::{boot_relative_to_epoch_ms, Decoded, DecodeError, WireDecoder};
use crate::config::ProbeQuirks;

/// Cisco caps a V5 packet at 30 flow sets; anything above that is a
/// malformed or spoofed packet, not a real export.
const MAX_FLOWS_PER_PACKET: usize = 30;

pub struct NetflowV5Decoder {
    parser: NetflowParser,
    pending: VecDeque<Decoded>,
    quirks: ProbeQuirks,
    /// `flow_sequence` expected on the next header, once a first packet has
    /// established a baseline.
    next_sequence: Option<u32>,
}

impl NetflowV5Decoder {
    pub fn new(quirks: ProbeQuirks) -> Self {
        Self {
            parser: NetflowParser::default(),
            pending: VecDeque::new(),
            quirks,
            next_sequence: None,
        }
    }

    /// Compares `flow_sequence` against what the previous header's count
    /// predicted, then advances the baseline. Returns the size of the gap
    /// when the export stream has skipped ahead.
    fn sequence_gap(&mut self, flow_sequence: u32, count: u32) -> Option<u64> {
        let gap = self.next_sequence.and_then(|expected| {
            let delta = i64::from(flow_sequence) - i64::from(expected);
            (delta > 0).then_some(delta as u64)
        });
        self.next_sequence = Some(flow_sequence.wrapping_add(count));
        gap
    }
}

impl WireDecoder for NetflowV5Decoder {
    fn feed(&mut self, bytes: &[u8], _received_at: SystemTime) {
        let result = self.parser.parse_bytes(bytes);
        for packet in result.packets {
            if let NetflowPacket::V5(v5) = packet {
                let header = v5.header;
                if header.count as usize > MAX_FLOWS_PER_PACKET || v5.sets.len() > MAX_FLOWS_PER_PACKET {
                    tracing::warn!(count = header.count, "netflow v5 packet exceeds 30-flow cap, dropping");
                    continue;
                }
                if let Some(lost) = self.sequence_gap(header.flow_sequence, u32::from(header.count)) {
                    tracing::warn!(lost, "netflow v5 flow_sequence gap detected");
                    self.pending.push_back(Decoded::SequenceGap { lost });
                }
                let device_uptime_ms = header.sys_up_time.as_millis() as u32;
                let wall_ms = i64::from(header.unix_secs) * 1000 + i64::from(header.unix_nsecs) / 1_000_000;
                for set in &v5.sets {
                    match build_record(set, wall_ms, device_uptime_ms, self.quirks) {
                        Ok(record) => self.pending.push_back(Decoded::Record(record)),
                        Err(err) => tracing::warn!(%err, "dropping malformed netflow v5 flow set"),
                    }
                }
            } else {
                tracing::warn!("netflow v5 probe received a non-v5 packet, dropping");
            }
        }
        if let Some(err) = result.error {
            tracing::debug!(%err, "netflow v5 parser stopped early");
        }
    }

    fn next(&mut self) -> Result<Decoded, DecodeError> {
        Ok(self.pending.pop_front().unwrap_or(Decoded::EndOfStream))
    }
}

fn build_record(
    set: &netflow_parser::static_versions::v5::FlowSet,
    wall_ms: i64,
    device_uptime_ms: u32,
    quirks: ProbeQuirks,
) -> Result<Record, DecodeError> {
    let start_uptime_ms = set.first.as_millis() as u32;
    let end_uptime_ms = set.last.as_millis() as u32;
    let start_time_ms = boot_relative_to_epoch_ms(wall_ms, device_uptime_ms, start_uptime_ms);
    let duration_ms = end_uptime_ms.saturating_sub(start_uptime_ms);

    let packets = if quirks.zero_packets {
        u64::from(set.d_pkts).max(1)
    } else {
        u64::from(set.d_pkts)
    };
    let bytes = u64::from(set.d_octets).max(packets);

    Record::new(
        start_time_ms,
        duration_ms,
        FlowAddr::from(set.src_addr),
        FlowAddr::from(set.dst_addr),
        FlowAddr::from(set.next_hop),
        set.src_port,
        set.dst_port,
        set.protocol_number,
        TcpFlags {
            all: set.tcp_flags,
            initial: set.tcp_flags,
            session: 0,
        },
        u32::from(set.input),
        u32::from(set.output),
        packets,
        bytes,
        0,
        0,
        0,
        0,
        0,
    )
    .map_err(|source| DecodeError::InvalidRecord { source })
}
