//! sFlow v5 decoding, built on the `sflow-parser` crate.
//!
//! Unlike NetFlow/IPFIX, sFlow carries whole packet headers inside a flow
//! sample rather than pre-aggregated byte/packet counters, and every sample
//! already represents a single sampled packet. We synthesize a one-packet
//! record per `sampled_ipv4`/`sampled_ipv6` flow record, scaling its byte
//! count by the sample's `sampling_rate` so the record approximates the
//! traffic volume it represents.

use std::time::SystemTime;

use flow_record::{FlowAddr, Record, TcpFlags};
use sflow_parser::models::{FlowData, SampleData};

use super::{system_time_to_epoch_ms, Decoded, DecodeError, WireDecoder};
use crate::config::ProbeQuirks;

pub struct SFlowDecoder {
    ready: std::collections::VecDeque<Record>,
    quirks: ProbeQuirks,
}

impl SFlowDecoder {
    pub fn new(quirks: ProbeQuirks) -> Self {
        Self {
            ready: std::collections::VecDeque::new(),
            quirks,
        }
    }
}

impl WireDecoder for SFlowDecoder {
    fn feed(&mut self, bytes: &[u8], received_at: SystemTime) {
        let wall_ms = system_time_to_epoch_ms(received_at);
        let datagram = match sflow_parser::parse_datagram(bytes) {
            Ok(d) => d,
            Err(err) => {
                tracing::warn!(%err, "dropping malformed sflow datagram");
                return;
            }
        };

        for sample in &datagram.samples {
            let SampleData::FlowSample(flow_sample) = &sample.sample_data else {
                continue;
            };
            for flow_record in &flow_sample.flow_records {
                match build_record(&flow_record.flow_data, flow_sample.sampling_rate, wall_ms, self.quirks) {
                    Ok(Some(record)) => self.ready.push_back(record),
                    Ok(None) => {}
                    Err(err) => tracing::warn!(%err, "dropping malformed sflow flow record"),
                }
            }
        }
    }

    fn next(&mut self) -> Result<Decoded, DecodeError> {
        Ok(match self.ready.pop_front() {
            Some(record) => Decoded::Record(record),
            None => Decoded::EndOfStream,
        })
    }
}

fn build_record(
    flow_data: &FlowData,
    sampling_rate: u32,
    wall_ms: i64,
    quirks: ProbeQuirks,
) -> Result<Option<Record>, DecodeError> {
    let scale = u64::from(sampling_rate.max(1));

    let (src_addr, dst_addr, src_port, dst_port, protocol, tcp_flags, length) = match flow_data {
        FlowData::SampledIpv4(ip) => (
            FlowAddr::from(ip.src_ip),
            FlowAddr::from(ip.dst_ip),
            ip.src_port as u16,
            ip.dst_port as u16,
            ip.protocol as u8,
            ip.tcp_flags as u8,
            ip.length,
        ),
        FlowData::SampledIpv6(ip) => (
            FlowAddr::from(ip.src_ip),
            FlowAddr::from(ip.dst_ip),
            ip.src_port as u16,
            ip.dst_port as u16,
            ip.protocol as u8,
            ip.tcp_flags as u8,
            ip.length,
        ),
        // Raw sampled link-layer headers without a parsed IP layer carry no
        // address/port information we can project into a record.
        _ => return Ok(None),
    };

    let packets = if quirks.zero_packets { scale.max(1) } else { scale };
    let bytes = (u64::from(length) * scale).max(packets);

    Record::new(
        wall_ms,
        0,
        src_addr,
        dst_addr,
        src_addr,
        src_port,
        dst_port,
        protocol,
        TcpFlags {
            all: tcp_flags,
            initial: tcp_flags,
            session: 0,
        },
        0,
        0,
        packets,
        bytes,
        0,
        0,
        0,
        0,
        0,
    )
    .map(Some)
    .map_err(|source| DecodeError::InvalidRecord { source })
}
