//! The canonical in-memory flow record (component C1).

use snafu::Snafu;

use crate::address::FlowAddr;

/// Ports considered "web" traffic for [`Record::is_web`]. Fixed at compile
/// time; making this runtime-configurable is explicitly out of scope.
const WEB_PORTS: [u16; 3] = [80, 443, 8080];

/// IANA protocol number for TCP.
pub const PROTO_TCP: u8 = 6;

/// Cumulative TCP flag views carried by a record.
///
/// `all` is the bitwise-OR of every packet's flags seen in the flow,
/// `initial` is the flags of the first packet, and `session` accumulates
/// flags from every packet after the first (used to detect mid-flow resets
/// or retransmitted SYNs without losing the initial handshake's flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags {
    pub all: u8,
    pub initial: u8,
    pub session: u8,
}

/// Errors that make a decoded record invalid. Decoders construct a
/// [`Record`] through [`Record::new`], which enforces these up front so that
/// no invalid record is ever observable downstream.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum RecordError {
    #[snafu(display("packet count must be >= 1, got {packets}"))]
    ZeroPackets { packets: u64 },
    #[snafu(display("byte count {bytes} is less than packet count {packets}"))]
    BytesLessThanPackets { bytes: u64, packets: u64 },
}

/// A normalized summary of one unidirectional network flow.
///
/// Constructed once by a decoder and never mutated afterward; the capture
/// engine copies it into the write buffer and drops it when the enclosing
/// probe buffer slot is reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    start_time_ms: i64,
    duration_ms: u32,
    src_addr: FlowAddr,
    dst_addr: FlowAddr,
    next_hop: FlowAddr,
    src_port: u16,
    dst_port: u16,
    protocol: u8,
    tcp_flags: TcpFlags,
    input_if: u32,
    output_if: u32,
    packets: u64,
    bytes: u64,
    sensor_id: u32,
    flowtype_id: u16,
    application_id: u32,
    attributes: u8,
    memo: u16,
}

#[allow(clippy::too_many_arguments)]
impl Record {
    /// Builds a record, rejecting the invariant violations that are the
    /// decoder's responsibility to catch rather than the wire parser's.
    pub fn new(
        start_time_ms: i64,
        duration_ms: u32,
        src_addr: FlowAddr,
        dst_addr: FlowAddr,
        next_hop: FlowAddr,
        src_port: u16,
        dst_port: u16,
        protocol: u8,
        tcp_flags: TcpFlags,
        input_if: u32,
        output_if: u32,
        packets: u64,
        bytes: u64,
        sensor_id: u32,
        flowtype_id: u16,
        application_id: u32,
        attributes: u8,
        memo: u16,
    ) -> Result<Self, RecordError> {
        if packets == 0 {
            return Err(RecordError::ZeroPackets { packets });
        }
        if bytes < packets {
            return Err(RecordError::BytesLessThanPackets { bytes, packets });
        }

        Ok(Self {
            start_time_ms,
            duration_ms,
            src_addr,
            dst_addr,
            next_hop,
            src_port,
            dst_port,
            protocol,
            tcp_flags,
            input_if,
            output_if,
            packets,
            bytes,
            sensor_id,
            flowtype_id,
            application_id,
            attributes,
            memo,
        })
    }

    pub fn start_time_ms(&self) -> i64 {
        self.start_time_ms
    }

    pub fn duration_ms(&self) -> u32 {
        self.duration_ms
    }

    pub fn end_time_ms(&self) -> i64 {
        self.start_time_ms + i64::from(self.duration_ms)
    }

    pub fn src_addr(&self) -> FlowAddr {
        self.src_addr
    }

    pub fn dst_addr(&self) -> FlowAddr {
        self.dst_addr
    }

    pub fn next_hop(&self) -> FlowAddr {
        self.next_hop
    }

    /// True when every address on the record shares the same IP version.
    pub fn is_address_version_consistent(&self) -> bool {
        self.src_addr.is_v4() == self.dst_addr.is_v4() && self.src_addr.is_v4() == self.next_hop.is_v4()
    }

    pub fn masked_src_addr(&self, prefix_len: u32) -> FlowAddr {
        self.src_addr.masked(prefix_len)
    }

    pub fn masked_dst_addr(&self, prefix_len: u32) -> FlowAddr {
        self.dst_addr.masked(prefix_len)
    }

    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    pub fn tcp_flags(&self) -> TcpFlags {
        self.tcp_flags
    }

    pub fn input_if(&self) -> u32 {
        self.input_if
    }

    pub fn output_if(&self) -> u32 {
        self.output_if
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn sensor_id(&self) -> u32 {
        self.sensor_id
    }

    pub fn set_sensor_id(&mut self, sensor_id: u32) {
        self.sensor_id = sensor_id;
    }

    pub fn flowtype_id(&self) -> u16 {
        self.flowtype_id
    }

    pub fn set_flowtype_id(&mut self, flowtype_id: u16) {
        self.flowtype_id = flowtype_id;
    }

    pub fn application_id(&self) -> u32 {
        self.application_id
    }

    pub fn attributes(&self) -> u8 {
        self.attributes
    }

    pub fn memo(&self) -> u16 {
        self.memo
    }

    pub fn set_memo(&mut self, memo: u16) {
        self.memo = memo;
    }

    /// `protocol == TCP && (sport in WEB_PORTS || dport in WEB_PORTS)`.
    pub fn is_web(&self) -> bool {
        self.protocol == PROTO_TCP
            && (WEB_PORTS.contains(&self.src_port) || WEB_PORTS.contains(&self.dst_port))
    }

    /// Average bytes per packet as a float, used by the codec's fixed-point
    /// ratio encoding. Never divides by zero: `packets >= 1` is enforced at
    /// construction.
    pub fn bytes_per_packet(&self) -> f64 {
        self.bytes as f64 / self.packets as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(o: u8) -> FlowAddr {
        FlowAddr::from(Ipv4Addr::new(10, 0, 0, o))
    }

    fn sample() -> Record {
        Record::new(
            1_700_000_000_000,
            1500,
            addr(1),
            addr(2),
            addr(254),
            1234,
            80,
            PROTO_TCP,
            TcpFlags { all: 0x1b, initial: 0x02, session: 0x19 },
            1,
            2,
            10,
            6000,
            7,
            3,
            42,
            0,
            0,
        )
        .unwrap()
    }

    #[test]
    fn rejects_zero_packets() {
        let err = Record::new(
            0, 0, addr(1), addr(2), addr(3), 0, 0, 0, TcpFlags::default(), 0, 0, 0, 0, 0, 0, 0, 0, 0,
        )
        .unwrap_err();
        assert_eq!(err, RecordError::ZeroPackets { packets: 0 });
    }

    #[test]
    fn rejects_bytes_below_packets() {
        let err = Record::new(
            0, 0, addr(1), addr(2), addr(3), 0, 0, 0, TcpFlags::default(), 0, 0, 5, 4, 0, 0, 0, 0, 0,
        )
        .unwrap_err();
        assert_eq!(err, RecordError::BytesLessThanPackets { bytes: 4, packets: 5 });
    }

    #[test]
    fn is_web_detects_dest_port_80() {
        assert!(sample().is_web());
    }

    #[test]
    fn is_web_false_for_udp() {
        let mut r = sample();
        r.protocol = 17;
        assert!(!r.is_web());
    }

    #[test]
    fn end_time_adds_duration() {
        let r = sample();
        assert_eq!(r.end_time_ms(), 1_700_000_001_500);
    }
}
