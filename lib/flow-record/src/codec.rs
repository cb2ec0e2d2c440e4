//! Versioned, pure (no I/O) encode/decode of [`Record`] into the on-disk
//! record layout (component C3). The stream writer (in `flowcapd`) is the
//! only caller that touches a file descriptor; everything here is bytes in,
//! bytes out.

use snafu::Snafu;

use crate::address::FlowAddr;
use crate::record::{Record, TcpFlags};

/// On-disk record format version. The engine writes [`RecordVersion::V5`] by
/// default; versions 1 through 4 are legacy layouts that must still be
/// readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecordVersion {
    V1,
    V2,
    V3,
    V4,
    V5,
}

impl RecordVersion {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            4 => Some(Self::V4),
            5 => Some(Self::V5),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
            Self::V3 => 3,
            Self::V4 => 4,
            Self::V5 => 5,
        }
    }

    /// Fixed byte length of one record under this version.
    ///
    /// Every version shares the same 24-byte core: three packed 32-bit
    /// words (start-time offset, byte-per-packet ratio, elapsed/protocol/
    /// tcp-flags), two 16-bit ports, and two 32-bit IPv4 addresses.
    /// Next-hop, interface indexes, sensor/flowtype/application ids,
    /// attributes and memo are in-memory-only fields of [`Record`]; no
    /// on-disk version carries them. Version 5 additionally appends the
    /// two TCP-flag subfields the core word has no room for.
    pub fn record_len(self) -> usize {
        match self {
            Self::V1 | Self::V2 | Self::V3 | Self::V4 => 24,
            Self::V5 => 26,
        }
    }

    fn is_legacy(self) -> bool {
        self < Self::V5
    }
}

/// Byte order under which a file's records were written. Stored once in the
/// stream header; every record in the file shares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "little") {
            Self::Little
        } else {
            Self::Big
        }
    }
}

/// Per-probe codec quirks that change how a record is packed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecQuirks {
    /// Use the explicit-bytes fallback layout instead of the packed
    /// byte-per-packet ratio. Selected per record, not per file: a probe
    /// with this quirk set may still emit ordinary records when the ratio
    /// encodes cleanly.
    pub zero_packets: bool,
}

/// Bits in the packed byte-per-packet-ratio word.
const BPP_INT_BITS: u32 = 14;
const BPP_FRAC_BITS: u32 = 6;
const BPP_INT_MAX: u32 = (1 << BPP_INT_BITS) - 1;
const BPP_FRAC_SCALE: f64 = (1u32 << BPP_FRAC_BITS) as f64;
const PACKETS_FIELD_BITS: u32 = 11;
const PACKETS_FIELD_MAX: u64 = (1 << PACKETS_FIELD_BITS) - 1;
/// Fixed rescale factor applied to packet counts that overflow the 11-bit
/// packed field; matches the "probe-specific quirk" described by the spec,
/// fixed here rather than made per-probe configurable.
const PACKET_OVERFLOW_SCALE: u64 = 1000;

/// Start-time offsets are stored in 24 bits, giving headroom past a full
/// hour anchor (3,600,000 ms) without needing the full 32 bits.
const START_OFFSET_BITS: u32 = 24;
const START_OFFSET_MAX: i64 = (1i64 << START_OFFSET_BITS) - 1;

/// Elapsed time shares word 2 with protocol and the aggregate TCP-flags
/// byte, leaving 16 bits (65,535ms) of headroom; longer flows are expected
/// to have already been split by the exporter's active-flow timeout.
const ELAPSED_MAX: u32 = 0xFFFF;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum CodecError {
    #[snafu(display("buffer too short: need {need} bytes, got {got}"))]
    ShortBuffer { need: usize, got: usize },
    #[snafu(display(
        "start-time offset {offset_ms}ms does not fit the {START_OFFSET_BITS}-bit stored width"
    ))]
    OffsetOverflow { offset_ms: i64 },
    #[snafu(display("record version {version} cannot carry an IPv6 address"))]
    Ipv6NotSupported { version: u8 },
    #[snafu(display("elapsed time {duration_ms}ms does not fit this record version"))]
    DurationOverflow { duration_ms: u32 },
}

/// Encodes `record` into version `version`'s on-disk layout, relative to the
/// file's `anchor_ms` hour anchor, in the given `order`.
pub fn encode_record(
    version: RecordVersion,
    order: ByteOrder,
    anchor_ms: i64,
    quirks: CodecQuirks,
    record: &Record,
) -> Result<Vec<u8>, CodecError> {
    if version.is_legacy() && (record.src_addr().is_v6() || record.dst_addr().is_v6()) {
        return Err(CodecError::Ipv6NotSupported {
            version: version.as_u8(),
        });
    }

    let offset_ms = record.start_time_ms() - anchor_ms;
    if !(0..=START_OFFSET_MAX).contains(&offset_ms) {
        return Err(CodecError::OffsetOverflow { offset_ms });
    }

    let elapsed = record.duration_ms();
    if elapsed > ELAPSED_MAX {
        return Err(CodecError::DurationOverflow {
            duration_ms: elapsed,
        });
    }

    let mut buf = Vec::with_capacity(version.record_len());

    // Word 0: start-time offset (24 bits) in the high bits, explicit flags
    // in the low byte: bit0 = zero-packets fallback in use, bit1 = the
    // packed packets field in word 1 has been rescaled for overflow.
    let use_fallback = quirks.zero_packets && bpp_would_overflow(record);
    let overflow = packets_overflow_bit(record);
    let word0: u32 = ((offset_ms as u32) << 8) | (use_fallback as u32) | ((overflow as u32) << 1);
    push_u32(&mut buf, word0, order);

    // Word 1: either the packed byte-per-packet ratio, or (fallback) the
    // raw byte count, selected per record by `use_fallback`.
    let word1 = if use_fallback {
        record.bytes().min(u32::MAX as u64) as u32
    } else {
        pack_bpp(record)
    };
    push_u32(&mut buf, word1, order);

    // Word 2: elapsed (16 bits) | protocol (8 bits) | tcp_flags.all (8
    // bits), high to low. The aggregate flags byte round-trips in every
    // version; the initial/session subfields need more room than this
    // word has and are carried as an extra pair of bytes on V5 only.
    let word2: u32 = (elapsed << 16) | ((record.protocol() as u32) << 8) | (record.tcp_flags().all as u32);
    push_u32(&mut buf, word2, order);

    push_u16(&mut buf, record.src_port(), order);
    push_u16(&mut buf, record.dst_port(), order);

    let src_v4 = as_v4(record.src_addr(), version)?;
    let dst_v4 = as_v4(record.dst_addr(), version)?;
    push_u32(&mut buf, src_v4, order);
    push_u32(&mut buf, dst_v4, order);

    if version == RecordVersion::V5 {
        buf.push(record.tcp_flags().initial);
        buf.push(record.tcp_flags().session);
    }

    debug_assert_eq!(buf.len(), version.record_len());
    Ok(buf)
}

/// Decodes one record of the given `version` from `bytes`, relative to the
/// file's `anchor_ms`. `bytes` must be exactly `version.record_len()` long.
pub fn decode_record(
    version: RecordVersion,
    order: ByteOrder,
    anchor_ms: i64,
    bytes: &[u8],
) -> Result<Record, CodecError> {
    let need = version.record_len();
    if bytes.len() != need {
        return Err(CodecError::ShortBuffer {
            need,
            got: bytes.len(),
        });
    }

    let mut cur = Cursor::new(bytes, order);
    let word0 = cur.take_u32();
    let offset_ms = (word0 >> 8) as i64;
    let use_fallback = (word0 & 1) != 0;
    let packets_overflowed = (word0 & 0b10) != 0;

    let word1 = cur.take_u32();

    let word2 = cur.take_u32();
    let elapsed = word2 >> 16;
    let protocol = ((word2 >> 8) & 0xFF) as u8;
    let tcp_all = (word2 & 0xFF) as u8;

    let src_port = cur.take_u16();
    let dst_port = cur.take_u16();
    let src_v4 = cur.take_u32();
    let dst_v4 = cur.take_u32();

    let (packets, bytes_total) = if use_fallback {
        (1u64, word1 as u64)
    } else {
        unpack_bpp(word1, packets_overflowed)
    };

    let (tcp_initial, tcp_session) = if version == RecordVersion::V5 {
        (cur.take_u8(), cur.take_u8())
    } else {
        (0, 0)
    };

    let packets = packets.max(1);
    let bytes_total = bytes_total.max(packets);

    // Next-hop, interface indexes, sensor/flowtype/application ids,
    // attributes and memo are not part of any on-disk version; they default
    // to zero here and are filled in (where applicable) by later stages of
    // the pipeline operating on the in-memory `Record`.
    Record::new(
        anchor_ms + offset_ms,
        elapsed,
        FlowAddr::V4(src_v4),
        FlowAddr::V4(dst_v4),
        FlowAddr::V4(0),
        src_port,
        dst_port,
        protocol,
        TcpFlags {
            all: tcp_all,
            initial: tcp_initial,
            session: tcp_session,
        },
        0,
        0,
        packets,
        bytes_total,
        0,
        0,
        0,
        0,
        0,
    )
    .map_err(|_| CodecError::ShortBuffer { need, got: bytes.len() })
}

fn bpp_would_overflow(record: &Record) -> bool {
    let ratio = record.bytes_per_packet();
    ratio >= (1u32 << BPP_INT_BITS) as f64 || record.packets() > PACKETS_FIELD_MAX * PACKET_OVERFLOW_SCALE
}

fn packets_overflow_bit(record: &Record) -> bool {
    record.packets() > PACKETS_FIELD_MAX
}

fn pack_bpp(record: &Record) -> u32 {
    let overflow = packets_overflow_bit(record);
    let packets_field = if overflow {
        (record.packets() / PACKET_OVERFLOW_SCALE).min(PACKETS_FIELD_MAX)
    } else {
        record.packets()
    };

    let effective_packets = if overflow {
        packets_field * PACKET_OVERFLOW_SCALE
    } else {
        packets_field
    };
    let ratio = record.bytes() as f64 / effective_packets.max(1) as f64;
    let int_part = (ratio.trunc() as u32).min(BPP_INT_MAX);
    let frac_part = ((ratio.fract() * BPP_FRAC_SCALE).round() as u32) & ((1 << BPP_FRAC_BITS) - 1);

    (int_part << (BPP_FRAC_BITS + PACKETS_FIELD_BITS))
        | (frac_part << PACKETS_FIELD_BITS)
        | (packets_field as u32)
}

fn unpack_bpp(word: u32, overflowed: bool) -> (u64, u64) {
    let packets_field = (word & ((1 << PACKETS_FIELD_BITS) - 1)) as u64;
    let frac_part = (word >> PACKETS_FIELD_BITS) & ((1 << BPP_FRAC_BITS) - 1);
    let int_part = word >> (BPP_FRAC_BITS + PACKETS_FIELD_BITS);

    let packets = if overflowed {
        packets_field * PACKET_OVERFLOW_SCALE
    } else {
        packets_field
    };
    let ratio = int_part as f64 + (frac_part as f64 / BPP_FRAC_SCALE);
    let bytes = (ratio * packets.max(1) as f64).round() as u64;
    (packets, bytes)
}

fn as_v4(addr: FlowAddr, version: RecordVersion) -> Result<u32, CodecError> {
    addr.to_ipv4().map(u32::from).ok_or(CodecError::Ipv6NotSupported {
        version: version.as_u8(),
    })
}

fn push_u16(buf: &mut Vec<u8>, v: u16, order: ByteOrder) {
    buf.extend_from_slice(&match order {
        ByteOrder::Little => v.to_le_bytes(),
        ByteOrder::Big => v.to_be_bytes(),
    });
}

fn push_u32(buf: &mut Vec<u8>, v: u32, order: ByteOrder) {
    buf.extend_from_slice(&match order {
        ByteOrder::Little => v.to_le_bytes(),
        ByteOrder::Big => v.to_be_bytes(),
    });
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], order: ByteOrder) -> Self {
        Self { bytes, pos: 0, order }
    }

    fn take_u8(&mut self) -> u8 {
        let v = self.bytes[self.pos];
        self.pos += 1;
        v
    }

    fn take_u16(&mut self) -> u16 {
        let s: [u8; 2] = self.bytes[self.pos..self.pos + 2].try_into().unwrap();
        self.pos += 2;
        match self.order {
            ByteOrder::Little => u16::from_le_bytes(s),
            ByteOrder::Big => u16::from_be_bytes(s),
        }
    }

    fn take_u32(&mut self) -> u32 {
        let s: [u8; 4] = self.bytes[self.pos..self.pos + 4].try_into().unwrap();
        self.pos += 4;
        match self.order {
            ByteOrder::Little => u32::from_le_bytes(s),
            ByteOrder::Big => u32::from_be_bytes(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(o: u8) -> FlowAddr {
        FlowAddr::from(Ipv4Addr::new(192, 168, 0, o))
    }

    fn sample(packets: u64, bytes: u64) -> Record {
        Record::new(
            1_700_000_000_000 + 12_345,
            987,
            addr(1),
            addr(2),
            addr(254),
            51234,
            443,
            6,
            TcpFlags { all: 0x1b, initial: 0x02, session: 0x19 },
            3,
            4,
            packets,
            bytes,
            7,
            2,
            99,
            0b0000_0101,
            0xBEEF,
        )
        .unwrap()
    }

    #[test]
    fn v5_round_trip_preserves_core_fields_and_full_tcp_flags() {
        let anchor = 1_700_000_000_000;
        let rec = sample(10, 6000);
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let bytes = encode_record(RecordVersion::V5, order, anchor, CodecQuirks::default(), &rec).unwrap();
            assert_eq!(bytes.len(), RecordVersion::V5.record_len());
            let decoded = decode_record(RecordVersion::V5, order, anchor, &bytes).unwrap();
            assert_eq!(decoded.start_time_ms(), rec.start_time_ms());
            assert_eq!(decoded.duration_ms(), rec.duration_ms());
            assert_eq!(decoded.src_addr(), rec.src_addr());
            assert_eq!(decoded.dst_addr(), rec.dst_addr());
            assert_eq!(decoded.src_port(), rec.src_port());
            assert_eq!(decoded.dst_port(), rec.dst_port());
            assert_eq!(decoded.protocol(), rec.protocol());
            assert_eq!(decoded.tcp_flags(), rec.tcp_flags());
            assert_eq!(decoded.packets(), rec.packets());
            assert_eq!(decoded.bytes(), rec.bytes());
            // Not part of any on-disk version.
            assert_eq!(decoded.next_hop(), FlowAddr::V4(0));
            assert_eq!(decoded.sensor_id(), 0);
            assert_eq!(decoded.flowtype_id(), 0);
        }
    }

    #[test]
    fn v1_round_trip_drops_tcp_subfields_and_metadata() {
        let anchor = 1_700_000_000_000;
        let rec = sample(10, 6000);
        let bytes = encode_record(RecordVersion::V1, ByteOrder::Big, anchor, CodecQuirks::default(), &rec).unwrap();
        assert_eq!(bytes.len(), RecordVersion::V1.record_len());
        let decoded = decode_record(RecordVersion::V1, ByteOrder::Big, anchor, &bytes).unwrap();
        assert_eq!(decoded.src_addr(), rec.src_addr());
        assert_eq!(decoded.packets(), rec.packets());
        // The core word carries the aggregate flags byte on every version...
        assert_eq!(decoded.tcp_flags().all, rec.tcp_flags().all);
        // ...but the legacy layout has no room for the other two subfields,
        // or for any of the in-memory-only metadata fields.
        assert_eq!(decoded.tcp_flags().initial, 0);
        assert_eq!(decoded.tcp_flags().session, 0);
        assert_eq!(decoded.sensor_id(), 0);
        assert_eq!(decoded.next_hop(), FlowAddr::V4(0));
    }

    #[test]
    fn v1_rejects_ipv6_addresses() {
        use std::net::Ipv6Addr;
        let mut rec = sample(1, 1);
        rec = Record::new(
            rec.start_time_ms(),
            rec.duration_ms(),
            FlowAddr::from(Ipv6Addr::LOCALHOST),
            rec.dst_addr(),
            rec.next_hop(),
            rec.src_port(),
            rec.dst_port(),
            rec.protocol(),
            rec.tcp_flags(),
            rec.input_if(),
            rec.output_if(),
            rec.packets(),
            rec.bytes(),
            rec.sensor_id(),
            rec.flowtype_id(),
            rec.application_id(),
            rec.attributes(),
            rec.memo(),
        )
        .unwrap();
        let err = encode_record(RecordVersion::V1, ByteOrder::Big, 0, CodecQuirks::default(), &rec).unwrap_err();
        assert_eq!(err, CodecError::Ipv6NotSupported { version: 1 });
    }

    #[test]
    fn offset_overflow_is_rejected() {
        let rec = sample(1, 1);
        let anchor = rec.start_time_ms() + (START_OFFSET_MAX + 1);
        let err = encode_record(RecordVersion::V5, ByteOrder::Big, anchor, CodecQuirks::default(), &rec).unwrap_err();
        assert!(matches!(err, CodecError::OffsetOverflow { .. }));
    }

    #[test]
    fn byte_order_is_idempotent_across_hosts() {
        let anchor = 1_700_000_000_000;
        let rec = sample(2048 * 5, 2048 * 5 * 20_000);
        let be = encode_record(RecordVersion::V5, ByteOrder::Big, anchor, CodecQuirks::default(), &rec).unwrap();
        let le = encode_record(RecordVersion::V5, ByteOrder::Little, anchor, CodecQuirks::default(), &rec).unwrap();
        assert_ne!(be, le);
        let from_be = decode_record(RecordVersion::V5, ByteOrder::Big, anchor, &be).unwrap();
        let from_le = decode_record(RecordVersion::V5, ByteOrder::Little, anchor, &le).unwrap();
        assert_eq!(from_be, from_le);
    }

    #[test]
    fn packet_overflow_quirk_rescales_packet_count() {
        let anchor = 0;
        let rec = sample(5_000_000, 5_000_000 * 40);
        let bytes = encode_record(RecordVersion::V5, ByteOrder::Big, anchor, CodecQuirks::default(), &rec).unwrap();
        let decoded = decode_record(RecordVersion::V5, ByteOrder::Big, anchor, &bytes).unwrap();
        // Lossy on purpose: the packed field only has PACKET_OVERFLOW_SCALE
        // granularity once the overflow bit is set.
        assert!((decoded.packets() as i64 - rec.packets() as i64).abs() < PACKET_OVERFLOW_SCALE as i64);
    }
}
