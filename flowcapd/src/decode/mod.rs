//! Wire decoders (component C2): turn router-emitted bytes into
//! [`flow_record::Record`] values.
//!
//! Two decoder families exist. NetFlow v5 datagrams are self-contained and
//! decode in one pass ([`netflow_v5`]). IPFIX, NetFlow v9, and sFlow are
//! template- or sample-driven and keep per-source state across messages
//! ([`ipfix`], [`sflow`]). Both expose the same pull interface: `next()`
//! returns one record at a time from whatever has already been fed in,
//! reporting [`Decoded::EndOfStream`] once the input is exhausted rather
//! than blocking for more.

pub mod ipfix;
pub mod netflow_v5;
pub mod sflow;

use std::time::SystemTime;

use flow_record::Record;
use snafu::Snafu;

/// Result of pulling the next record out of a decoder.
#[derive(Debug)]
pub enum Decoded {
    Record(Record),
    /// A per-source sequence counter skipped ahead by `lost` exports since
    /// the last message; counted as loss, distinct from a malformed packet.
    SequenceGap { lost: u64 },
    EndOfStream,
}

#[derive(Debug, Snafu)]
pub enum DecodeError {
    #[snafu(display("short buffer: need at least {need} bytes, got {got}"))]
    ShortBuffer { need: usize, got: usize },
    #[snafu(display("unsupported netflow/ipfix version {version}"))]
    UnsupportedVersion { version: u16 },
    #[snafu(display("flow set claims {count} records but packet only has room for {fit}"))]
    CountMismatch { count: usize, fit: usize },
    #[snafu(display("record rejected by codec: {source}"))]
    InvalidRecord { source: flow_record::RecordError },
    #[snafu(display("no template cached for (domain {domain_id}, template {template_id})"))]
    UnknownTemplate { domain_id: u32, template_id: u16 },
    #[snafu(display("field '{field}' has an unsupported length {length} for its type"))]
    UnsupportedFieldLength { field: &'static str, length: usize },
    #[snafu(display("sflow parse error: {reason}"))]
    SFlow { reason: String },
}

/// A decoder that accepts whole messages (one UDP datagram, or one
/// delimited chunk of a byte stream) and yields zero or more records.
///
/// Implementations buffer internally: `feed` never blocks and never
/// decodes eagerly past what's needed to satisfy the next `next()` call.
pub trait WireDecoder: Send {
    fn feed(&mut self, bytes: &[u8], received_at: SystemTime);

    fn next(&mut self) -> Result<Decoded, DecodeError>;
}

/// Wall-clock epoch millis for a router's uptime-relative timestamp,
/// anchored to the receive time of the packet that carried it.
///
/// `uptime_ms` is milliseconds since the device booted; `wall_ms` is the
/// collector's receive time. Shared by NetFlow v5 (sysUptime) and NetFlow
/// v9/IPFIX (flowStartSysUpTime) boot-relative fields.
pub(crate) fn boot_relative_to_epoch_ms(wall_ms: i64, device_uptime_ms: u32, event_uptime_ms: u32) -> i64 {
    wall_ms - i64::from(device_uptime_ms) + i64::from(event_uptime_ms)
}

pub(crate) fn system_time_to_epoch_ms(t: SystemTime) -> i64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
