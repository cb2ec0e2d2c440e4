//! Canonical flow record model and the versioned binary record codec.
//!
//! This crate is pure: no sockets, no files. `flowcapd` wraps it with the
//! stream writer, the probe sources, and the capture engine.

pub mod address;
pub mod codec;
pub mod header;
pub mod record;

pub use address::FlowAddr;
pub use codec::{decode_record, encode_record, ByteOrder, CodecError, CodecQuirks, RecordVersion};
pub use header::{CompressionMethod, HeaderError, StreamHeader};
pub use record::{Record, RecordError, TcpFlags};
