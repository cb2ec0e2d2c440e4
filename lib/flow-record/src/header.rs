//! Self-describing stream header written once at the start of every output
//! file, ahead of the fixed-length record body (component C3/C4 boundary).

use std::collections::BTreeMap;
use std::convert::TryInto;

use snafu::Snafu;

use crate::codec::{ByteOrder, RecordVersion};

/// Magic bytes identifying a flow-capture output file.
pub const MAGIC: [u8; 4] = *b"FCP1";

/// Block-wise compression applied by the stream writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    None,
    Fast,
    Best,
}

impl CompressionMethod {
    fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Fast => 1,
            Self::Best => 2,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Fast),
            2 => Some(Self::Best),
            _ => None,
        }
    }
}

impl std::str::FromStr for CompressionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "fast" => Ok(Self::Fast),
            "best" => Ok(Self::Best),
            other => Err(format!("unknown compression method '{other}'")),
        }
    }
}

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum HeaderError {
    #[snafu(display("bad magic bytes: expected {MAGIC:?}"))]
    BadMagic,
    #[snafu(display("unsupported record version {version}"))]
    UnsupportedVersion { version: u8 },
    #[snafu(display("unsupported compression method id {id}"))]
    UnsupportedCompression { id: u8 },
    #[snafu(display("unsupported byte order flag {flag}"))]
    UnsupportedByteOrder { flag: u8 },
    #[snafu(display("truncated header"))]
    Truncated,
}

/// Stream header: magic, record version, byte order, record length,
/// compression method, and free-form key/value annotations (probe name,
/// invocation, notes). Immutable once the stream enters data phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub version: RecordVersion,
    pub byte_order: ByteOrder,
    pub compression: CompressionMethod,
    pub record_len: u16,
    pub annotations: BTreeMap<String, String>,
}

impl StreamHeader {
    pub fn new(version: RecordVersion, byte_order: ByteOrder, compression: CompressionMethod) -> Self {
        Self {
            version,
            byte_order,
            compression,
            record_len: version.record_len() as u16,
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Serialized length in bytes: fixed prefix plus the annotation block.
    pub fn encoded_len(&self) -> usize {
        let mut len = MAGIC.len() + 1 + 1 + 1 + 2 + 2; // magic, version, order, compression, record_len, annot_count
        for (k, v) in &self.annotations {
            len += 2 + k.len() + 2 + v.len();
        }
        len
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&MAGIC);
        buf.push(self.version.as_u8());
        buf.push(match self.byte_order {
            ByteOrder::Little => 0,
            ByteOrder::Big => 1,
        });
        buf.push(self.compression.as_u8());
        buf.extend_from_slice(&self.record_len.to_be_bytes());
        buf.extend_from_slice(&(self.annotations.len() as u16).to_be_bytes());
        for (k, v) in &self.annotations {
            push_str(&mut buf, k);
            push_str(&mut buf, v);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < MAGIC.len() + 7 {
            return Err(HeaderError::Truncated);
        }
        if &buf[0..4] != &MAGIC {
            return Err(HeaderError::BadMagic);
        }
        let version = RecordVersion::from_u8(buf[4]).ok_or(HeaderError::UnsupportedVersion { version: buf[4] })?;
        let byte_order = match buf[5] {
            0 => ByteOrder::Little,
            1 => ByteOrder::Big,
            flag => return Err(HeaderError::UnsupportedByteOrder { flag }),
        };
        let compression = CompressionMethod::from_u8(buf[6])
            .ok_or(HeaderError::UnsupportedCompression { id: buf[6] })?;
        let record_len = u16::from_be_bytes(buf[7..9].try_into().unwrap());
        let annot_count = u16::from_be_bytes(buf[9..11].try_into().unwrap());

        let mut pos = 11;
        let mut annotations = BTreeMap::new();
        for _ in 0..annot_count {
            let (k, next) = read_str(buf, pos)?;
            let (v, next) = read_str(buf, next)?;
            annotations.insert(k, v);
            pos = next;
        }

        Ok(Self {
            version,
            byte_order,
            compression,
            record_len,
            annotations,
        })
    }
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn read_str(buf: &[u8], pos: usize) -> Result<(String, usize), HeaderError> {
    if buf.len() < pos + 2 {
        return Err(HeaderError::Truncated);
    }
    let len = u16::from_be_bytes(buf[pos..pos + 2].try_into().unwrap()) as usize;
    let start = pos + 2;
    if buf.len() < start + len {
        return Err(HeaderError::Truncated);
    }
    let s = String::from_utf8_lossy(&buf[start..start + len]).into_owned();
    Ok((s, start + len))
}
