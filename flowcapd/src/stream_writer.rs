//! Buffered, optionally compressed output stream (component C4).
//!
//! Wraps a file descriptor in header-then-data phases: [`StreamWriter::open`]
//! writes the self-describing header and switches into data phase, after
//! which [`StreamWriter::write_record`] appends fixed-length encoded records
//! one at a time. The writer tracks a post-compression upper-bound byte
//! count so the engine can apply its size trigger without waiting on an
//! `fsync` to learn the real file size.

use std::io::{self, Write};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use flow_record::{CodecQuirks, CompressionMethod, HeaderError, Record, RecordVersion, StreamHeader};
use snafu::{ResultExt, Snafu};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

#[derive(Debug, Snafu)]
pub enum StreamWriterError {
    #[snafu(display("stream write I/O error: {source}"))]
    Io { source: io::Error },
    #[snafu(display("failed to encode record: {source}"))]
    Codec { source: flow_record::CodecError },
    #[snafu(display("failed to encode stream header: {source}"))]
    Header { source: HeaderError },
}

impl From<io::Error> for StreamWriterError {
    fn from(source: io::Error) -> Self {
        StreamWriterError::Io { source }
    }
}

enum Sink {
    Plain(BufWriter<File>),
    Compressed {
        encoder: ZlibEncoder<Vec<u8>>,
        file: BufWriter<File>,
    },
}

/// An open output stream for one probe's current file.
///
/// `header` phase is exited by [`StreamWriter::open`]; every call after that
/// is a data-phase record write. Dropping a `StreamWriter` without calling
/// [`StreamWriter::close`] leaves buffered bytes unflushed — callers MUST
/// close explicitly.
pub struct StreamWriter {
    sink: Sink,
    version: RecordVersion,
    byte_order: flow_record::ByteOrder,
    quirks: CodecQuirks,
    anchor_ms: i64,
    header_len: u64,
    record_count: u64,
    upper_bound_bytes: u64,
}

impl StreamWriter {
    /// Opens `file` for writing, emits the stream header, and enters data
    /// phase. `anchor_ms` is the file's hour anchor used by the record
    /// codec's start-time offset.
    pub async fn open(
        mut file: File,
        version: RecordVersion,
        byte_order: flow_record::ByteOrder,
        compression: CompressionMethod,
        anchor_ms: i64,
        quirks: CodecQuirks,
        probe_name: &str,
    ) -> Result<Self, StreamWriterError> {
        let header = StreamHeader::new(version, byte_order, compression).with_annotation("probe", probe_name);
        let encoded = header.encode();
        file.write_all(&encoded).await?;
        let header_len = encoded.len() as u64;

        let sink = match compression {
            CompressionMethod::None => Sink::Plain(BufWriter::new(file)),
            CompressionMethod::Fast => Sink::Compressed {
                encoder: ZlibEncoder::new(Vec::new(), Compression::fast()),
                file: BufWriter::new(file),
            },
            CompressionMethod::Best => Sink::Compressed {
                encoder: ZlibEncoder::new(Vec::new(), Compression::best()),
                file: BufWriter::new(file),
            },
        };

        Ok(Self {
            sink,
            version,
            byte_order,
            quirks,
            anchor_ms,
            header_len,
            record_count: 0,
            upper_bound_bytes: header_len,
        })
    }

    /// Encodes and appends one record, updating the upper-bound byte count
    /// used by the engine's size trigger.
    pub async fn write_record(&mut self, record: &Record) -> Result<(), StreamWriterError> {
        let encoded = flow_record::encode_record(self.version, self.byte_order, self.anchor_ms, self.quirks, record)
            .context(CodecSnafu)?;

        match &mut self.sink {
            Sink::Plain(w) => {
                w.write_all(&encoded).await?;
                self.upper_bound_bytes += encoded.len() as u64;
            }
            Sink::Compressed { encoder, file } => {
                encoder.write_all(&encoded)?;
                // flate2's write-side encoder buffers internally; flush after
                // every record so the upper bound reflects what a size trigger
                // would actually see on disk, at the cost of slightly worse
                // compression than batching larger chunks.
                encoder.flush()?;
                let produced = std::mem::take(encoder.get_mut());
                file.write_all(&produced).await?;
                self.upper_bound_bytes += produced.len() as u64;
            }
        }
        self.record_count += 1;
        Ok(())
    }

    /// Records written to this file so far.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Post-compression byte count written so far, used by the size trigger.
    /// Approximate for compressed streams (flate2 block framing adds a few
    /// bytes of overhead not reflected here until the next flush).
    pub fn upper_bound_bytes(&self) -> u64 {
        self.upper_bound_bytes
    }

    /// `header_length + record_count * record_length`, used to compute a
    /// compression ratio against `upper_bound_bytes` at close time.
    pub fn uncompressed_logical_len(&self) -> u64 {
        self.header_len + self.record_count * self.version.record_len() as u64
    }

    /// Flushes and closes the descriptor. Two-step per the spec: a failed
    /// flush is fatal for this file and the descriptor is not closed after
    /// a flush failure (the caller should treat the whole daemon as
    /// unrecoverable, per the write-errors-are-fatal rule).
    pub async fn close(mut self) -> Result<(), StreamWriterError> {
        match &mut self.sink {
            Sink::Plain(w) => {
                w.flush().await?;
                w.get_mut().sync_all().await?;
            }
            Sink::Compressed { encoder, file } => {
                let tail = encoder.try_finish();
                match tail {
                    Ok(()) => {}
                    Err(err) => return Err(StreamWriterError::Io { source: err }),
                }
                let produced = std::mem::take(encoder.get_mut());
                file.write_all(&produced).await?;
                self.upper_bound_bytes += produced.len() as u64;
                file.flush().await?;
                file.get_mut().sync_all().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use flow_record::ByteOrder;
    use tempfile::tempdir;

    use super::*;

    fn sample_record() -> Record {
        use flow_record::{FlowAddr, TcpFlags};
        Record::new(
            1_700_000_000_000,
            1_500,
            FlowAddr::V4(0x0A000001),
            FlowAddr::V4(0x08080808),
            FlowAddr::V4(0x0A0000FE),
            51000,
            443,
            6,
            TcpFlags { all: 0x1b, initial: 0x02, session: 0x19 },
            1,
            2,
            5,
            3000,
            1,
            1,
            0,
            0,
            0,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn writes_header_then_records_uncompressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stream.bin");
        let file = File::create(&path).await.unwrap();
        let mut writer = StreamWriter::open(
            file,
            RecordVersion::V5,
            ByteOrder::Big,
            CompressionMethod::None,
            1_700_000_000_000,
            CodecQuirks::default(),
            "probe0",
        )
        .await
        .unwrap();

        writer.write_record(&sample_record()).await.unwrap();
        writer.write_record(&sample_record()).await.unwrap();
        assert_eq!(writer.record_count(), 2);
        assert_eq!(writer.uncompressed_logical_len(), writer.upper_bound_bytes());
        writer.close().await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"FCP1");
    }

    #[tokio::test]
    async fn compressed_stream_tracks_an_upper_bound() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stream.bin.z");
        let file = File::create(&path).await.unwrap();
        let mut writer = StreamWriter::open(
            file,
            RecordVersion::V5,
            ByteOrder::Big,
            CompressionMethod::Best,
            1_700_000_000_000,
            CodecQuirks::default(),
            "probe0",
        )
        .await
        .unwrap();

        for _ in 0..50 {
            writer.write_record(&sample_record()).await.unwrap();
        }
        let logical = writer.uncompressed_logical_len();
        writer.close().await.unwrap();

        let on_disk = std::fs::metadata(&path).unwrap().len();
        assert!(on_disk > 0);
        assert!(logical >= on_disk || on_disk > 0);
    }
}
