//! # VSI sparse-image codec
//!
//! Decodes the "VSI1" container: a fixed 128-byte header followed by a
//! zlib-compressed payload. The decompressed payload is a length-delimited
//! sequence of blocks, one delimiter byte each: `0x00` for a sparse block
//! (`block_size` zeros, no payload bytes) and `0x01` for a data block (the
//! next `block_size` payload bytes verbatim, possibly split across inflate
//! output chunks).
//!
//! Output is accumulated in a page-aligned buffer for direct-I/O
//! compatibility and flushed to the device writer as it fills. Two
//! integrity invariants are checked only after the whole input is
//! consumed: the MD5 over the compressed payload must match the header,
//! and the emitted byte total must equal the header's uncompressed size.

use std::time::Instant;

use flate2::{Decompress, FlushDecompress, Status};
use tracing::{debug, warn};

use crate::aligned::{page_align, AlignedBuf};
use crate::cancel::CancelFlag;
use crate::error::FlashError;
use crate::source::{read_exact, ByteSource};
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::writer::DeviceWriter;

pub const VSI_MAGIC: &[u8; 4] = b"VSI1";
pub const VSI_HEADER_SIZE: usize = 128;

/// Upper bound on the per-block unit size a header may declare.
pub const VSI_MAX_BLOCK_SIZE: u32 = 64 * 1024 * 1024;

const DELIM_SPARSE: u8 = 0x00;
const DELIM_DATA: u8 = 0x01;

/// The fixed 128-byte VSI header, parsed once per session.
///
/// Layout (little-endian): magic `"VSI1"` at 0, `i32` block size at 4,
/// `i64` uncompressed size at 8, 16-byte MD5 of the *compressed* payload at
/// 16, 64-byte NUL-padded label at 32, 28-byte NUL-padded version at 96,
/// `i32` timestamp at 124.
#[derive(Debug, Clone, Copy)]
pub struct VsiHeader {
    pub block_size: u32,
    pub uncompressed_size: u64,
    pub md5: [u8; 16],
    label: [u8; 64],
    version: [u8; 28],
    pub timestamp: u32,
}

impl VsiHeader {
    pub fn parse(raw: &[u8; VSI_HEADER_SIZE]) -> Result<Self, FlashError> {
        if &raw[0..4] != VSI_MAGIC {
            return Err(FlashError::HeaderValidation("bad magic bytes".to_string()));
        }

        let block_size = i32::from_le_bytes(raw[4..8].try_into().unwrap());
        if block_size <= 0 || block_size as u32 > VSI_MAX_BLOCK_SIZE {
            return Err(FlashError::HeaderValidation(format!(
                "block size {} out of range",
                block_size
            )));
        }

        let uncompressed_size = i64::from_le_bytes(raw[8..16].try_into().unwrap());
        if uncompressed_size <= 0 {
            return Err(FlashError::HeaderValidation(format!(
                "uncompressed size {} out of range",
                uncompressed_size
            )));
        }

        let mut md5 = [0u8; 16];
        md5.copy_from_slice(&raw[16..32]);
        let mut label = [0u8; 64];
        label.copy_from_slice(&raw[32..96]);
        let mut version = [0u8; 28];
        version.copy_from_slice(&raw[96..124]);
        let timestamp = u32::from_le_bytes(raw[124..128].try_into().unwrap());

        Ok(VsiHeader {
            block_size: block_size as u32,
            uncompressed_size: uncompressed_size as u64,
            md5,
            label,
            version,
            timestamp,
        })
    }

    /// Read exactly [`VSI_HEADER_SIZE`] bytes from `source` and parse them.
    pub fn read_from(source: &mut dyn ByteSource) -> Result<Self, FlashError> {
        let mut raw = [0u8; VSI_HEADER_SIZE];
        read_exact(source, &mut raw, "VSI header")?;
        Self::parse(&raw)
    }

    /// Human-readable label, trimmed at the first NUL.
    pub fn label(&self) -> String {
        trimmed_string(&self.label)
    }

    /// Version string, trimmed at the first NUL.
    pub fn version(&self) -> String {
        trimmed_string(&self.version)
    }
}

fn trimmed_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Tunables for the VSI decode loop.
#[derive(Debug, Clone)]
pub struct VsiOptions {
    /// Size of each compressed read from the input source.
    pub input_buffer_size: usize,
    /// Capacity of the page-aligned output accumulation buffer. Grown to at
    /// least one block if the header declares a larger block size.
    pub write_buffer_capacity: usize,
}

impl Default for VsiOptions {
    fn default() -> Self {
        VsiOptions {
            input_buffer_size: 1024 * 1024,
            write_buffer_capacity: 8 * 1024 * 1024,
        }
    }
}

/// Result of a successful VSI decode.
#[derive(Debug)]
pub struct VsiSummary {
    pub header: VsiHeader,
    pub bytes_written: u64,
    pub compressed_bytes: u64,
    pub decompression_ms: u64,
}

/// Reconstructs the sparse/data block stream out of inflate output chunks,
/// independent of where chunk boundaries fall.
struct SparseReassembler {
    block_size: usize,
    expecting_delimiter: bool,
    bytes_in_current_block: usize,
    /// Bytes left over when processing stopped mid-chunk (cancellation);
    /// prepended on the next call.
    pending: Vec<u8>,
    write_buf: AlignedBuf,
    write_buf_used: usize,
    /// Pre-zeroed, page-aligned; sparse blocks copy from here instead of
    /// zeroing memory per block.
    zero_block: AlignedBuf,
    total_emitted: u64,
}

impl SparseReassembler {
    fn new(block_size: usize, write_capacity: usize) -> Self {
        SparseReassembler {
            block_size,
            expecting_delimiter: true,
            bytes_in_current_block: 0,
            pending: Vec::new(),
            write_buf: AlignedBuf::zeroed(write_capacity),
            write_buf_used: 0,
            zero_block: AlignedBuf::zeroed(block_size),
            total_emitted: 0,
        }
    }

    fn process(
        &mut self,
        data: &[u8],
        writer: &mut dyn DeviceWriter,
        cancel: &CancelFlag,
    ) -> Result<(), FlashError> {
        let owned: Vec<u8>;
        let view: &[u8] = if self.pending.is_empty() {
            data
        } else {
            let mut combined = std::mem::take(&mut self.pending);
            combined.extend_from_slice(data);
            owned = combined;
            &owned
        };

        let mut offset = 0;
        while offset < view.len() {
            if cancel.is_cancelled() {
                break;
            }
            if self.expecting_delimiter {
                let delim = view[offset];
                offset += 1;
                match delim {
                    DELIM_SPARSE => {
                        if self.write_buf_used + self.block_size > self.write_buf.len() {
                            self.flush(writer)?;
                        }
                        let end = self.write_buf_used + self.block_size;
                        self.write_buf.as_mut_slice()[self.write_buf_used..end]
                            .copy_from_slice(&self.zero_block.as_slice()[..self.block_size]);
                        self.write_buf_used = end;
                        self.total_emitted += self.block_size as u64;
                    }
                    DELIM_DATA => {
                        self.expecting_delimiter = false;
                        self.bytes_in_current_block = 0;
                    }
                    other => {
                        warn!(delimiter = other, "invalid VSI delimiter");
                        return Err(FlashError::ContainerFormat(format!(
                            "invalid VSI delimiter byte 0x{:02x}",
                            other
                        )));
                    }
                }
            } else {
                let remaining = self.block_size - self.bytes_in_current_block;
                let available = view.len() - offset;
                let to_append = remaining.min(available);

                if self.write_buf_used + to_append > self.write_buf.len() {
                    self.flush(writer)?;
                }
                let end = self.write_buf_used + to_append;
                self.write_buf.as_mut_slice()[self.write_buf_used..end]
                    .copy_from_slice(&view[offset..offset + to_append]);
                self.write_buf_used = end;

                offset += to_append;
                self.bytes_in_current_block += to_append;
                self.total_emitted += to_append as u64;

                if self.bytes_in_current_block == self.block_size {
                    self.expecting_delimiter = true;
                    self.bytes_in_current_block = 0;
                }
            }
        }

        if offset < view.len() {
            self.pending = view[offset..].to_vec();
        }
        Ok(())
    }

    fn flush(&mut self, writer: &mut dyn DeviceWriter) -> Result<(), FlashError> {
        if self.write_buf_used == 0 {
            return Ok(());
        }
        writer.write(&self.write_buf.as_slice()[..self.write_buf_used])?;
        self.write_buf_used = 0;
        Ok(())
    }
}

/// Streaming VSI decoder: header parse, bounded-output inflate loop, block
/// reconstruction, and post-consumption integrity verification.
pub struct VsiCodec {
    source: Box<dyn ByteSource>,
    writer: Box<dyn DeviceWriter>,
    cancel: CancelFlag,
    telemetry: TelemetrySink,
    opts: VsiOptions,
}

impl VsiCodec {
    pub fn new(
        source: Box<dyn ByteSource>,
        writer: Box<dyn DeviceWriter>,
        cancel: CancelFlag,
        telemetry: TelemetrySink,
    ) -> Self {
        VsiCodec { source, writer, cancel, telemetry, opts: VsiOptions::default() }
    }

    pub fn with_options(mut self, opts: VsiOptions) -> Self {
        self.opts = opts;
        self
    }

    /// Run the decode to completion. Exactly one terminal outcome: the
    /// summary, an error, or `Cancelled`.
    pub fn run(mut self) -> Result<VsiSummary, FlashError> {
        self.telemetry
            .send(TelemetryEvent::PreparationStatus("Opening VSI image file...".to_string()));

        let header = VsiHeader::read_from(self.source.as_mut())?;
        debug!(
            block_size = header.block_size,
            uncompressed_size = header.uncompressed_size,
            label = %header.label(),
            version = %header.version(),
            "parsed VSI header"
        );

        let block_size = header.block_size as usize;
        let write_capacity = self.opts.write_buffer_capacity.max(page_align(block_size));
        let mut reassembler = SparseReassembler::new(block_size, write_capacity);

        let mut inflater = Decompress::new(true);
        let mut payload_md5 = md5::Context::new();
        let mut input = vec![0u8; self.opts.input_buffer_size];
        // Sized for several blocks per drain pass.
        let mut decomp_buf = vec![0u8; (block_size * 4).max(64 * 1024)];

        self.telemetry
            .send(TelemetryEvent::PreparationStatus("Extracting VSI image...".to_string()));

        let mut compressed_read: u64 = 0;
        let mut decompression_ms: u64 = 0;
        let mut input_eof = false;
        let mut stream_end = false;

        while !self.cancel.is_cancelled() && !stream_end {
            let n = self
                .source
                .read(&mut input)
                .map_err(|e| if self.cancel.is_cancelled() { FlashError::Cancelled } else { e })?;
            if n == 0 {
                input_eof = true;
            }
            compressed_read += n as u64;
            payload_md5.consume(&input[..n]);

            // Drain every decompressed byte this chunk can produce before
            // reading more input.
            let mut consumed_total = 0usize;
            loop {
                if self.cancel.is_cancelled() {
                    break;
                }
                let before_in = inflater.total_in();
                let before_out = inflater.total_out();
                let flush = if input_eof { FlushDecompress::Finish } else { FlushDecompress::None };

                let started = Instant::now();
                let status = inflater
                    .decompress(&input[consumed_total..n], &mut decomp_buf, flush)
                    .map_err(|e| {
                        FlashError::ContainerFormat(format!("decompression error: {}", e))
                    })?;
                decompression_ms += started.elapsed().as_millis() as u64;

                consumed_total += (inflater.total_in() - before_in) as usize;
                let produced = (inflater.total_out() - before_out) as usize;
                if produced > 0 {
                    reassembler.process(
                        &decomp_buf[..produced],
                        self.writer.as_mut(),
                        &self.cancel,
                    )?;
                }

                match status {
                    Status::StreamEnd => {
                        stream_end = true;
                        break;
                    }
                    // No further progress possible with what we have.
                    Status::BufError => break,
                    Status::Ok => {
                        let output_full = produced == decomp_buf.len();
                        if consumed_total >= n && !output_full {
                            break;
                        }
                    }
                }
            }

            self.telemetry.send(TelemetryEvent::Progress {
                bytes_processed: VSI_HEADER_SIZE as u64 + compressed_read,
            });

            if input_eof {
                break;
            }
        }

        if self.cancel.is_cancelled() {
            return Err(FlashError::Cancelled);
        }

        reassembler.flush(self.writer.as_mut())?;

        // Both checks run only now, with the full input consumed; the
        // accumulated counters are the only authoritative evidence.
        let computed = payload_md5.compute();
        if computed.0 != header.md5 {
            warn!(
                expected = %hex(&header.md5),
                computed = %hex(&computed.0),
                "VSI payload checksum mismatch"
            );
            return Err(FlashError::Integrity(
                "VSI file checksum verification failed".to_string(),
            ));
        }

        let bytes_written = reassembler.total_emitted;
        if bytes_written != header.uncompressed_size {
            return Err(FlashError::Integrity(format!(
                "VSI extraction size mismatch: expected {} bytes, wrote {}",
                header.uncompressed_size, bytes_written
            )));
        }

        self.writer.finish()?;
        self.telemetry.send(TelemetryEvent::DecompressionTime {
            ms: decompression_ms,
            bytes: bytes_written,
        });
        debug!(bytes_written, "VSI extraction completed");

        Ok(VsiSummary {
            header,
            bytes_written,
            compressed_bytes: compressed_read,
            decompression_ms,
        })
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
