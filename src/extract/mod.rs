//! # Archive extraction pipeline
//!
//! Streams a disk image out of an outer ZIP container into the destination
//! device. The outer container is iterated sequentially (no seeking, so a
//! network-fed source works), the target entry is located by name-matching
//! policy, and its bytes flow through the slot pool to the device writer.
//! If the entry is itself compressed (`.xz`/`.gz`/`.zst`), a second decoder
//! is layered on top, fed through a [`bridge::BridgeReader`].

mod bridge;

pub use bridge::{BridgeReader, BridgeStats, BRIDGE_BUFFER_SIZE};

use std::io::{self, Read};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::cancel::CancelFlag;
use crate::error::FlashError;
use crate::slot_pool::{SlotPool, StarvationStats, ACQUIRE_POLL};
use crate::source::{ByteSource, SourceReader};
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::writer::DeviceWriter;

/// Raw block-device writes are issued in whole sectors; the last chunk of a
/// stream is zero-padded up to this boundary.
pub const SECTOR_SIZE: usize = 512;

/// Entry-name suffixes that mark the entry as independently compressed and
/// therefore needing the two-stage decode path.
const COMPRESSED_SUFFIXES: [&str; 5] = [".xz", ".gz", ".zst", ".bz2", ".lz4"];

/// Configuration for one extraction session.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Entry to extract. `None` selects the first `.wic`-like image entry.
    pub target_entry: Option<String>,
    /// Number of slots in the write pool.
    pub slot_count: usize,
    /// Capacity of each slot; must be a multiple of [`SECTOR_SIZE`].
    pub slot_capacity: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions { target_entry: None, slot_count: 8, slot_capacity: 1024 * 1024 }
    }
}

/// Result of a successful extraction.
#[derive(Debug)]
pub struct PipelineSummary {
    pub entry_name: String,
    /// Uncompressed size the container declared for the entry.
    pub entry_size: u64,
    /// Bytes handed to the device writer, including sector padding.
    pub bytes_written: u64,
    pub decompression_ms: u64,
    pub ring_wait_ms: u64,
    pub starvation: StarvationStats,
}

/// One extraction session: outer container, optional inner decoder, slot
/// pool, device writer. Owned by the worker thread that runs it.
pub struct ArchivePipeline {
    source: Box<dyn ByteSource>,
    writer: Box<dyn DeviceWriter>,
    pool: Arc<SlotPool>,
    cancel: CancelFlag,
    telemetry: TelemetrySink,
    target_entry: Option<String>,
}

impl ArchivePipeline {
    pub fn new(
        source: Box<dyn ByteSource>,
        writer: Box<dyn DeviceWriter>,
        opts: ExtractOptions,
        cancel: CancelFlag,
        telemetry: TelemetrySink,
    ) -> Self {
        assert!(
            opts.slot_capacity % SECTOR_SIZE == 0,
            "slot capacity must be sector-aligned"
        );
        let pool = Arc::new(SlotPool::new(opts.slot_count, opts.slot_capacity, cancel.clone()));
        ArchivePipeline {
            source,
            writer,
            pool,
            cancel,
            telemetry,
            target_entry: opts.target_entry,
        }
    }

    /// The pool backing this session, exposed for diagnostics.
    pub fn slot_pool(&self) -> Arc<SlotPool> {
        Arc::clone(&self.pool)
    }

    /// Run the extraction to completion. Exactly one terminal outcome: the
    /// summary, an error, or `Cancelled`.
    pub fn run(mut self) -> Result<PipelineSummary, FlashError> {
        let setup = Instant::now();
        let mut source = self.source;
        let mut reader = SourceReader::new(source.as_mut());

        let mut matched: Option<(String, u64)> = None;
        let mut decompression_ms = 0u64;
        let mut ring_wait_ms = 0u64;
        let mut ring_bytes = 0u64;
        let mut bytes_out = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return Err(FlashError::Cancelled);
            }
            let Some(mut entry) = zip::read::read_zipfile_from_stream(&mut reader)? else {
                break;
            };
            let name = entry.name().to_string();
            let size = entry.size();
            debug!(entry = %name, size, "archive entry");

            if !entry_matches(&name, self.target_entry.as_deref()) {
                // Dropping the handle skips the entry's remaining data.
                continue;
            }

            info!(entry = %name, size, "found target entry");
            self.telemetry
                .send(TelemetryEvent::EntryDiscovered { name: name.clone(), size });
            self.telemetry.send(TelemetryEvent::ExtractionStarted {
                setup_ms: setup.elapsed().as_millis() as u64,
            });

            if is_compressed_entry(&name) {
                debug!(entry = %name, "entry is compressed, using two-stage decompression");
                let mut bridge = BridgeReader::new(&mut entry);
                let stats = bridge.stats();
                let mut inner = open_inner_decoder(&name, bridge)?;
                let exhausted = stats.clone();
                stream_to_device(
                    inner.as_mut(),
                    &self.pool,
                    self.writer.as_mut(),
                    &self.cancel,
                    &self.telemetry,
                    &move || exhausted.is_exhausted(),
                    &mut decompression_ms,
                    &mut bytes_out,
                )?;
                ring_wait_ms = stats.wait_ms();
                ring_bytes = stats.bytes();
            } else {
                debug!(entry = %name, "entry is uncompressed, direct extraction");
                stream_to_device(
                    &mut entry,
                    &self.pool,
                    self.writer.as_mut(),
                    &self.cancel,
                    &self.telemetry,
                    &|| false,
                    &mut decompression_ms,
                    &mut bytes_out,
                )?;
            }

            matched = Some((name, size));
            break;
        }

        let Some((entry_name, entry_size)) = matched else {
            if self.cancel.is_cancelled() {
                return Err(FlashError::Cancelled);
            }
            let msg = match &self.target_entry {
                Some(target) => format!("Entry '{}' not found in archive", target),
                None => "No WIC image found in archive".to_string(),
            };
            return Err(FlashError::EntryNotFound(msg));
        };

        self.writer.finish()?;

        // Input-side accounting is authoritative when the transport tracks
        // its own waits; the bridge figures cover the remaining sources.
        if let Some((ms, bytes)) = source.transfer_stats() {
            ring_wait_ms = ms;
            ring_bytes = bytes;
        }

        let starvation = self.pool.starvation_stats();
        self.telemetry.send(TelemetryEvent::DecompressionTime {
            ms: decompression_ms,
            bytes: bytes_out,
        });
        self.telemetry.send(TelemetryEvent::RingWaitTime { ms: ring_wait_ms, bytes: ring_bytes });
        self.telemetry.send(TelemetryEvent::SlotPoolStats(starvation));
        debug!(
            decompress_ms = decompression_ms,
            ring_wait_ms,
            bytes_written = bytes_out,
            "pipeline timing"
        );

        Ok(PipelineSummary {
            entry_name,
            entry_size,
            bytes_written: bytes_out,
            decompression_ms,
            ring_wait_ms,
            starvation,
        })
    }
}

/// First match wins, in container iteration order: exact path, then
/// `.../<target>`, then bare basename. With no target, the first entry that
/// looks like a WIC image.
fn entry_matches(name: &str, target: Option<&str>) -> bool {
    match target {
        Some(target) => {
            name == target
                || name.ends_with(&format!("/{}", target))
                || name.rsplit('/').next() == Some(target)
        }
        None => {
            let lower = name.to_ascii_lowercase();
            lower.ends_with(".wic") || lower.contains(".wic.")
        }
    }
}

fn is_compressed_entry(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    COMPRESSED_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

fn open_inner_decoder<'a, R: Read + 'a>(
    name: &str,
    bridge: BridgeReader<'a, R>,
) -> Result<Box<dyn Read + 'a>, FlashError> {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".xz") {
        Ok(Box::new(xz2::read::XzDecoder::new(bridge)))
    } else if lower.ends_with(".gz") {
        Ok(Box::new(flate2::read::GzDecoder::new(bridge)))
    } else if lower.ends_with(".zst") {
        let decoder = zstd::stream::read::Decoder::new(bridge)
            .map_err(|e| FlashError::ContainerFormat(format!("failed to open inner decoder: {}", e)))?;
        Ok(Box::new(decoder))
    } else {
        Err(FlashError::ContainerFormat(format!(
            "unsupported inner compression for entry '{}'",
            name
        )))
    }
}

/// Zero-pad `buf[..len]` up to the next sector boundary; returns the padded
/// length.
fn pad_to_sector(buf: &mut [u8], len: usize) -> usize {
    let remainder = len % SECTOR_SIZE;
    if remainder == 0 {
        return len;
    }
    let padded = len + (SECTOR_SIZE - remainder);
    buf[len..padded].fill(0);
    padded
}

/// Fill `buf` from the decoder, looping over short reads so only the final
/// chunk of a stream can be undersized. A decode stall reported after the
/// underlying source is exhausted is the known quirk of chained filter
/// decoders and is mapped to a clean end of stream.
fn fill_chunk(
    decoder: &mut dyn Read,
    buf: &mut [u8],
    source_exhausted: &dyn Fn() -> bool,
) -> Result<usize, FlashError> {
    let mut filled = 0;
    while filled < buf.len() {
        match decoder.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) => {
                if source_exhausted() && is_no_progress_stall(&e) {
                    debug!("decoder stalled on exhausted input, treating as end of stream");
                    break;
                }
                return Err(classify_decode_error(e));
            }
        }
    }
    Ok(filled)
}

/// The decompression library's "no further progress possible" condition.
/// xz2 and flate2 surface it as an opaque `io::Error`, so the match is on
/// the stall wording; it is only consulted once the input side has already
/// reported EOF.
fn is_no_progress_stall(err: &io::Error) -> bool {
    if err.get_ref().map_or(false, |inner| inner.is::<FlashError>()) {
        return false;
    }
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("no progress") || msg.contains("buf error")
}

fn classify_decode_error(err: io::Error) -> FlashError {
    if err.get_ref().map_or(false, |inner| inner.is::<FlashError>()) {
        FlashError::from_read_io(err, "image stream")
    } else {
        FlashError::ContainerFormat(format!("error decoding image stream: {}", err))
    }
}

/// Shared chunk loop for both entry paths: acquire slot, fill from the
/// decoder, sector-pad, hand to the device writer with a release callback
/// bound to that slot.
#[allow(clippy::too_many_arguments)]
fn stream_to_device(
    decoder: &mut dyn Read,
    pool: &Arc<SlotPool>,
    writer: &mut dyn DeviceWriter,
    cancel: &CancelFlag,
    telemetry: &TelemetrySink,
    source_exhausted: &dyn Fn() -> bool,
    decompression_ms: &mut u64,
    bytes_out: &mut u64,
) -> Result<(), FlashError> {
    loop {
        let mut slot = loop {
            if cancel.is_cancelled() || pool.is_cancelled() {
                return Err(FlashError::Cancelled);
            }
            if let Some(slot) = pool.acquire_write_slot(ACQUIRE_POLL) {
                break slot;
            }
        };

        let started = Instant::now();
        let result = fill_chunk(decoder, slot.buf_mut(), source_exhausted);
        *decompression_ms += started.elapsed().as_millis() as u64;

        let size = match result {
            Ok(n) => n,
            Err(e) => {
                pool.release_read_slot(slot);
                if cancel.is_cancelled() {
                    return Err(FlashError::Cancelled);
                }
                return Err(e);
            }
        };
        if size == 0 {
            pool.release_read_slot(slot);
            break;
        }

        let padded = pad_to_sector(slot.buf_mut(), size);
        slot.set_len(padded);
        *bytes_out += padded as u64;
        telemetry.send(TelemetryEvent::Progress { bytes_processed: *bytes_out });

        let release_pool = Arc::clone(pool);
        let release = Box::new(move |slot| release_pool.release_read_slot(slot));
        if let Err(e) = writer.write_slot(slot, padded, release) {
            if cancel.is_cancelled() {
                return Err(FlashError::Cancelled);
            }
            return Err(e);
        }
    }
    Ok(())
}
