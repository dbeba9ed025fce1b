//! Pull-style byte sources feeding the decode pipelines.
//!
//! A [`ByteSource`] yields the next chunk of raw input bytes: a local file,
//! the network-backed channel filled by the external transport, or a single
//! entry inside a local archive. Both the archive pipeline and the VSI codec
//! consume the same contract.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::cancel::CancelFlag;
use crate::error::FlashError;
use crate::slot_pool::ACQUIRE_POLL;

/// Pull the next chunk of input bytes.
///
/// `Ok(0)` signals end of stream. Implementations must be cheap to poll and
/// must not block unboundedly; blocking implementations re-check their
/// cancellation flag at poll granularity.
pub trait ByteSource: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FlashError>;

    /// Transport-side wait accounting as `(wait_ms, bytes_read)`, for
    /// sources that block on an external producer. `None` when the source
    /// does not track waits (plain files).
    fn transfer_stats(&self) -> Option<(u64, u64)> {
        None
    }

    /// Release underlying handles. Also invoked by `Drop` where applicable.
    fn close(&mut self) {}
}

/// Local file input.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    path: PathBuf,
    len: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FlashError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|e| FlashError::source_io(e, path.display().to_string()))?;
        let len = file
            .metadata()
            .map_err(|e| FlashError::source_io(e, path.display().to_string()))?
            .len();
        Ok(FileSource { file, path, len })
    }

    /// Total size of the underlying file, for progress reporting.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ByteSource for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FlashError> {
        self.file
            .read(buf)
            .map_err(|e| FlashError::source_io(e, self.path.display().to_string()))
    }
}

/// Network-backed input: a bounded channel of byte chunks filled by the
/// external download transport, drained here through a small pending buffer.
///
/// EOF is signalled by the transport dropping its sender. Waits are bounded
/// to the poll interval and re-check the cancellation flag, and cumulative
/// wait time/bytes are tracked for ring-wait telemetry.
pub struct ChannelSource {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pending_pos: usize,
    cancel: CancelFlag,
    wait_ms: u64,
    bytes_read: u64,
    eof: bool,
}

impl ChannelSource {
    pub fn new(rx: Receiver<Vec<u8>>, cancel: CancelFlag) -> Self {
        ChannelSource {
            rx,
            pending: Vec::new(),
            pending_pos: 0,
            cancel,
            wait_ms: 0,
            bytes_read: 0,
            eof: false,
        }
    }

    /// Convenience constructor returning the producer side for the transport.
    pub fn with_capacity(depth: usize, cancel: CancelFlag) -> (Sender<Vec<u8>>, Self) {
        let (tx, rx) = bounded(depth);
        (tx, ChannelSource::new(rx, cancel))
    }

    /// Cumulative milliseconds spent waiting on the transport.
    pub fn wait_ms(&self) -> u64 {
        self.wait_ms
    }

    /// Total bytes delivered so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn fill_pending(&mut self) -> Result<(), FlashError> {
        let start = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                self.wait_ms += start.elapsed().as_millis() as u64;
                return Err(FlashError::Cancelled);
            }
            match self.rx.recv_timeout(ACQUIRE_POLL) {
                Ok(chunk) => {
                    self.wait_ms += start.elapsed().as_millis() as u64;
                    self.pending = chunk;
                    self.pending_pos = 0;
                    return Ok(());
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    self.wait_ms += start.elapsed().as_millis() as u64;
                    self.eof = true;
                    return Ok(());
                }
            }
        }
    }
}

impl ByteSource for ChannelSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FlashError> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pending_pos == self.pending.len() {
            if self.eof {
                return Ok(0);
            }
            self.fill_pending()?;
        }
        let available = &self.pending[self.pending_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pending_pos += n;
        self.bytes_read += n as u64;
        Ok(n)
    }

    fn transfer_stats(&self) -> Option<(u64, u64)> {
        Some((self.wait_ms, self.bytes_read))
    }
}

/// Reads one entry's decompressed bytes out of a local ZIP archive.
///
/// The entry is located at open time by exact-path or basename match; its
/// bytes are streamed by a background thread into a bounded channel so the
/// consumer sees the same pull contract as every other source.
pub struct ArchiveEntrySource {
    inner: ChannelSource,
    error_rx: Receiver<FlashError>,
    entry_name: String,
    entry_size: u64,
    worker: Option<thread::JoinHandle<()>>,
}

impl ArchiveEntrySource {
    pub fn open(
        archive_path: impl AsRef<Path>,
        entry_name: &str,
        cancel: CancelFlag,
    ) -> Result<Self, FlashError> {
        let archive_path = archive_path.as_ref().to_path_buf();
        let file = File::open(&archive_path)
            .map_err(|e| FlashError::source_io(e, archive_path.display().to_string()))?;
        let mut archive = zip::ZipArchive::new(file)?;

        let mut found: Option<(usize, String, u64)> = None;
        for i in 0..archive.len() {
            let entry = archive.by_index_raw(i)?;
            let name = entry.name().to_string();
            let basename = name.rsplit('/').next().unwrap_or(&name);
            if name == entry_name || basename == entry_name {
                found = Some((i, name, entry.size()));
                break;
            }
        }
        let (index, name, size) = found.ok_or_else(|| {
            FlashError::EntryNotFound(format!(
                "Entry '{}' not found in archive '{}'",
                entry_name,
                archive_path.display()
            ))
        })?;
        debug!(entry = %name, size, "archive entry located");

        let (tx, inner) = ChannelSource::with_capacity(4, cancel.clone());
        let (err_tx, error_rx) = bounded(1);
        let worker = thread::spawn(move || {
            stream_entry(archive, index, tx, err_tx, cancel);
        });

        Ok(ArchiveEntrySource {
            inner,
            error_rx,
            entry_name: name,
            entry_size: size,
            worker: Some(worker),
        })
    }

    /// Declared uncompressed size of the located entry.
    pub fn entry_size(&self) -> u64 {
        self.entry_size
    }

    pub fn entry_name(&self) -> &str {
        &self.entry_name
    }
}

fn stream_entry(
    mut archive: zip::ZipArchive<File>,
    index: usize,
    tx: Sender<Vec<u8>>,
    err_tx: Sender<FlashError>,
    cancel: CancelFlag,
) {
    const CHUNK: usize = 256 * 1024;
    let mut entry = match archive.by_index(index) {
        Ok(e) => e,
        Err(e) => {
            let _ = err_tx.send(e.into());
            return;
        }
    };
    let mut buf = vec![0u8; CHUNK];
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match entry.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    // Consumer went away; nothing left to do.
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "archive entry read failed");
                let _ = err_tx.send(FlashError::source_io(e, "archive entry"));
                return;
            }
        }
    }
}

impl ByteSource for ArchiveEntrySource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FlashError> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            // Sender dropped: either clean EOF or a deferred worker error.
            if let Ok(err) = self.error_rx.try_recv() {
                return Err(err);
            }
        }
        Ok(n)
    }

    fn transfer_stats(&self) -> Option<(u64, u64)> {
        Some((self.inner.wait_ms(), self.inner.bytes_read()))
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for ArchiveEntrySource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Adapter exposing a [`ByteSource`] as [`std::io::Read`] so library
/// decoders (zip, xz2, flate2, zstd) can be layered on top. `FlashError`s
/// are tunnelled through `io::Error` and recovered by
/// [`FlashError::from_read_io`] on the way out.
pub struct SourceReader<'a> {
    source: &'a mut dyn ByteSource,
}

impl<'a> SourceReader<'a> {
    pub fn new(source: &'a mut dyn ByteSource) -> Self {
        SourceReader { source }
    }
}

impl Read for SourceReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.source
            .read(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Read exactly `buf.len()` bytes or fail. Used for the fixed VSI header.
pub(crate) fn read_exact(
    source: &mut dyn ByteSource,
    buf: &mut [u8],
    context: &str,
) -> Result<(), FlashError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(FlashError::source_io(
                io::Error::new(io::ErrorKind::UnexpectedEof, "unexpected end of stream"),
                context.to_string(),
            ));
        }
        filled += n;
    }
    Ok(())
}
