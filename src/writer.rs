//! Destination side of the pipeline: persist filled buffers to the target
//! block device or file.
//!
//! Two implementations: a synchronous writer for plain files, and a threaded
//! writer that queues slots to a single I/O thread over a bounded
//! crossbeam channel. The threaded writer preserves submission order (one
//! worker, FIFO channel) and runs each slot's release callback on the I/O
//! thread once the bytes are accepted, which is the only place
//! `SlotPool::release_read_slot` is ever called from outside the decoder
//! thread.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, warn};

use crate::error::FlashError;
use crate::slot_pool::Slot;

/// Invoked exactly once per slot after its bytes are durably accepted,
/// receiving the slot back for release to the pool. If the write fails
/// before acceptance the callback is never invoked; the failure surfaces
/// through the synchronous return path instead.
pub type WriteCompletion = Box<dyn FnOnce(Slot) + Send + 'static>;

/// Append a bounded byte stream to the destination.
pub trait DeviceWriter: Send {
    /// Blocking write from a caller-owned buffer. The buffer may be reused
    /// as soon as this returns.
    fn write(&mut self, buf: &[u8]) -> Result<usize, FlashError>;

    /// Hand off a filled slot. `release` may run on a different thread.
    fn write_slot(
        &mut self,
        slot: Slot,
        len: usize,
        release: WriteCompletion,
    ) -> Result<usize, FlashError>;

    /// Wait for all pending writes to be durably accepted.
    fn finish(&mut self) -> Result<(), FlashError>;

    /// Total bytes accepted so far.
    fn bytes_written(&self) -> u64;
}

/// Synchronous writer over a plain file or device node. Release callbacks
/// run inline, before `write_slot` returns.
#[derive(Debug)]
pub struct FileDeviceWriter {
    file: File,
    path: PathBuf,
    bytes_written: u64,
}

impl FileDeviceWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, FlashError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .map_err(|e| FlashError::dest_io(e, path.display().to_string()))?;
        Ok(FileDeviceWriter { file, path, bytes_written: 0 })
    }

    /// Wrap an already-opened destination (e.g. a block device handle the
    /// platform layer prepared).
    pub fn from_file(file: File, path: impl AsRef<Path>) -> Self {
        FileDeviceWriter { file, path: path.as_ref().to_path_buf(), bytes_written: 0 }
    }
}

impl DeviceWriter for FileDeviceWriter {
    fn write(&mut self, buf: &[u8]) -> Result<usize, FlashError> {
        self.file
            .write_all(buf)
            .map_err(|e| FlashError::dest_io(e, self.path.display().to_string()))?;
        self.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    fn write_slot(
        &mut self,
        slot: Slot,
        len: usize,
        release: WriteCompletion,
    ) -> Result<usize, FlashError> {
        self.write(&slot.data()[..len])?;
        release(slot);
        Ok(len)
    }

    fn finish(&mut self) -> Result<(), FlashError> {
        self.file
            .flush()
            .and_then(|_| self.file.sync_all())
            .map_err(|e| FlashError::dest_io(e, self.path.display().to_string()))
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

enum WriteMsg {
    Buf(Vec<u8>, Sender<Result<usize, String>>),
    Slot { slot: Slot, len: usize, release: WriteCompletion },
    Flush(Sender<Result<(), String>>),
}

/// Asynchronous writer: one dedicated I/O thread drains a bounded queue.
///
/// The decoder keeps producing while earlier writes are still in flight;
/// the bounded queue plus the slot pool cap how far it can run ahead.
pub struct ThreadedDeviceWriter {
    tx: Option<Sender<WriteMsg>>,
    worker: Option<thread::JoinHandle<()>>,
    failure: Arc<Mutex<Option<String>>>,
    bytes_written: Arc<Mutex<u64>>,
    path: PathBuf,
}

impl ThreadedDeviceWriter {
    pub fn new(file: File, path: impl AsRef<Path>, queue_depth: usize) -> Self {
        let path = path.as_ref().to_path_buf();
        let (tx, rx) = bounded::<WriteMsg>(queue_depth.max(1));
        let failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let bytes_written = Arc::new(Mutex::new(0u64));

        let worker_failure = Arc::clone(&failure);
        let worker_bytes = Arc::clone(&bytes_written);
        let worker_path = path.clone();
        let worker = thread::spawn(move || {
            let mut file = file;
            for msg in rx.iter() {
                let failed = worker_failure.lock().unwrap().is_some();
                match msg {
                    WriteMsg::Buf(buf, ack) => {
                        let result = if failed {
                            Err("destination already failed".to_string())
                        } else {
                            match file.write_all(&buf) {
                                Ok(()) => {
                                    *worker_bytes.lock().unwrap() += buf.len() as u64;
                                    Ok(buf.len())
                                }
                                Err(e) => {
                                    warn!(path = %worker_path.display(), error = %e, "device write failed");
                                    *worker_failure.lock().unwrap() = Some(e.to_string());
                                    Err(e.to_string())
                                }
                            }
                        };
                        let _ = ack.send(result);
                    }
                    WriteMsg::Slot { slot, len, release } => {
                        if failed {
                            // Write already failed: drop without completing.
                            // The producer learns about it on its next call.
                            continue;
                        }
                        match file.write_all(&slot.data()[..len]) {
                            Ok(()) => {
                                *worker_bytes.lock().unwrap() += len as u64;
                                release(slot);
                            }
                            Err(e) => {
                                warn!(path = %worker_path.display(), error = %e, "device write failed");
                                *worker_failure.lock().unwrap() = Some(e.to_string());
                            }
                        }
                    }
                    WriteMsg::Flush(ack) => {
                        let result = if worker_failure.lock().unwrap().is_some() {
                            Err("destination already failed".to_string())
                        } else {
                            file.flush()
                                .and_then(|_| file.sync_all())
                                .map_err(|e| {
                                    *worker_failure.lock().unwrap() = Some(e.to_string());
                                    e.to_string()
                                })
                        };
                        let _ = ack.send(result);
                    }
                }
            }
            debug!(path = %worker_path.display(), "device writer thread exiting");
        });

        ThreadedDeviceWriter { tx: Some(tx), worker: Some(worker), failure, bytes_written, path }
    }

    fn checked_failure(&self) -> Result<(), FlashError> {
        if let Some(msg) = self.failure.lock().unwrap().clone() {
            return Err(FlashError::dest_io(
                std::io::Error::new(std::io::ErrorKind::Other, msg),
                self.path.display().to_string(),
            ));
        }
        Ok(())
    }

    fn sender(&self) -> Result<&Sender<WriteMsg>, FlashError> {
        self.tx.as_ref().ok_or_else(|| {
            FlashError::dest_io(
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "writer already shut down"),
                self.path.display().to_string(),
            )
        })
    }
}

impl DeviceWriter for ThreadedDeviceWriter {
    fn write(&mut self, buf: &[u8]) -> Result<usize, FlashError> {
        self.checked_failure()?;
        let (ack_tx, ack_rx) = bounded(1);
        self.sender()?
            .send(WriteMsg::Buf(buf.to_vec(), ack_tx))
            .map_err(|_| {
                FlashError::dest_io(
                    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "writer thread gone"),
                    self.path.display().to_string(),
                )
            })?;
        match ack_rx.recv() {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(msg)) => Err(FlashError::dest_io(
                std::io::Error::new(std::io::ErrorKind::Other, msg),
                self.path.display().to_string(),
            )),
            Err(_) => Err(FlashError::dest_io(
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "writer thread gone"),
                self.path.display().to_string(),
            )),
        }
    }

    fn write_slot(
        &mut self,
        slot: Slot,
        len: usize,
        release: WriteCompletion,
    ) -> Result<usize, FlashError> {
        self.checked_failure()?;
        self.sender()?
            .send(WriteMsg::Slot { slot, len, release })
            .map_err(|_| {
                FlashError::dest_io(
                    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "writer thread gone"),
                    self.path.display().to_string(),
                )
            })?;
        Ok(len)
    }

    fn finish(&mut self) -> Result<(), FlashError> {
        let (ack_tx, ack_rx) = bounded(1);
        self.sender()?.send(WriteMsg::Flush(ack_tx)).map_err(|_| {
            FlashError::dest_io(
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "writer thread gone"),
                self.path.display().to_string(),
            )
        })?;
        match ack_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(msg)) => Err(FlashError::dest_io(
                std::io::Error::new(std::io::ErrorKind::Other, msg),
                self.path.display().to_string(),
            )),
            Err(_) => Err(FlashError::dest_io(
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "writer thread gone"),
                self.path.display().to_string(),
            )),
        }
    }

    fn bytes_written(&self) -> u64 {
        *self.bytes_written.lock().unwrap()
    }
}

impl Drop for ThreadedDeviceWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
