//! Bridges the outer container's entry stream into a second decoder.
//!
//! When the matched entry is itself compressed, the inner decoder pulls its
//! input through this adapter: each request drains the next chunk of the
//! outer entry's decompressed bytes into a fixed intermediate buffer. The
//! adapter records whether the outer stream is exhausted and how long the
//! pulls took, which the pipeline uses for the end-of-stream quirk and for
//! ring-wait telemetry.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Fixed size of the outer-to-inner transfer buffer.
pub const BRIDGE_BUFFER_SIZE: usize = 256 * 1024;

/// Shared observability handles for one bridge instance.
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    exhausted: Arc<AtomicBool>,
    wait_ms: Arc<AtomicU64>,
    bytes: Arc<AtomicU64>,
}

impl BridgeStats {
    /// True once the outer entry stream has returned EOF.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    pub fn wait_ms(&self) -> u64 {
        self.wait_ms.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

pub struct BridgeReader<'a, R: Read> {
    outer: &'a mut R,
    buf: Vec<u8>,
    pos: usize,
    filled: usize,
    stats: BridgeStats,
}

impl<'a, R: Read> BridgeReader<'a, R> {
    pub fn new(outer: &'a mut R) -> Self {
        BridgeReader {
            outer,
            buf: vec![0u8; BRIDGE_BUFFER_SIZE],
            pos: 0,
            filled: 0,
            stats: BridgeStats::default(),
        }
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats.clone()
    }
}

impl<R: Read> Read for BridgeReader<'_, R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.pos == self.filled {
            let started = Instant::now();
            let n = self.outer.read(&mut self.buf)?;
            self.stats
                .wait_ms
                .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
            if n == 0 {
                self.stats.exhausted.store(true, Ordering::SeqCst);
                return Ok(0);
            }
            self.stats.bytes.fetch_add(n as u64, Ordering::Relaxed);
            self.pos = 0;
            self.filled = n;
        }
        let n = (self.filled - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
