//! Outbound progress and diagnostics events.
//!
//! The pipeline emits these for the UI layer; nothing in the core reads
//! them back. A sink without a listener silently drops events, so decode
//! paths never block on telemetry.

use crossbeam_channel::Sender;

use crate::slot_pool::StarvationStats;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    /// A human-readable status line for the preparation phase.
    PreparationStatus(String),

    /// The target entry was located inside the outer container.
    EntryDiscovered { name: String, size: u64 },

    /// Streaming of the matched entry began; `setup_ms` is the time spent
    /// opening the container and searching for the entry.
    ExtractionStarted { setup_ms: u64 },

    /// Cumulative bytes processed (compressed side), emitted as a tick.
    Progress { bytes_processed: u64 },

    /// Total milliseconds spent inside the decompressor, with the number of
    /// decompressed bytes it produced.
    DecompressionTime { ms: u64, bytes: u64 },

    /// Total milliseconds the bridge spent waiting on the input side, with
    /// the number of bytes it pulled.
    RingWaitTime { ms: u64, bytes: u64 },

    /// Final slot pool starvation counters for the session.
    SlotPoolStats(StarvationStats),
}

/// Cloneable handle for emitting [`TelemetryEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct TelemetrySink {
    tx: Option<Sender<TelemetryEvent>>,
}

impl TelemetrySink {
    pub fn new(tx: Sender<TelemetryEvent>) -> Self {
        TelemetrySink { tx: Some(tx) }
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        TelemetrySink { tx: None }
    }

    pub fn send(&self, event: TelemetryEvent) {
        if let Some(tx) = &self.tx {
            // A departed listener must never stall the pipeline.
            let _ = tx.try_send(event);
        }
    }
}
