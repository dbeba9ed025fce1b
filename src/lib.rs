//! # flashpipe Core Library
//!
//! Streaming pipeline for writing compressed disk images straight to a
//! block device or file, without materializing the decompressed image.
//!
//! Two decode paths feed the same slot pool and write contract:
//!
//! - [`extract`]: locates a target entry inside an outer ZIP container and
//!   streams it out, re-decoding through a second decoder when the entry is
//!   itself compressed (`.xz`/`.gz`/`.zst`).
//! - [`vsi`]: decodes the proprietary "VSI" sparse image container (zlib
//!   payload of delimiter-framed data/zero blocks) with checksum and size
//!   verification.
//!
//! ## Key Modules
//!
//! - [`slot_pool`]: bounded pool of reusable write buffers providing
//!   backpressure between decompression and device I/O.
//! - [`source`]: pull-style byte sources (file, network channel, archive
//!   entry).
//! - [`writer`]: destination contract plus synchronous and threaded
//!   implementations.
//! - [`telemetry`]: progress/timing events consumed by the UI layer.
//!
//! The GUI/CLI front end, drive enumeration, partitioning and the network
//! transport live outside this crate; they interact with it only through
//! [`source::ByteSource`], [`writer::DeviceWriter`] and
//! [`telemetry::TelemetryEvent`].

pub mod aligned;
pub mod cancel;
pub mod error;
pub use error::FlashError;

pub mod slot_pool;
pub mod source;
pub mod telemetry;
pub mod writer;

pub mod extract;
pub mod vsi;

pub use cancel::CancelFlag;
pub use extract::{ArchivePipeline, ExtractOptions, PipelineSummary};
pub use slot_pool::{Slot, SlotPool, StarvationStats};
pub use source::{ArchiveEntrySource, ByteSource, ChannelSource, FileSource};
pub use telemetry::{TelemetryEvent, TelemetrySink};
pub use vsi::{VsiCodec, VsiHeader, VsiOptions, VsiSummary};
pub use writer::{DeviceWriter, FileDeviceWriter, ThreadedDeviceWriter};
