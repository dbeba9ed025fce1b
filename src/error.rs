use std::io;

/// The primary error type for all operations in the `flashpipe` crate.
///
/// Every session terminates with exactly one outcome: success, one of these
/// errors, or `Cancelled`. `Cancelled` is carried as a variant so it can flow
/// through `Result` plumbing, but callers report it as a distinct outcome,
/// not as a failure.
#[derive(Debug)]
pub enum FlashError {
    /// Failed to read from the input side (file, network channel, archive entry).
    SourceIo { source: io::Error, context: String },

    /// Failed to write to the destination device or file.
    DestinationIo { source: io::Error, context: String },

    /// The outer or inner container could not be opened or parsed, or the
    /// decompressed stream violated the expected framing (e.g. an unknown
    /// VSI delimiter byte).
    ContainerFormat(String),

    /// The fixed VSI header failed validation (magic, block size or size field).
    HeaderValidation(String),

    /// Checksum or total-size mismatch detected after the input was fully
    /// consumed. Signals data corruption, never a control-flow problem.
    Integrity(String),

    /// The archive was iterated to the end without finding the target entry.
    EntryNotFound(String),

    /// The shared cancellation flag was observed set.
    Cancelled,
}

impl FlashError {
    /// True for the cancellation outcome, which takes precedence over any
    /// error raised in the same iteration.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FlashError::Cancelled)
    }

    pub(crate) fn source_io(source: io::Error, context: impl Into<String>) -> Self {
        FlashError::SourceIo { source, context: context.into() }
    }

    pub(crate) fn dest_io(source: io::Error, context: impl Into<String>) -> Self {
        FlashError::DestinationIo { source, context: context.into() }
    }

    /// Recover a `FlashError` that was tunnelled through an `io::Error` by
    /// [`crate::source::SourceReader`]; anything else is a plain source I/O
    /// failure.
    pub(crate) fn from_read_io(err: io::Error, context: &str) -> Self {
        let tunnelled = err.get_ref().map_or(false, |inner| inner.is::<FlashError>());
        if tunnelled {
            match err.into_inner().map(|inner| inner.downcast::<FlashError>()) {
                Some(Ok(flash)) => *flash,
                _ => FlashError::ContainerFormat("malformed tunnelled error".to_string()),
            }
        } else {
            FlashError::source_io(err, context)
        }
    }
}

impl std::fmt::Display for FlashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlashError::SourceIo { source, context } => {
                write!(f, "Error reading {}: {}", context, source)
            }
            FlashError::DestinationIo { source, context } => {
                write!(f, "Error writing to {}: {}", context, source)
            }
            FlashError::ContainerFormat(msg) => write!(f, "Container format error: {}", msg),
            FlashError::HeaderValidation(msg) => write!(f, "Invalid VSI header: {}", msg),
            FlashError::Integrity(msg) => write!(f, "Integrity check failed: {}", msg),
            FlashError::EntryNotFound(msg) => write!(f, "{}", msg),
            FlashError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for FlashError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FlashError::SourceIo { source, .. } => Some(source),
            FlashError::DestinationIo { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<zip::result::ZipError> for FlashError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(io) => FlashError::from_read_io(io, "archive stream"),
            other => FlashError::ContainerFormat(other.to_string()),
        }
    }
}
