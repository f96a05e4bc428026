//! Unified error type for chronocast.
//!
//! All modules funnel their failures into [`Error`], which carries enough
//! context for HTTP handlers to derive a status code via
//! [`Error::http_status`]. Two conditions are deliberately not treated as
//! failures: the range sink's early-completion signal and a client
//! disconnect, both of which simply stop the mux loop.

use std::fmt;
use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type covering all failure modes in chronocast.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The sidecar index file is missing, older than its segment, or
    /// malformed. Always recoverable by re-scanning the segment; never
    /// surfaced to an HTTP caller.
    #[error("index sidecar is stale")]
    StaleIndex,

    /// A segment could not be scanned (unreadable file, unparseable init
    /// metadata, unresolved track id).
    #[error("segment scan failed [{segment}]: {message}")]
    Scan {
        /// Segment file name.
        segment: String,
        /// Human-readable failure description.
        message: String,
    },

    /// Playback was requested for a record format other than fragmented MP4.
    #[error("unsupported record format: {0}")]
    UnsupportedFormat(String),

    /// No recorded segments overlap the requested time span.
    #[error("no segments found for the requested time span")]
    NoSegmentsFound,

    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "index", "path").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::StaleIndex => 500,
            Error::Scan { .. } => 500,
            Error::UnsupportedFormat(_) => 400,
            Error::NoSegmentsFound => 404,
            Error::NotFound { .. } => 404,
            Error::Validation(_) => 400,
            Error::Io { .. } => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Convenience constructor for [`Error::Scan`].
    pub fn scan(segment: impl fmt::Display, message: impl fmt::Display) -> Self {
        Error::Scan {
            segment: segment.to_string(),
            message: message.to_string(),
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// True when this error is the range sink's early-completion signal: the
    /// requested byte window has been fully written and the mux loop must
    /// stop. A clean cancellation, not a failure.
    pub fn is_early_completion(&self) -> bool {
        match self {
            Error::Io { source } => is_early_completion_io(source),
            _ => false,
        }
    }

    /// True when this error indicates the client went away mid-response
    /// (the body channel was closed under the sink). Treated as success.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::Io { source } if source.kind() == io::ErrorKind::BrokenPipe)
    }
}

/// Marker payload carried by the early-completion `io::Error` that the range
/// sink emits once its byte window is satisfied.
#[derive(Debug)]
pub struct EarlyCompletion;

impl fmt::Display for EarlyCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "requested byte range fully written")
    }
}

impl std::error::Error for EarlyCompletion {}

/// Build the early-completion signal as an `io::Error` so it can travel
/// through `io::Write` implementations.
pub fn early_completion() -> io::Error {
    io::Error::other(EarlyCompletion)
}

/// Check whether an `io::Error` is the early-completion signal.
pub fn is_early_completion_io(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<EarlyCompletion>())
}
