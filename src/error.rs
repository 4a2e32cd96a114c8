//! Error types for the resumable-dl library.

use thiserror::Error;

/// Errors from a size probe (HEAD request).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The request never produced a response.
    #[error("probe transport error: {0}")]
    Transport(String),

    /// The request exceeded the configured timeout.
    #[error("probe timed out")]
    Timeout,

    /// The server answered with a non-2xx status.
    #[error("probe returned HTTP {0}")]
    Status(u16),

    /// No `Content-Length` header was present.
    #[error("probe response has no Content-Length")]
    MissingLength,

    /// `Content-Length` was present but unparsable or zero.
    #[error("probe response has invalid Content-Length: {0:?}")]
    InvalidLength(String),
}

/// Errors from a single ranged segment fetch.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The request never produced a response.
    #[error("fetch transport error: {0}")]
    Transport(String),

    /// The request exceeded the configured timeout.
    #[error("fetch timed out")]
    Timeout,

    /// The server answered with something other than 200 or 206.
    #[error("fetch returned HTTP {0}")]
    Status(u16),

    /// The server answered with an empty body.
    #[error("fetch returned an empty body")]
    EmptyBody,

    /// The body length does not match the requested range.
    #[error("fetch returned {actual} bytes, expected {expected}")]
    LengthMismatch {
        /// Length of the requested range.
        expected: u64,
        /// Length actually received.
        actual: u64,
    },

    /// Writing the segment to disk failed.
    #[error("segment write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from final-file assembly.
#[derive(Error, Debug)]
pub enum AssembleError {
    /// A segment file vanished between completion and assembly.
    #[error("segment {0} is missing")]
    MissingSegment(u64),

    /// Reading a segment or writing the output failed.
    #[error("assembly I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during download operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Size discovery failed.
    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),

    /// A segment exceeded its retry budget.
    #[error("segment {index} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Segment index.
        index: u64,
        /// Number of attempts made.
        attempts: u32,
        /// The last fetch error.
        #[source]
        source: FetchError,
    },

    /// Final-file assembly failed.
    #[error("assembly failed: {0}")]
    Assemble(#[from] AssembleError),

    /// The asset has no valid target or a stored value is unusable.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A metadata record could not be (de)serialized.
    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// HTTP client construction error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The operation was cancelled.
    #[error("download cancelled")]
    Cancelled,
}

/// A specialized `Result` type for resumable-dl operations.
pub type Result<T> = std::result::Result<T, Error>;
