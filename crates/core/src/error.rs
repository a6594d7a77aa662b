//! Error taxonomy for the pipeline execution engine
//!
//! Mirrors the error kinds enumerated in the design's error-handling
//! section: configuration errors are fatal at construction, transport and
//! stream errors are recoverable at the scope they occur in, and protocol
//! errors are logged and dropped rather than propagated.

use thiserror::Error;

/// Result type alias used throughout `aiko-core`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the pipeline execution engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad pipeline definition, missing module, unknown deploy type, or
    /// any other failure discovered while constructing a `Pipeline`.
    /// Fatal: construction unwinds and the process should exit non-zero.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Broker unreachable, publish failed after retries, or a similar
    /// transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// An element returned `StreamEvent::Error`, or a frame was missing a
    /// declared input. Fatal for the one stream, not the process.
    #[error("stream error on stream {stream_id}: {message}")]
    Stream { stream_id: u64, message: String },

    /// Malformed S-expression or unknown command. Logged and ignored by
    /// the caller; never propagated past the message handler.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Graph construction referenced an undefined successor node.
    #[error("graph error: {0}")]
    Graph(String),
}
