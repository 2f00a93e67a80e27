//! Error types for the streaming substrate.

use crate::id::ReaderId;
use thiserror::Error;

/// Errors that travel through a pipeline.
///
/// Cloneable because a single failure fans out to every attached reader of a
/// buffer, so payloads are owned strings rather than boxed sources.
#[non_exhaustive]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// `first` saw the source complete without a matching value.
    #[error("No elements in sequence")]
    NoElements,

    /// The upstream stage terminated with an error before this pull.
    #[error("upstream failed: {0}")]
    Upstream(String),

    /// A projection or predicate supplied by the caller failed.
    #[error("projection failed: {0}")]
    Projection(String),

    /// An auxiliary stream failed while feeding a combinator.
    #[error("auxiliary stream failed: {0}")]
    Aux(String),

    /// A worker-pool lease failed under a stream surface.
    #[error("worker pool: {0}")]
    Pool(String),

    /// A non-stream failure coerced into the pipeline.
    #[error("{0}")]
    Coerced(String),
}

impl StreamError {
    /// Coerce any displayable failure into a stream error.
    ///
    /// This is the single entry point for errors that originate outside the
    /// pipeline (auxiliary futures, pool collaborators, user values).
    pub fn coerce(err: impl std::fmt::Display) -> Self {
        Self::Coerced(err.to_string())
    }
}

/// Buffer misuse, raised synchronously to the caller.
#[non_exhaustive]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BufferError {
    /// `write` after `complete`.
    #[error("write after complete")]
    WriteAfterComplete,

    /// `write` after `error`.
    #[error("write after error")]
    WriteAfterError,

    /// Operation referenced a reader that is not attached.
    #[error("unknown reader {0}")]
    UnknownReader(ReaderId),

    /// The reader reached an in-band error marker.
    #[error("buffer faulted: {0}")]
    Faulted(StreamError),
}

impl From<BufferError> for StreamError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::Faulted(e) => e,
            other => StreamError::coerce(other),
        }
    }
}
