//! Storage Error Types
//!
//! This module defines all error types that can occur while recording or
//! replaying an audit stream.
//!
//! ## Error Categories
//!
//! ### Fatal to the Stream
//! - `ReservePart`: the uploader refused to reserve a part number. Raised while
//!   a new slice is created; the event loop stops and every producer sees it.
//! - `Canceled`: the stream was cancelled while an upload was in flight
//! - `NotFound`: the multipart upload disappeared from the backend
//!
//! ### Retryable
//! - `ConnectionProblem`, `Upload`, `Io`: transient backend failures. A part
//!   upload is retried with linear backoff until the attempt budget runs out.
//!
//! ### Per Call
//! - `BadParameter`: an event is too large even after trimming, or a record
//!   could not be framed. Only the offending `record_event` call fails.
//! - `LimitExceeded`: a configured bound was hit
//!
//! ### Decode
//! - `Core`: header or envelope corruption surfaced by `auditstream-core`
//! - `Decryption`: encrypted part without a configured decrypter
//!
//! ## Sharing
//!
//! A stream's terminal error is handed to every producer that calls into the
//! stream after it died. It is stored once as `Arc<Error>` and returned wrapped
//! in `Error::Shared`, which displays and classifies like the inner error.

use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Boxed source error carried by backend failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] auditstream_core::Error),

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{message}")]
    ConnectionProblem {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("uploader failed to reserve upload part {part_number}: {source}")]
    ReservePart {
        part_number: i64,
        #[source]
        source: Box<Error>,
    },

    #[error("operation canceled")]
    Canceled,

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("part upload failed: {0}")]
    Upload(String),

    #[error(transparent)]
    Shared(Arc<Error>),
}

impl Error {
    pub fn connection_problem(message: impl Into<String>) -> Self {
        Error::ConnectionProblem {
            message: message.into(),
            source: None,
        }
    }

    pub fn connection_problem_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::ConnectionProblem {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Unwraps `Shared` so predicates see the original variant.
    fn inner(&self) -> &Error {
        match self {
            Error::Shared(inner) => inner.inner(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.inner(), Error::NotFound(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.inner(), Error::Canceled)
    }

    pub fn is_reserve_part_error(&self) -> bool {
        matches!(self.inner(), Error::ReservePart { .. })
    }

    pub fn is_bad_parameter(&self) -> bool {
        matches!(self.inner(), Error::BadParameter(_))
    }

    pub fn is_connection_problem(&self) -> bool {
        matches!(self.inner(), Error::ConnectionProblem { .. })
    }

    /// Upload failures that retrying cannot fix.
    pub fn is_fatal_upload_error(&self) -> bool {
        self.is_canceled() || self.is_not_found()
    }
}

impl From<Arc<Error>> for Error {
    fn from(err: Arc<Error>) -> Self {
        Error::Shared(err)
    }
}
