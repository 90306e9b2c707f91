//! Error Types for the Recording Wire Format
//!
//! ## Error Categories
//!
//! ### End of Input
//! - `EndOfStream`: no bytes were left where the next part header should start.
//!   This is the normal way a sequence of parts ends and callers are expected to
//!   match on it rather than treat it as a failure.
//!
//! ### Corruption
//! - `UnsupportedVersion`: part header carries a protocol version other than 1 or 2
//! - `Io` with `UnexpectedEof`: input ended in the middle of a header field
//! - `Decode`: a record payload is not a valid `OneOf` envelope
//!
//! ### Caller Errors
//! - `BadParameter`: invalid argument (e.g. an envelope with no event set)

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no more parts in the stream")]
    EndOfStream,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u64),

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("failed to decode event envelope: {0}")]
    Decode(#[from] prost::DecodeError),
}

impl Error {
    /// True for the clean end-of-input signal returned by `PartHeader::decode`.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Error::EndOfStream)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
