//! Encryption Hooks
//!
//! The pipeline never encrypts by itself. A recording can be wrapped by an
//! external `EncryptionWrapper` and replayed through a matching
//! `DecryptionWrapper`.
//!
//! ## Layering
//!
//! ```text
//! record bytes ─► gzip ─► [encryption layer] ─► PartSink (pooled buffer)
//! ```
//!
//! Compression is always the outermost layer on the write side, so encryption
//! sees compressed bytes. On the read side a part flagged as encrypted is
//! decrypted first and then decompressed.
//!
//! A wrapper may decide per slice that encryption is disabled (for example when
//! no key is configured for the cluster). In that case it hands the sink back
//! unchanged and the part is written with a version 1 header.

use std::io::{self, Read, Write};

use crate::error::Result;
use crate::pool::PooledBuffer;

/// Destination of a slice's compressed bytes.
///
/// The innermost sink is the slice's pooled buffer. Encryption layers wrap it
/// and must forward `finish` to the sink they wrap.
pub trait PartSink: Write + Send {
    /// Bytes already written to the innermost buffer.
    fn buffered_len(&self) -> usize;

    /// Flush any state held by this layer and hand back the underlying buffer.
    fn finish(self: Box<Self>) -> io::Result<PooledBuffer>;
}

impl PartSink for PooledBuffer {
    fn buffered_len(&self) -> usize {
        self.len()
    }

    fn finish(self: Box<Self>) -> io::Result<PooledBuffer> {
        Ok(*self)
    }
}

/// Outcome of asking an `EncryptionWrapper` to wrap a slice sink.
pub enum Encryption {
    /// The sink now encrypts everything written to it.
    Enabled(Box<dyn PartSink>),

    /// Encryption is not configured; the original sink is returned untouched.
    Disabled(Box<dyn PartSink>),
}

/// Wraps a slice sink with an encryption layer.
pub trait EncryptionWrapper: Send + Sync {
    fn with_encryption(&self, sink: Box<dyn PartSink>) -> Result<Encryption>;
}

/// Wraps the body of an encrypted part with a decryption layer.
pub trait DecryptionWrapper: Send + Sync {
    fn with_decryption(&self, source: Box<dyn Read + Send>) -> Result<Box<dyn Read + Send>>;
}
