//! AuditStream Storage Layer
//!
//! This crate records interactive session events into a multipart upload and
//! replays them from the uploaded parts.
//!
//! ## What is the Storage Layer?
//!
//! Producers (terminal relays, database proxies) emit one event per keystroke,
//! output chunk or query. The storage layer turns that stream into a small
//! number of large, compressed parts:
//!
//! 1. **Slicing**: events are framed and gzip-compressed into an in-memory
//!    slice until it reaches the minimum part size
//! 2. **Uploading**: sealed slices are uploaded concurrently, with retries,
//!    while new events keep flowing into the next slice
//! 3. **Completing**: the multipart upload is completed with its parts sorted
//!    by number and the session is handed to an optional summarizer
//! 4. **Replaying**: `ProtoReader` decodes the concatenated parts back into
//!    events, skipping duplicates left behind by retries and resumes
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐
//! │  Producers  │
//! └──────┬──────┘
//!        │ record_event
//!        ▼
//! ┌─────────────────┐
//! │  AuditStream    │
//! │  SliceWriter    │ ◄── You are here
//! │ - Frames        │
//! │ - Compresses    │
//! │ - Uploads parts │
//! └────────┬────────┘
//!          │ parts
//!          ▼
//! ┌─────────────────────┐
//! │ MultipartUploader   │
//! │ (object storage)    │
//! └────────┬────────────┘
//!          │ concatenated parts
//!          ▼
//! ┌─────────────────┐
//! │  ProtoReader    │ ◄── You are here
//! │ - Validates     │
//! │ - Decompresses  │
//! │ - Deduplicates  │
//! └────────┬────────┘
//!          │ events
//!          ▼
//! ┌─────────────┐
//! │   Players   │
//! └─────────────┘
//! ```
//!
//! ## Main Components
//!
//! ### Streamer / AuditStream
//! `Streamer` creates and resumes streams. Each `AuditStream` owns one event
//! loop task that slices events and schedules uploads.
//!
//! **Key features**:
//! - Bounded intake (producers wait while the loop is busy)
//! - At most `concurrent_uploads` part uploads in flight
//! - Inactivity flush, so idle sessions still reach storage
//! - Linear-backoff retries for transient upload errors
//!
//! ### ProtoReader
//! Reads any number of parts, in either header version, from a `Read` source.
//!
//! **Key features**:
//! - Optional decryption of encrypted parts
//! - Duplicate and out-of-order accounting
//! - Sticky error state after corruption
//!
//! ## Usage Example
//!
//! ```ignore
//! use auditstream_storage::{MemoryUploader, ProtoReader, Streamer, StreamerConfig};
//! use std::sync::Arc;
//!
//! let uploader = Arc::new(MemoryUploader::new());
//! let streamer = Streamer::new(StreamerConfig::default(), uploader.clone())?;
//!
//! let stream = streamer.create_audit_stream("session-1").await?;
//! for event in events {
//!     stream.record_event(event).await?;
//! }
//! stream.complete().await?;
//!
//! let recording = uploader.completed(&stream.upload().id).unwrap().data;
//! let events = ProtoReader::new(recording.as_slice()).read_all()?;
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod memory;
pub mod pool;
pub mod reader;
pub mod retry;
pub mod slice;
pub mod stream;
pub mod streamer;
pub mod summarizer;
pub mod upload;
pub mod uploader;

pub use config::StreamerConfig;
pub use crypto::{DecryptionWrapper, Encryption, EncryptionWrapper, PartSink};
pub use error::{Error, Result};
pub use memory::{CompletedUpload, FailureKind, MemoryUploader};
pub use pool::{BufferPool, PooledBuffer};
pub use reader::{ProtoReader, ProtoReaderStats};
pub use retry::RetryConfig;
pub use slice::{PartReader, Slice, SliceFactory};
pub use stream::lifecycle::{CompletionMode, Done, Lifecycle};
pub use stream::{AuditStream, StreamStatus};
pub use streamer::Streamer;
pub use summarizer::{CapturedEnd, SessionSummarizer};
pub use upload::ActiveUpload;
pub use uploader::{MultipartUploader, StreamPart, StreamUpload};

#[cfg(test)]
pub(crate) mod testing {
    use auditstream_core::event::{EventMetadata, SessionEnd, SessionMetadata, SessionPrint};
    use auditstream_core::SessionEvent;

    /// Deterministic bytes that gzip cannot shrink.
    pub(crate) fn noise(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    fn metadata(index: i64, event_type: &str) -> Option<EventMetadata> {
        Some(EventMetadata {
            index,
            event_type: event_type.to_string(),
            ..Default::default()
        })
    }

    pub(crate) fn print_event(index: i64, data: &[u8]) -> SessionEvent {
        SessionEvent::SessionPrint(SessionPrint {
            metadata: metadata(index, "print"),
            chunk_index: index,
            data: data.to_vec(),
            ..Default::default()
        })
    }

    pub(crate) fn session_end(index: i64) -> SessionEvent {
        SessionEvent::SessionEnd(SessionEnd {
            metadata: metadata(index, "session.end"),
            session: Some(SessionMetadata {
                session_id: "session-1".to_string(),
                ..Default::default()
            }),
            user: "alice".to_string(),
            interactive: true,
            ..Default::default()
        })
    }
}
