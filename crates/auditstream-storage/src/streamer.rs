//! Streamer - Audit Stream Factory
//!
//! A `Streamer` binds configuration, the multipart uploader and the shared
//! buffer pools together and hands out `AuditStream`s, one per recorded
//! session.
//!
//! ## Usage
//!
//! ```ignore
//! use auditstream_storage::{MemoryUploader, Streamer, StreamerConfig};
//! use std::sync::Arc;
//!
//! let streamer = Streamer::new(StreamerConfig::default(), Arc::new(MemoryUploader::new()))?
//!     .with_summarizer(summarizer);
//!
//! // New recording
//! let stream = streamer.create_audit_stream("session-1").await?;
//! stream.record_event(event).await?;
//! stream.complete().await?;
//!
//! // Continue a recording that was closed (not completed) earlier
//! let stream = streamer.resume_audit_stream("session-1", &upload_id).await?;
//! ```
//!
//! The first slice of a stream is opened before the stream is returned, so a
//! backend that refuses to reserve a part fails the constructor instead of the
//! first `record_event`.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};

use crate::config::StreamerConfig;
use crate::crypto::EncryptionWrapper;
use crate::error::Result;
use crate::pool::{BufferPool, DEFAULT_MAX_IDLE_BUFFERS};
use crate::slice::SliceFactory;
use crate::stream::writer::{SliceWriter, WriterOptions};
use crate::stream::{AuditStream, Shared, StreamStatus};
use crate::summarizer::SessionSummarizer;
use crate::uploader::{MultipartUploader, StreamPart, StreamUpload};

pub struct Streamer {
    config: StreamerConfig,
    uploader: Arc<dyn MultipartUploader>,
    slice_pool: BufferPool,
    scratch_pool: BufferPool,
    encrypter: Option<Arc<dyn EncryptionWrapper>>,
    summarizer: Option<Arc<dyn SessionSummarizer>>,
    force_flush: Option<Arc<Notify>>,
}

impl Streamer {
    /// Create a streamer after validating `config`.
    pub fn new(config: StreamerConfig, uploader: Arc<dyn MultipartUploader>) -> Result<Self> {
        config.validate()?;
        let slice_pool = BufferPool::new(config.slice_buffer_capacity(), DEFAULT_MAX_IDLE_BUFFERS);
        let scratch_pool =
            BufferPool::new(config.scratch_buffer_capacity(), DEFAULT_MAX_IDLE_BUFFERS);
        Ok(Self {
            config,
            uploader,
            slice_pool,
            scratch_pool,
            encrypter: None,
            summarizer: None,
            force_flush: None,
        })
    }

    /// Share buffer pools with other streamers.
    pub fn with_pools(mut self, slice_pool: BufferPool, scratch_pool: BufferPool) -> Self {
        self.slice_pool = slice_pool;
        self.scratch_pool = scratch_pool;
        self
    }

    /// Encrypt slices with `encrypter`.
    pub fn with_encrypter(mut self, encrypter: Arc<dyn EncryptionWrapper>) -> Self {
        self.encrypter = Some(encrypter);
        self
    }

    /// Summarize sessions after their upload completed.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn SessionSummarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Upload the current slice of every stream whenever `notify` fires.
    /// Mostly useful in tests.
    pub fn with_force_flush(mut self, notify: Arc<Notify>) -> Self {
        self.force_flush = Some(notify);
        self
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    /// Start a new multipart upload for `session_id` and record into it.
    pub async fn create_audit_stream(&self, session_id: &str) -> Result<AuditStream> {
        let upload = self.uploader.create_upload(session_id).await?;
        self.create_audit_stream_for_upload(upload).await
    }

    /// Record into an upload that was created elsewhere and has no parts yet.
    pub async fn create_audit_stream_for_upload(&self, upload: StreamUpload) -> Result<AuditStream> {
        self.start(upload, Vec::new()).await
    }

    /// Continue recording into an existing upload, after the parts it
    /// already holds.
    pub async fn resume_audit_stream(&self, session_id: &str, upload_id: &str) -> Result<AuditStream> {
        let upload = StreamUpload {
            id: upload_id.to_string(),
            session_id: session_id.to_string(),
            // Not known when resuming
            initiated: DateTime::<Utc>::default(),
        };
        let parts = self.uploader.list_parts(&upload).await?;
        tracing::debug!(
            upload = %upload_id,
            session = %session_id,
            parts = parts.len(),
            "Resuming stream"
        );
        self.start(upload, parts).await
    }

    async fn start(&self, upload: StreamUpload, completed_parts: Vec<StreamPart>) -> Result<AuditStream> {
        let first_part = first_part_number(&completed_parts);

        let factory = SliceFactory::new(
            self.uploader.clone(),
            upload.clone(),
            self.slice_pool.clone(),
            self.scratch_pool.clone(),
            self.config.min_upload_bytes,
        )
        .with_encrypter(self.encrypter.clone());
        let first_slice = factory.new_slice(first_part).await?;

        let shared = Arc::new(Shared::new(upload.clone(), self.config.max_message_size));
        let (events_tx, events_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(StreamStatus {
            upload_id: upload.id.clone(),
            last_event_index: -1,
            last_upload_time: Utc::now(),
        });

        let writer = SliceWriter::new(
            shared.clone(),
            events_rx,
            status_tx,
            WriterOptions {
                factory,
                first_slice,
                completed_parts,
                concurrent_uploads: self.config.concurrent_uploads,
                inactivity_flush_period: self.config.inactivity_flush_period,
                retry: self.config.retry.clone(),
                summarizer: self.summarizer.clone(),
                force_flush: self.force_flush.clone(),
            },
        );
        tokio::spawn(writer.run());

        tracing::debug!(
            upload = %upload.id,
            session = %upload.session_id,
            first_part,
            "Started audit stream"
        );
        Ok(AuditStream::new(shared, events_tx, status_rx))
    }
}

/// 1 for a fresh upload, otherwise two past the highest uploaded part.
fn first_part_number(completed_parts: &[StreamPart]) -> i64 {
    completed_parts
        .iter()
        .map(|part| part.number)
        .max()
        .map_or(1, |last| last + 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryUploader;

    fn part(number: i64) -> StreamPart {
        StreamPart {
            number,
            etag: String::new(),
            size: 0,
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn test_first_part_number() {
        assert_eq!(first_part_number(&[]), 1);
        assert_eq!(first_part_number(&[part(1)]), 3);
        assert_eq!(first_part_number(&[part(4), part(2), part(3)]), 6);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = StreamerConfig {
            concurrent_uploads: 0,
            ..Default::default()
        };
        assert!(Streamer::new(config, Arc::new(MemoryUploader::new())).is_err());
    }

    #[tokio::test]
    async fn test_create_reserves_first_part() {
        let uploader = Arc::new(MemoryUploader::new());
        let streamer = Streamer::new(StreamerConfig::default(), uploader.clone()).unwrap();

        let stream = streamer.create_audit_stream("s1").await.unwrap();
        assert_eq!(uploader.reserved_parts(&stream.upload().id), vec![1]);
        assert_eq!(stream.status().borrow().last_event_index, -1);
        stream.cancel();
    }

    #[tokio::test]
    async fn test_create_fails_when_reserve_fails() {
        let uploader = Arc::new(MemoryUploader::new());
        uploader.fail_reserve(true);
        let streamer = Streamer::new(StreamerConfig::default(), uploader).unwrap();

        let err = streamer.create_audit_stream("s1").await.unwrap_err();
        assert!(err.is_reserve_part_error());
    }

    #[tokio::test]
    async fn test_resume_unknown_upload_is_not_found() {
        let streamer =
            Streamer::new(StreamerConfig::default(), Arc::new(MemoryUploader::new())).unwrap();
        let err = streamer.resume_audit_stream("s1", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
