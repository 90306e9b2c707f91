//! Streamer Configuration
//!
//! This module defines configuration for the recording path.
//!
//! ## StreamerConfig
//!
//! Controls how slices are sized, flushed and uploaded:
//!
//! - **min_upload_bytes**: Upload a slice once it reaches this size. Non-final
//!   parts smaller than this are zero padded up to it (default: 5MB)
//! - **concurrent_uploads**: Parts of one stream uploaded in parallel (default: 1)
//! - **max_message_size**: Largest serialized event accepted after trimming (default: 64KB)
//! - **inactivity_flush_period**: Flush a non-empty slice after this long without
//!   new events (default: 5 min)
//! - **retry**: Linear backoff for failed part uploads (see `RetryConfig`)
//!
//! Collaborators that cannot be serialized (encrypter, summarizer, force flush
//! hook) are attached to the `Streamer` with builder methods instead.
//!
//! ## Usage
//!
//! ```ignore
//! use auditstream_storage::StreamerConfig;
//!
//! // Production config
//! let config = StreamerConfig::default();
//!
//! // Small parts for local testing
//! let config = StreamerConfig {
//!     min_upload_bytes: 1024,
//!     concurrent_uploads: 4,
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use auditstream_core::part::{
    CONCURRENT_UPLOADS_PER_STREAM, MAX_PROTO_MESSAGE_SIZE_BYTES, MIN_UPLOAD_PART_SIZE_BYTES,
};

use crate::error::{Error, Result};
use crate::retry::RetryConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamerConfig {
    /// Minimum part size in bytes (default: 5MB)
    #[serde(default = "default_min_upload_bytes")]
    pub min_upload_bytes: usize,

    /// Maximum concurrent part uploads per stream (default: 1)
    #[serde(default = "default_concurrent_uploads")]
    pub concurrent_uploads: usize,

    /// Maximum serialized event size in bytes (default: 64KB)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Flush the current slice after this much idle time (default: 5 minutes)
    #[serde(
        default = "default_inactivity_flush_period",
        with = "crate::retry::duration_ms"
    )]
    pub inactivity_flush_period: Duration,

    /// Backoff for failed part uploads
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            min_upload_bytes: default_min_upload_bytes(),
            concurrent_uploads: default_concurrent_uploads(),
            max_message_size: default_max_message_size(),
            inactivity_flush_period: default_inactivity_flush_period(),
            retry: RetryConfig::default(),
        }
    }
}

impl StreamerConfig {
    /// Check that every bound is usable.
    pub fn validate(&self) -> Result<()> {
        if self.min_upload_bytes == 0 {
            return Err(Error::BadParameter("min_upload_bytes must be positive".into()));
        }
        if self.concurrent_uploads == 0 {
            return Err(Error::BadParameter("concurrent_uploads must be positive".into()));
        }
        if self.max_message_size == 0 {
            return Err(Error::BadParameter("max_message_size must be positive".into()));
        }
        if self.inactivity_flush_period.is_zero() {
            return Err(Error::BadParameter(
                "inactivity_flush_period must be positive".into(),
            ));
        }
        self.retry.validate()
    }

    /// Capacity of pooled slice buffers. Slices are uploaded once they reach
    /// `min_upload_bytes`, the extra third absorbs the last record and gzip
    /// trailer without reallocating.
    pub fn slice_buffer_capacity(&self) -> usize {
        self.min_upload_bytes + self.min_upload_bytes / 3
    }

    /// Capacity of pooled scratch buffers used to frame a single record.
    pub fn scratch_buffer_capacity(&self) -> usize {
        self.max_message_size + auditstream_core::part::RECORD_HEADER_SIZE
    }
}

fn default_min_upload_bytes() -> usize {
    MIN_UPLOAD_PART_SIZE_BYTES // 5MB, S3 minimum part size
}

fn default_concurrent_uploads() -> usize {
    CONCURRENT_UPLOADS_PER_STREAM
}

fn default_max_message_size() -> usize {
    MAX_PROTO_MESSAGE_SIZE_BYTES // 64KB
}

fn default_inactivity_flush_period() -> Duration {
    Duration::from_secs(5 * 60) // 5 minutes
}
