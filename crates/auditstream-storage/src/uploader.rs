//! Multipart Upload Backend
//!
//! A recording is stored as one multipart upload per session. The stream
//! reserves a part number before it writes a slice, uploads the slice as that
//! part and finally completes the upload with every part it produced.
//!
//! ```text
//! create_upload ─► reserve_upload_part(1) ─► upload_part(1) ─┐
//!                  reserve_upload_part(2) ─► upload_part(2) ─┤
//!                  ...                                       ├─► complete_upload([1, 2, ...])
//!                  reserve_upload_part(n) ─► upload_part(n) ─┘
//! ```
//!
//! Parts may finish out of order. `complete_upload` always receives them
//! sorted by part number.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::slice::PartReader;

/// Identity of one multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamUpload {
    /// Upload ID assigned by the backend
    pub id: String,

    /// Session being recorded
    pub session_id: String,

    /// When the upload was created
    pub initiated: DateTime<Utc>,
}

/// A part the backend acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPart {
    /// Part number, starting at 1
    pub number: i64,

    /// Opaque tag identifying the stored content
    pub etag: String,

    /// Size of the part in bytes, header and padding included
    pub size: u64,

    pub last_modified: DateTime<Utc>,
}

/// Object storage operations needed to record a stream.
///
/// Implementations must be safe to call concurrently for different part
/// numbers of the same upload.
#[async_trait]
pub trait MultipartUploader: Send + Sync {
    /// Start a new multipart upload for a session.
    async fn create_upload(&self, session_id: &str) -> Result<StreamUpload>;

    /// Claim a part number before any of its bytes are produced.
    async fn reserve_upload_part(&self, upload: &StreamUpload, part_number: i64) -> Result<()>;

    /// Upload one part. The reader is positioned at the start of the part and
    /// is seekable, so an implementation may read it more than once.
    async fn upload_part(
        &self,
        upload: &StreamUpload,
        part_number: i64,
        reader: &mut PartReader,
    ) -> Result<StreamPart>;

    /// Parts already uploaded for a multipart upload.
    async fn list_parts(&self, upload: &StreamUpload) -> Result<Vec<StreamPart>>;

    /// Assemble the final object from `parts`, sorted by part number.
    async fn complete_upload(&self, upload: &StreamUpload, parts: &[StreamPart]) -> Result<()>;
}
