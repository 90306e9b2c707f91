//! Slice - One Part in the Making
//!
//! A `Slice` accumulates compressed event records until it is large enough (or
//! old enough) to be uploaded as one part of the multipart upload.
//!
//! ## Buffer Layout
//!
//! The header is not known until the slice is sealed, so every slice reserves
//! room for the largest header (version 2, 32 bytes) at the front of its
//! buffer. A version 1 header is written into the last 24 of those bytes and
//! the part starts after the unused prefix.
//!
//! ```text
//!  0              8                                32
//!  ├──────────────┼─────────────────────────────────┼────────────────────┬──────────┐
//!  │ unused (v1)  │ PartHeader v1 (24 bytes)        │ gzip(records)      │ padding  │
//!  ├──────────────┴─────────────────────────────────┼────────────────────┼──────────┤
//!  │ PartHeader v2 (32 bytes)                       │ gzip(records)      │ padding  │
//!  └────────────────────────────────────────────────┴────────────────────┴──────────┘
//!                                                   ▲
//!                                                   part_size counts from here
//! ```
//!
//! ## Lifecycle
//!
//! 1. `SliceFactory::new_slice` takes a pooled buffer, reserves the header area,
//!    wraps the buffer with the optional encryption layer and gzip, and
//!    reserves the part number with the uploader.
//! 2. `record_event` frames each event as `[u32 BE length][OneOf]` and writes it
//!    through the compressor.
//! 3. `into_reader` seals the slice: finishes gzip, pads non-final parts up to
//!    the minimum part size, writes the header and returns a seekable
//!    `PartReader`. It consumes the slice, so nothing can be written after it.
//!
//! The buffer returns to the pool when the `PartReader` (or an unsealed slice)
//! is dropped.

use bytes::BufMut;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use auditstream_core::part::{
    PartHeader, PROTO_STREAM_FLAG_ENCRYPTED, RECORD_HEADER_SIZE, V2_PART_HEADER_SIZE,
};
use auditstream_core::SessionEvent;

use crate::crypto::{Encryption, EncryptionWrapper, PartSink};
use crate::error::{Error, Result};
use crate::pool::{BufferPool, PooledBuffer};
use crate::uploader::{MultipartUploader, StreamUpload};

/// Everything needed to open new slices for one upload.
#[derive(Clone)]
pub struct SliceFactory {
    pub(crate) uploader: Arc<dyn MultipartUploader>,
    pub(crate) upload: StreamUpload,
    pub(crate) slice_pool: BufferPool,
    pub(crate) scratch_pool: BufferPool,
    pub(crate) encrypter: Option<Arc<dyn EncryptionWrapper>>,
    pub(crate) min_upload_bytes: usize,
}

impl SliceFactory {
    pub fn new(
        uploader: Arc<dyn MultipartUploader>,
        upload: StreamUpload,
        slice_pool: BufferPool,
        scratch_pool: BufferPool,
        min_upload_bytes: usize,
    ) -> Self {
        Self {
            uploader,
            upload,
            slice_pool,
            scratch_pool,
            encrypter: None,
            min_upload_bytes,
        }
    }

    pub fn with_encrypter(mut self, encrypter: Option<Arc<dyn EncryptionWrapper>>) -> Self {
        self.encrypter = encrypter;
        self
    }

    pub fn upload(&self) -> &StreamUpload {
        &self.upload
    }

    /// Open a slice for `part_number`.
    ///
    /// # Errors
    ///
    /// - `ReservePart`: the uploader refused the part number. The stream
    ///   cannot continue without it.
    /// - Errors from the encryption wrapper
    pub async fn new_slice(&self, part_number: i64) -> Result<Slice> {
        let mut buffer = self.slice_pool.get();
        buffer.as_mut_vec().put_bytes(0, V2_PART_HEADER_SIZE);

        let (sink, encrypted) = match &self.encrypter {
            Some(encrypter) => match encrypter.with_encryption(Box::new(buffer))? {
                Encryption::Enabled(sink) => (sink, true),
                Encryption::Disabled(sink) => (sink, false),
            },
            None => (Box::new(buffer) as Box<dyn PartSink>, false),
        };

        self.uploader
            .reserve_upload_part(&self.upload, part_number)
            .await
            .map_err(|e| Error::ReservePart {
                part_number,
                source: Box::new(e),
            })?;

        Ok(Slice {
            part_number,
            writer: GzEncoder::new(sink, Compression::default()),
            scratch_pool: self.scratch_pool.clone(),
            min_upload_bytes: self.min_upload_bytes,
            encrypted,
            is_last: false,
            last_event_index: -1,
            event_count: 0,
        })
    }
}

/// An open part accumulating compressed records.
pub struct Slice {
    part_number: i64,
    writer: GzEncoder<Box<dyn PartSink>>,
    scratch_pool: BufferPool,
    min_upload_bytes: usize,
    encrypted: bool,
    is_last: bool,
    last_event_index: i64,
    event_count: u64,
}

impl Slice {
    pub fn part_number(&self) -> i64 {
        self.part_number
    }

    /// Highest event index recorded so far, -1 when empty.
    pub fn last_event_index(&self) -> i64 {
        self.last_event_index
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn is_empty(&self) -> bool {
        self.event_count == 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Mark the slice as the final part. Final parts are never padded.
    pub fn set_last(&mut self, is_last: bool) {
        self.is_last = is_last;
    }

    /// Bytes that already reached the buffer, reserved header included.
    pub fn buffered_len(&self) -> usize {
        self.writer.get_ref().buffered_len()
    }

    /// The slice is large enough to be uploaded without padding.
    pub fn should_upload(&self) -> bool {
        self.buffered_len() >= self.min_upload_bytes
    }

    /// Append one framed record.
    ///
    /// # Errors
    ///
    /// `BadParameter` if the event cannot be framed (larger than a `u32` length
    /// allows, or the encoder produced an unexpected number of bytes).
    pub fn record_event(&mut self, event: &SessionEvent) -> Result<()> {
        let size = event.size();
        let length = u32::try_from(size).map_err(|_| {
            Error::BadParameter(format!("event of {size} bytes does not fit a record"))
        })?;

        let mut scratch = self.scratch_pool.get();
        let record = scratch.as_mut_vec();
        record.put_u32(length);
        event.encode_envelope(record);

        let expected = RECORD_HEADER_SIZE + size;
        if record.len() != expected {
            return Err(Error::BadParameter(format!(
                "expected {expected} record bytes, encoder produced {}",
                record.len()
            )));
        }

        self.writer.write_all(record)?;
        self.last_event_index = self.last_event_index.max(event.index());
        self.event_count += 1;
        Ok(())
    }

    /// Seal the slice and return a reader over the finished part.
    pub fn into_reader(self) -> Result<PartReader> {
        let sink = self.writer.finish()?;
        let mut buffer = sink.finish()?;

        let header_len = PartHeader::size_for(self.encrypted);
        let start = V2_PART_HEADER_SIZE - header_len;
        let part_size = buffer.len() - V2_PART_HEADER_SIZE;

        let written = buffer.len() - start;
        let mut padding = 0;
        if !self.is_last && written < self.min_upload_bytes {
            padding = self.min_upload_bytes - written;
            buffer.as_mut_vec().put_bytes(0, padding);
        }

        let header = if self.encrypted {
            PartHeader::v2(part_size as u64, padding as u64, PROTO_STREAM_FLAG_ENCRYPTED)
        } else {
            PartHeader::v1(part_size as u64, padding as u64)
        };
        let mut dst = &mut buffer[start..V2_PART_HEADER_SIZE];
        header.encode_to(&mut dst);

        Ok(PartReader::new(buffer, start))
    }
}

/// Seekable reader over a sealed part.
///
/// Owns the slice buffer; dropping the reader returns it to the pool.
#[derive(Debug)]
pub struct PartReader {
    buffer: PooledBuffer,
    start: usize,
    pos: u64,
}

impl PartReader {
    fn new(buffer: PooledBuffer, start: usize) -> Self {
        Self {
            buffer,
            start,
            pos: 0,
        }
    }

    /// Reader over bytes that did not come from a slice.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self::new(PooledBuffer::detached(bytes), 0)
    }

    /// The whole part: header, body and padding.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[self.start..]
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Read for PartReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let bytes = self.as_bytes();
        let remaining = usize::try_from(self.pos)
            .ok()
            .and_then(|pos| bytes.get(pos..))
            .unwrap_or_default();
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for PartReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, offset) = match pos {
            SeekFrom::Start(n) => {
                self.pos = n;
                return Ok(n);
            }
            SeekFrom::End(offset) => (self.len() as u64, offset),
            SeekFrom::Current(offset) => (self.pos, offset),
        };
        match base.checked_add_signed(offset) {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}
