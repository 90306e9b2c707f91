//! Part Header - Binary Framing of Uploaded Parts
//!
//! Every part uploaded by the recording pipeline starts with a `PartHeader`.
//! A complete recording is nothing more than its parts concatenated in part
//! number order, so a reader can walk the recording header by header.
//!
//! ## Header Layout
//!
//! All integers are big-endian.
//!
//! ```text
//! Version 1 (24 bytes)
//! ┌──────────────────┬──────────────────┬──────────────────┐
//! │ version (u64)    │ part_size (u64)  │ padding (u64)    │
//! └──────────────────┴──────────────────┴──────────────────┘
//!
//! Version 2 (32 bytes)
//! ┌──────────────────┬──────────────────┬──────────────────┬───────┬──────────┐
//! │ version (u64)    │ part_size (u64)  │ padding (u64)    │ flags │ reserved │
//! │                  │                  │                  │ (u8)  │ (7 × 0)  │
//! └──────────────────┴──────────────────┴──────────────────┴───────┴──────────┘
//! ```
//!
//! - **part_size**: number of body bytes following the header (compressed,
//!   possibly encrypted records)
//! - **padding**: number of zero bytes after the body. Object stores reject
//!   non-final multipart parts below a minimum size, so short parts are padded.
//! - **flags**: bit 0 marks an encrypted body. Only version 2 carries flags.
//!
//! ## Decoding
//!
//! `PartHeader::decode` distinguishes a clean end of input (nothing left before
//! the version field) from truncation inside a header. The former is returned as
//! `Error::EndOfStream` and terminates a read normally.

use bytes::BufMut;
use std::io::{self, Read};

use crate::{Error, Result};

/// Size of a 32 bit integer on the wire
pub const INT32_SIZE: usize = 4;

/// Size of a 64 bit integer on the wire
pub const INT64_SIZE: usize = 8;

/// First version of the binary protocol (no flags)
pub const PROTO_STREAM_V1: u64 = 1;

/// Second version of the binary protocol (adds a flags field)
pub const PROTO_STREAM_V2: u64 = 2;

/// Version, part size and padding size
pub const V1_PART_HEADER_SIZE: usize = INT64_SIZE * 3;

/// Version 1 fields plus one flag byte and seven reserved zero bytes
pub const V2_PART_HEADER_SIZE: usize = INT64_SIZE * 4;

/// Each record inside a part body is prefixed by its length
pub const RECORD_HEADER_SIZE: usize = INT32_SIZE;

/// Maximum serialized size of a single event envelope
pub const MAX_PROTO_MESSAGE_SIZE_BYTES: usize = 64 * 1024;

/// Minimum size of a non-final part accepted by S3-compatible multipart uploads
pub const MIN_UPLOAD_PART_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Default number of parts a single stream uploads concurrently
pub const CONCURRENT_UPLOADS_PER_STREAM: usize = 1;

/// Upper bound on loop iterations before a cancellation checkpoint, and on
/// upload attempts for a single part
pub const MAX_ITERATION_LIMIT: usize = 1000;

/// Bit flags recorded in version 2 part headers
pub type ProtoStreamFlag = u8;

/// The part body was encrypted after compression
pub const PROTO_STREAM_FLAG_ENCRYPTED: ProtoStreamFlag = 1;

/// Structured form of the binary header prepended to every part.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartHeader {
    /// Protocol version, 1 or 2
    pub protocol_version: u64,

    /// Meaningful size of the part body in bytes
    pub part_size: u64,

    /// Zero padding appended after the body
    pub padding_size: u64,

    /// Recording options (version 2 only)
    pub flags: ProtoStreamFlag,
}

impl PartHeader {
    /// Header for an unencrypted part.
    pub fn v1(part_size: u64, padding_size: u64) -> Self {
        Self {
            protocol_version: PROTO_STREAM_V1,
            part_size,
            padding_size,
            flags: 0,
        }
    }

    /// Header carrying recording flags.
    pub fn v2(part_size: u64, padding_size: u64, flags: ProtoStreamFlag) -> Self {
        Self {
            protocol_version: PROTO_STREAM_V2,
            part_size,
            padding_size,
            flags,
        }
    }

    /// Header size on the wire for a given protocol version.
    pub fn size_for(encrypted: bool) -> usize {
        if encrypted {
            V2_PART_HEADER_SIZE
        } else {
            V1_PART_HEADER_SIZE
        }
    }

    /// Number of bytes `encode` produces for this header.
    pub fn encoded_len(&self) -> usize {
        if self.protocol_version == PROTO_STREAM_V1 {
            V1_PART_HEADER_SIZE
        } else {
            V2_PART_HEADER_SIZE
        }
    }

    /// Whether the part body has to be decrypted before decompression.
    pub fn is_encrypted(&self) -> bool {
        self.flags & PROTO_STREAM_FLAG_ENCRYPTED != 0
    }

    /// Serialize the header. Version 1 headers are 24 bytes, anything else is
    /// written in the 32 byte version 2 layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(V2_PART_HEADER_SIZE);
        self.encode_to(&mut buf);
        buf
    }

    /// Serialize the header into `buf`.
    pub fn encode_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.protocol_version);
        buf.put_u64(self.part_size);
        buf.put_u64(self.padding_size);
        if self.protocol_version == PROTO_STREAM_V1 {
            return;
        }
        buf.put_u8(self.flags);
        buf.put_bytes(0, INT64_SIZE - 1);
    }

    /// Parse a header from `reader`.
    ///
    /// # Errors
    ///
    /// - `EndOfStream`: the reader was already exhausted
    /// - `UnsupportedVersion`: version is not 1 or 2
    /// - `Io` (`UnexpectedEof`): input ended inside the header
    pub fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut field = [0u8; INT64_SIZE];

        let read = read_full(reader, &mut field)?;
        if read == 0 {
            return Err(Error::EndOfStream);
        }
        if read < INT64_SIZE {
            return Err(truncated("protocol version", read));
        }

        let protocol_version = u64::from_be_bytes(field);
        if protocol_version != PROTO_STREAM_V1 && protocol_version != PROTO_STREAM_V2 {
            return Err(Error::UnsupportedVersion(protocol_version));
        }

        read_field(reader, &mut field, "part size")?;
        let part_size = u64::from_be_bytes(field);

        read_field(reader, &mut field, "padding size")?;
        let padding_size = u64::from_be_bytes(field);

        if protocol_version == PROTO_STREAM_V1 {
            return Ok(Self::v1(part_size, padding_size));
        }

        read_field(reader, &mut field, "flags")?;
        Ok(Self::v2(part_size, padding_size, field[0]))
    }
}

/// Read until `buf` is full or the reader is exhausted, returning the number
/// of bytes read. Unlike `read_exact` a short read is not an error, which lets
/// callers tell "nothing left" apart from "cut off halfway".
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_field<R: Read + ?Sized>(
    reader: &mut R,
    field: &mut [u8; INT64_SIZE],
    name: &str,
) -> Result<()> {
    let read = read_full(reader, field)?;
    if read < INT64_SIZE {
        return Err(truncated(name, read));
    }
    Ok(())
}

fn truncated(field: &str, read: usize) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!(
            "part header truncated in {field}: got {read} of {INT64_SIZE} bytes"
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_v1_header_layout() {
        let header = PartHeader::v1(1000, 24);
        let bytes = header.encode();

        assert_eq!(bytes.len(), V1_PART_HEADER_SIZE);
        assert_eq!(&bytes[0..8], &1u64.to_be_bytes());
        assert_eq!(&bytes[8..16], &1000u64.to_be_bytes());
        assert_eq!(&bytes[16..24], &24u64.to_be_bytes());
    }

    #[test]
    fn test_v2_header_layout() {
        let header = PartHeader::v2(42, 7, PROTO_STREAM_FLAG_ENCRYPTED);
        let bytes = header.encode();

        assert_eq!(bytes.len(), V2_PART_HEADER_SIZE);
        assert_eq!(&bytes[0..8], &2u64.to_be_bytes());
        assert_eq!(bytes[24], PROTO_STREAM_FLAG_ENCRYPTED);
        assert!(bytes[25..].iter().all(|b| *b == 0));
        assert_eq!(header.encoded_len(), V2_PART_HEADER_SIZE);
    }

    #[test]
    fn test_decode_matches_encode() {
        for header in [
            PartHeader::v1(5 * 1024 * 1024, 0),
            PartHeader::v2(17, 3, PROTO_STREAM_FLAG_ENCRYPTED),
        ] {
            let mut cursor = Cursor::new(header.encode());
            assert_eq!(PartHeader::decode(&mut cursor).unwrap(), header);
            assert_eq!(cursor.position() as usize, header.encoded_len());
        }
    }

    #[test]
    fn test_decode_empty_input_is_end_of_stream() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let err = PartHeader::decode(&mut cursor).unwrap_err();
        assert!(err.is_end_of_stream());
    }

    #[test]
    fn test_decode_partial_version_is_corruption() {
        let mut cursor = Cursor::new(vec![0u8, 0, 0]);
        match PartHeader::decode(&mut cursor) {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected truncation error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_truncated_after_version() {
        let mut bytes = PartHeader::v1(10, 0).encode();
        bytes.truncate(12);
        let err = PartHeader::decode(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(!err.is_end_of_stream());
    }

    #[test]
    fn test_decode_v2_missing_flags() {
        let mut bytes = PartHeader::v2(10, 0, 1).encode();
        bytes.truncate(V1_PART_HEADER_SIZE);
        assert!(matches!(
            PartHeader::decode(&mut Cursor::new(bytes)),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_versions() {
        for version in [0u64, 3, u64::MAX] {
            let mut bytes = version.to_be_bytes().to_vec();
            bytes.extend_from_slice(&[0u8; 16]);
            match PartHeader::decode(&mut Cursor::new(bytes)) {
                Err(Error::UnsupportedVersion(v)) => assert_eq!(v, version),
                other => panic!("expected unsupported version, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_encrypted_flag() {
        assert!(!PartHeader::v1(1, 0).is_encrypted());
        assert!(!PartHeader::v2(1, 0, 0).is_encrypted());
        assert!(PartHeader::v2(1, 0, PROTO_STREAM_FLAG_ENCRYPTED).is_encrypted());
        assert_eq!(PartHeader::size_for(true), 32);
        assert_eq!(PartHeader::size_for(false), 24);
    }
}
