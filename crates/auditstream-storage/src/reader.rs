//! Proto Reader - Replaying a Recording
//!
//! `ProtoReader` turns the concatenated parts of a recording back into the
//! ordered sequence of session events.
//!
//! ## State Machine
//!
//! ```text
//!        ┌───────────── end of part (padding skipped) ─────────────┐
//!        ▼                                                          │
//!     ┌──────┐  header parsed   ┌─────────┐  record decoded ┌──────┴──┐
//!     │ Init │ ───────────────► │ Current │ ──────────────► │ (event) │
//!     └──┬───┘                  └────┬────┘                 └─────────┘
//!        │ no bytes left             │ corrupt input
//!        ▼                           ▼
//!     ┌──────┐                   ┌───────┐
//!     │ Eof  │                   │ Error │  (sticky)
//!     └──────┘                   └───────┘
//! ```
//!
//! ## Duplicates and Ordering
//!
//! A resumed or retried recording may contain an event more than once. Events
//! whose index is not greater than the last returned index are counted as
//! skipped and not returned. Events that jump ahead are returned but counted
//! as out of order. `reset` switches to a new source while keeping the last
//! index and the counters, so duplicates are detected across sources too.
//!
//! ## Legacy Padding
//!
//! Older writers could leave padding bytes inside the compressed section of a
//! part. Anything left in a part body after the gzip stream ended is discarded
//! and logged instead of failing the read.

use flate2::bufread::GzDecoder;
use serde::{Deserialize, Serialize};
use std::io::{self, BufReader, Cursor, Read};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use auditstream_core::part::{
    read_full, PartHeader, MAX_ITERATION_LIMIT, MAX_PROTO_MESSAGE_SIZE_BYTES, RECORD_HEADER_SIZE,
};
use auditstream_core::SessionEvent;

use crate::crypto::DecryptionWrapper;
use crate::error::{Error, Result};

type PartBody = GzDecoder<BufReader<Box<dyn Read + Send>>>;

/// Counters collected while reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProtoReaderStats {
    /// Events seen again or behind the last returned index
    pub skipped_events: u64,

    /// Events returned whose index did not follow the previous one
    pub out_of_order_events: u64,

    /// Every decoded event, duplicates included
    pub total_events: u64,
}

impl ProtoReaderStats {
    /// Emit the counters as structured fields.
    pub fn log(&self) {
        tracing::debug!(
            skipped_events = self.skipped_events,
            out_of_order_events = self.out_of_order_events,
            total_events = self.total_events,
            "Proto reader stats"
        );
    }
}

/// A part whose body ended before its declared size.
#[derive(Debug, Clone, Copy)]
struct Truncated {
    expected: u64,
    got: u64,
}

impl Truncated {
    fn error(&self) -> Error {
        Error::BadParameter(format!(
            "data truncated, expected part of {} bytes, but got {}",
            self.expected, self.got
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Current,
    Eof,
    Error,
}

/// Decoder for a sequence of recorded parts.
pub struct ProtoReader<R> {
    source: R,
    state: State,
    body: Option<PartBody>,
    padding: u64,
    truncated: Option<Truncated>,
    last_index: i64,
    stats: ProtoReaderStats,
    error: Option<Arc<Error>>,
    decrypter: Option<Arc<dyn DecryptionWrapper>>,
    cancel: Option<CancellationToken>,
    max_message_size: usize,
    message: Vec<u8>,
}

impl<R: Read> ProtoReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            state: State::Init,
            body: None,
            padding: 0,
            truncated: None,
            last_index: -1,
            stats: ProtoReaderStats::default(),
            error: None,
            decrypter: None,
            cancel: None,
            max_message_size: MAX_PROTO_MESSAGE_SIZE_BYTES,
            message: Vec::new(),
        }
    }

    /// Decrypt parts flagged as encrypted with `decrypter`.
    pub fn with_decrypter(mut self, decrypter: Arc<dyn DecryptionWrapper>) -> Self {
        self.decrypter = Some(decrypter);
        self
    }

    /// Stop reading once `token` is cancelled. The token is checked every
    /// `MAX_ITERATION_LIMIT` loop iterations.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Accept records up to `max_message_size` bytes.
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn stats(&self) -> ProtoReaderStats {
        self.stats
    }

    /// Release the decompressor of the current part.
    pub fn close(&mut self) {
        self.body = None;
    }

    /// Continue reading from `source`, keeping the last index and counters.
    ///
    /// # Errors
    ///
    /// The sticky error if the reader already failed.
    pub fn reset(&mut self, source: R) -> Result<()> {
        if let Some(err) = &self.error {
            return Err(Error::Shared(err.clone()));
        }
        self.body = None;
        self.padding = 0;
        self.truncated = None;
        self.source = source;
        self.state = State::Init;
        Ok(())
    }

    fn fail(&mut self, err: Error) -> Error {
        let err = Arc::new(err);
        self.state = State::Error;
        self.error = Some(err.clone());
        self.body = None;
        Error::Shared(err)
    }

    /// Fail on a read error from the part body. Errors of a truncated part
    /// are reported as the truncation.
    fn fail_body(&mut self, err: io::Error) -> Error {
        match self.truncated {
            Some(truncated) => self.fail(truncated.error()),
            None => self.fail(err.into()),
        }
    }

    fn sticky_error(&self) -> Error {
        match &self.error {
            Some(err) => Error::Shared(err.clone()),
            None => Error::BadParameter("reader is in the error state".into()),
        }
    }

    /// Read all remaining events.
    pub fn read_all(&mut self) -> Result<Vec<SessionEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.read()? {
            events.push(event);
        }
        self.stats.log();
        Ok(events)
    }

    /// Next event, or `None` once every part has been read.
    ///
    /// # Errors
    ///
    /// - Corrupt or truncated input. The reader stays in the error state and
    ///   returns the same error on every following call.
    /// - `Canceled` if the cancellation token fired
    /// - `Core` (decode) if a record is not a valid event envelope. The record
    ///   is consumed and reading can continue.
    pub fn read(&mut self) -> Result<Option<SessionEvent>> {
        let mut iteration = 0usize;
        loop {
            iteration += 1;
            if iteration % MAX_ITERATION_LIMIT == 0 {
                if let Some(token) = &self.cancel {
                    if token.is_cancelled() {
                        return Err(Error::Canceled);
                    }
                }
            }

            match self.state {
                State::Eof => return Ok(None),
                State::Error => return Err(self.sticky_error()),
                State::Init => self.open_part()?,
                State::Current => {
                    if let Some(event) = self.next_record()? {
                        return Ok(Some(event));
                    }
                }
            }
        }
    }

    /// Parse the next part header and set up decryption and decompression.
    fn open_part(&mut self) -> Result<()> {
        let header = match PartHeader::decode(&mut self.source) {
            Ok(header) => header,
            Err(e) if e.is_end_of_stream() => {
                self.state = State::Eof;
                return Ok(());
            }
            Err(e) => return Err(self.fail(e.into())),
        };

        let mut body = Vec::new();
        let read = match (&mut self.source)
            .take(header.part_size)
            .read_to_end(&mut body)
        {
            Ok(read) => read as u64,
            Err(e) => return Err(self.fail(e.into())),
        };
        // A short body still yields its intact records; the truncation is
        // reported once decoding runs into the missing bytes.
        self.truncated = (read != header.part_size).then_some(Truncated {
            expected: header.part_size,
            got: read,
        });

        let mut reader: Box<dyn Read + Send> = Box::new(Cursor::new(body));
        if header.is_encrypted() {
            let Some(decrypter) = self.decrypter.clone() else {
                return Err(self.fail(Error::Decryption(
                    "reading encrypted protos without decrypter".into(),
                )));
            };
            reader = match decrypter.with_decryption(reader) {
                Ok(reader) => reader,
                Err(e) => return Err(self.fail(e)),
            };
        }

        self.padding = header.padding_size;
        self.body = Some(GzDecoder::new(BufReader::new(reader)));
        self.state = State::Current;
        Ok(())
    }

    /// Decode one record of the current part. `None` means the part ended, or
    /// the record was a duplicate and the caller should keep reading.
    fn next_record(&mut self) -> Result<Option<SessionEvent>> {
        let Some(body) = self.body.as_mut() else {
            return Err(self.fail(Error::BadParameter("no part is open".into())));
        };

        let mut size = [0u8; RECORD_HEADER_SIZE];
        let read = match read_full(body, &mut size) {
            Ok(read) => read,
            Err(e) => return Err(self.fail_body(e)),
        };
        if read == 0 {
            self.finish_part()?;
            return Ok(None);
        }
        if read < RECORD_HEADER_SIZE {
            return Err(self.fail_body(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "record length truncated",
            )));
        }

        let size = u32::from_be_bytes(size) as usize;
        if size == 0 {
            return Err(self.fail(Error::BadParameter("unexpected message size 0".into())));
        }
        if size > self.max_message_size {
            return Err(self.fail(Error::BadParameter(format!(
                "message size {size} exceeds limit of {} bytes",
                self.max_message_size
            ))));
        }

        self.message.resize(size, 0);
        if let Err(e) = body.read_exact(&mut self.message) {
            return Err(self.fail_body(e));
        }
        let event = SessionEvent::decode_record(&self.message)?;

        self.stats.total_events += 1;
        let index = event.index();
        if index <= self.last_index {
            self.stats.skipped_events += 1;
            return Ok(None);
        }
        if self.last_index > 0 && index != self.last_index + 1 {
            self.stats.out_of_order_events += 1;
        }
        self.last_index = index;
        Ok(Some(event))
    }

    /// Discard what is left of the part body, skip its padding and go back to
    /// reading headers.
    fn finish_part(&mut self) -> Result<()> {
        if let Some(truncated) = self.truncated {
            return Err(self.fail(truncated.error()));
        }
        if let Some(body) = self.body.take() {
            let mut rest = body.into_inner();
            match io::copy(&mut rest, &mut io::sink()) {
                Ok(0) => {}
                Ok(dangling) => tracing::debug!(
                    length = dangling,
                    "Skipped dangling data in session recording section"
                ),
                Err(e) => return Err(self.fail(e.into())),
            }
        }

        if self.padding > 0 {
            let skipped = match io::copy(&mut (&mut self.source).take(self.padding), &mut io::sink())
            {
                Ok(skipped) => skipped,
                Err(e) => return Err(self.fail(e.into())),
            };
            if skipped != self.padding {
                return Err(self.fail(Error::BadParameter(format!(
                    "data truncated, expected to read {} bytes, but got {skipped}",
                    self.padding
                ))));
            }
        }

        self.padding = 0;
        self.truncated = None;
        self.state = State::Init;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testing::XorCipher;
    use crate::crypto::{Encryption, EncryptionWrapper};
    use crate::pool::PooledBuffer;
    use crate::testing::{noise, print_event, session_end};
    use auditstream_core::part::PROTO_STREAM_FLAG_ENCRYPTED;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    /// Build a part by hand: header, gzip(records) + `dangling`, `padding` zeros.
    fn part(events: &[SessionEvent], dangling: &[u8], padding: usize) -> Vec<u8> {
        let mut records = Vec::new();
        for event in events {
            records.extend_from_slice(&(event.size() as u32).to_be_bytes());
            event.encode_envelope(&mut records);
        }
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&records).unwrap();
        let mut body = gz.finish().unwrap();
        body.extend_from_slice(dangling);

        let mut out = PartHeader::v1(body.len() as u64, padding as u64).encode();
        out.extend_from_slice(&body);
        out.extend(std::iter::repeat(0u8).take(padding));
        out
    }

    fn indexes(events: &[SessionEvent]) -> Vec<i64> {
        events.iter().map(|e| e.index()).collect()
    }

    #[test]
    fn test_reads_events_across_parts() {
        let mut data = part(&[print_event(0, b"a"), print_event(1, b"b")], &[], 100);
        data.extend(part(&[print_event(2, b"c"), session_end(3)], &[], 0));

        let mut reader = ProtoReader::new(Cursor::new(data));
        let events = reader.read_all().unwrap();
        assert_eq!(indexes(&events), vec![0, 1, 2, 3]);
        assert_eq!(
            reader.stats(),
            ProtoReaderStats {
                skipped_events: 0,
                out_of_order_events: 0,
                total_events: 4,
            }
        );
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn test_empty_source_is_eof() {
        let mut reader = ProtoReader::new(Cursor::new(Vec::new()));
        assert!(reader.read().unwrap().is_none());
        assert!(reader.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_index_is_skipped() {
        let data = part(
            &[print_event(1, b"a"), print_event(1, b"a"), print_event(2, b"b")],
            &[],
            0,
        );
        let mut reader = ProtoReader::new(Cursor::new(data));
        let events = reader.read_all().unwrap();
        assert_eq!(indexes(&events), vec![1, 2]);
        assert_eq!(reader.stats().skipped_events, 1);
        assert_eq!(reader.stats().total_events, 3);
    }

    #[test]
    fn test_gap_is_counted_out_of_order() {
        let data = part(
            &[print_event(1, b"a"), print_event(2, b"b"), print_event(5, b"c")],
            &[],
            0,
        );
        let mut reader = ProtoReader::new(Cursor::new(data));
        assert_eq!(indexes(&reader.read_all().unwrap()), vec![1, 2, 5]);
        assert_eq!(reader.stats().out_of_order_events, 1);
    }

    #[test]
    fn test_dangling_bytes_are_tolerated() {
        let mut data = part(&[print_event(0, b"a")], &[0u8; 37], 10);
        data.extend(part(&[print_event(1, b"b")], &[], 0));

        let mut reader = ProtoReader::new(Cursor::new(data));
        assert_eq!(indexes(&reader.read_all().unwrap()), vec![0, 1]);
    }

    #[test]
    fn test_truncated_padding_is_fatal_and_sticky() {
        let mut data = part(&[print_event(0, b"a")], &[], 64);
        data.truncate(data.len() - 10);

        let mut reader = ProtoReader::new(Cursor::new(data));
        assert_eq!(reader.read().unwrap().unwrap().index(), 0);
        let first = reader.read().unwrap_err();
        assert!(first.to_string().contains("data truncated"));

        let second = reader.read().unwrap_err();
        assert_eq!(first.to_string(), second.to_string());
        assert!(reader.reset(Cursor::new(Vec::new())).is_err());
    }

    #[test]
    fn test_truncated_body_returns_intact_records_first() {
        let events: Vec<SessionEvent> = (0..20)
            .map(|i| print_event(i, &noise(64, i as u64)))
            .collect();
        let mut data = part(&events, &[], 0);
        data.truncate(data.len() - 10);

        let mut reader = ProtoReader::new(Cursor::new(data));
        let mut read = Vec::new();
        let err = loop {
            match reader.read() {
                Ok(Some(event)) => read.push(event),
                Ok(None) => panic!("truncated part read to the end"),
                Err(e) => break e,
            }
        };

        assert!(!read.is_empty());
        assert_eq!(indexes(&read), (0..read.len() as i64).collect::<Vec<_>>());
        assert!(err.to_string().contains("data truncated, expected part of"));
        assert_eq!(reader.read().unwrap_err().to_string(), err.to_string());
    }

    #[test]
    fn test_truncated_header_is_fatal() {
        let data = part(&[print_event(0, b"a")], &[], 0);
        let mut reader = ProtoReader::new(Cursor::new(data[..12].to_vec()));
        assert!(reader.read().is_err());
        assert!(reader.read().is_err());
    }

    #[test]
    fn test_unsupported_version_is_fatal() {
        let mut data = 9u64.to_be_bytes().to_vec();
        data.extend_from_slice(&[0u8; 16]);
        let mut reader = ProtoReader::new(Cursor::new(data));
        let err = reader.read().unwrap_err();
        assert!(err.to_string().contains("unsupported protocol version 9"));
    }

    #[test]
    fn test_zero_length_record_is_fatal() {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&[0u8; 4]).unwrap();
        let body = gz.finish().unwrap();
        let mut data = PartHeader::v1(body.len() as u64, 0).encode();
        data.extend_from_slice(&body);

        let mut reader = ProtoReader::new(Cursor::new(data));
        let err = reader.read().unwrap_err();
        assert!(err.to_string().contains("unexpected message size 0"));
    }

    #[test]
    fn test_reset_keeps_stats_and_last_index() {
        let first = part(&[print_event(0, b"a"), print_event(1, b"b")], &[], 0);
        let second = part(&[print_event(1, b"b"), print_event(2, b"c")], &[], 0);

        let mut reader = ProtoReader::new(Cursor::new(first));
        assert_eq!(reader.read_all().unwrap().len(), 2);
        reader.reset(Cursor::new(second)).unwrap();
        assert_eq!(indexes(&reader.read_all().unwrap()), vec![2]);
        assert_eq!(reader.stats().skipped_events, 1);
        assert_eq!(reader.stats().total_events, 4);
    }

    #[test]
    fn test_close_mid_part_then_reset() {
        let first = part(
            &[print_event(0, b"a"), print_event(1, b"b"), print_event(2, b"c")],
            &[],
            0,
        );
        let second = part(
            &[print_event(1, b"b"), print_event(2, b"c"), print_event(3, b"d")],
            &[],
            0,
        );

        let mut reader = ProtoReader::new(Cursor::new(first));
        assert_eq!(reader.read().unwrap().unwrap().index(), 0);
        reader.close();
        assert!(reader.body.is_none());

        reader.reset(Cursor::new(second)).unwrap();
        assert_eq!(indexes(&reader.read_all().unwrap()), vec![1, 2, 3]);
        assert_eq!(reader.stats().total_events, 4);
        assert_eq!(reader.stats().skipped_events, 0);
    }

    #[test]
    fn test_encrypted_part_without_decrypter() {
        let body = vec![1u8, 2, 3];
        let mut data = PartHeader::v2(3, 0, PROTO_STREAM_FLAG_ENCRYPTED).encode();
        data.extend_from_slice(&body);

        let mut reader = ProtoReader::new(Cursor::new(data));
        let err = reader.read().unwrap_err();
        assert!(err.to_string().contains("without decrypter"));
    }

    #[test]
    fn test_encrypted_part_round_trip() {
        let cipher = XorCipher(0x17);
        let Encryption::Enabled(sink) = cipher
            .with_encryption(Box::new(PooledBuffer::detached(Vec::new())))
            .unwrap()
        else {
            panic!("expected encryption to be enabled");
        };
        let mut gz = GzEncoder::new(sink, Compression::default());
        let event = print_event(0, b"whoami");
        gz.write_all(&(event.size() as u32).to_be_bytes()).unwrap();
        let mut payload = Vec::new();
        event.encode_envelope(&mut payload);
        gz.write_all(&payload).unwrap();
        let body = gz.finish().unwrap().finish().unwrap();

        let mut data = PartHeader::v2(body.len() as u64, 0, PROTO_STREAM_FLAG_ENCRYPTED).encode();
        data.extend_from_slice(&body);

        let mut reader =
            ProtoReader::new(Cursor::new(data)).with_decrypter(Arc::new(XorCipher(0x17)));
        assert_eq!(reader.read_all().unwrap(), vec![event]);
    }

    #[test]
    fn test_cancellation_checkpoint() {
        let events: Vec<SessionEvent> = (0..10).map(|_| print_event(0, b"dup")).collect();
        let mut data = Vec::new();
        for _ in 0..200 {
            data.extend(part(&events, &[], 0));
        }

        let token = CancellationToken::new();
        token.cancel();
        let mut reader = ProtoReader::new(Cursor::new(data)).with_cancellation(token);
        // The first event is returned before the first checkpoint
        assert_eq!(reader.read().unwrap().unwrap().index(), 0);
        assert!(reader.read().unwrap_err().is_canceled());
    }

    #[test]
    fn test_stats_serialize_as_fields() {
        let stats = ProtoReaderStats {
            skipped_events: 1,
            out_of_order_events: 2,
            total_events: 3,
        };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["skipped-events"], 1);
        assert_eq!(json["out-of-order-events"], 2);
        assert_eq!(json["total-events"], 3);
    }
}
