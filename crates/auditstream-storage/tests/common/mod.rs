//! Shared helpers for the storage integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use auditstream_core::event::{
    DatabaseSessionEnd, EventMetadata, SessionEnd, SessionMetadata, SessionPrint,
};
use auditstream_core::SessionEvent;
use auditstream_storage::{
    DecryptionWrapper, Encryption, EncryptionWrapper, MemoryUploader, PartSink, PooledBuffer,
    Result, RetryConfig, SessionSummarizer, Streamer, StreamerConfig,
};

pub const SESSION_ID: &str = "session-1";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small parts and fast retries.
pub fn test_config(min_upload_bytes: usize) -> StreamerConfig {
    StreamerConfig {
        min_upload_bytes,
        concurrent_uploads: 1,
        retry: RetryConfig {
            step: Duration::from_millis(10),
            max: Duration::from_millis(50),
            max_attempts: 3,
        },
        ..Default::default()
    }
}

pub fn streamer(config: StreamerConfig) -> (Arc<MemoryUploader>, Streamer) {
    init_tracing();
    let uploader = Arc::new(MemoryUploader::new());
    let streamer = Streamer::new(config, uploader.clone()).unwrap();
    (uploader, streamer)
}

/// Deterministic bytes that gzip cannot shrink.
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
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
        id: format!("event-{index}"),
        ..Default::default()
    })
}

fn session() -> Option<SessionMetadata> {
    Some(SessionMetadata {
        session_id: SESSION_ID.to_string(),
        cluster_name: "root".to_string(),
    })
}

pub fn print_event(index: i64, data: &[u8]) -> SessionEvent {
    SessionEvent::SessionPrint(SessionPrint {
        metadata: metadata(index, "print"),
        chunk_index: index,
        data: data.to_vec(),
        ..Default::default()
    })
}

pub fn session_end(index: i64) -> SessionEvent {
    SessionEvent::SessionEnd(SessionEnd {
        metadata: metadata(index, "session.end"),
        session: session(),
        user: "alice".to_string(),
        participants: vec!["alice".to_string()],
        interactive: true,
        ..Default::default()
    })
}

pub fn database_session_end(index: i64) -> SessionEvent {
    SessionEvent::DatabaseSessionEnd(DatabaseSessionEnd {
        metadata: metadata(index, "db.session.end"),
        session: session(),
        user: "alice".to_string(),
        database_service: "postgres".to_string(),
        database_name: "orders".to_string(),
        ..Default::default()
    })
}

pub fn indexes(events: &[SessionEvent]) -> Vec<i64> {
    events.iter().map(SessionEvent::index).collect()
}

/// XOR "cipher" applied after compression.
pub struct XorCipher(pub u8);

struct XorSink {
    inner: Box<dyn PartSink>,
    key: u8,
}

impl Write for XorSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let masked: Vec<u8> = data.iter().map(|b| b ^ self.key).collect();
        self.inner.write_all(&masked)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl PartSink for XorSink {
    fn buffered_len(&self) -> usize {
        self.inner.buffered_len()
    }

    fn finish(self: Box<Self>) -> io::Result<PooledBuffer> {
        self.inner.finish()
    }
}

struct XorSource {
    inner: Box<dyn Read + Send>,
    key: u8,
}

impl Read for XorSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        buf[..n].iter_mut().for_each(|b| *b ^= self.key);
        Ok(n)
    }
}

impl EncryptionWrapper for XorCipher {
    fn with_encryption(&self, sink: Box<dyn PartSink>) -> Result<Encryption> {
        Ok(Encryption::Enabled(Box::new(XorSink {
            inner: sink,
            key: self.0,
        })))
    }
}

impl DecryptionWrapper for XorCipher {
    fn with_decryption(&self, source: Box<dyn Read + Send>) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(XorSource {
            inner: source,
            key: self.0,
        }))
    }
}

/// Summarizer that remembers which method was called.
#[derive(Default)]
pub struct RecordingSummarizer {
    calls: Mutex<Vec<String>>,
}

impl RecordingSummarizer {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl SessionSummarizer for RecordingSummarizer {
    async fn summarize_ssh(&self, event: &SessionEnd) -> Result<()> {
        self.push(format!("ssh:{}", event.user));
        Ok(())
    }

    async fn summarize_database(&self, event: &DatabaseSessionEnd) -> Result<()> {
        self.push(format!("database:{}", event.database_name));
        Ok(())
    }

    async fn summarize_without_end_event(&self, session_id: &str) -> Result<()> {
        self.push(format!("none:{session_id}"));
        Ok(())
    }
}
