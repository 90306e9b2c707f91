//! Session Event Envelope
//!
//! Session events are serialized as protobuf messages wrapped in a single
//! `OneOf` envelope, so a reader can decode any record without knowing its
//! type in advance.
//!
//! ## Record Framing
//!
//! Inside a decompressed part body every event is framed as:
//!
//! ```text
//! ┌────────────────────┬──────────────────────────────┐
//! │ length (u32, BE)   │ OneOf envelope (length bytes)│
//! └────────────────────┴──────────────────────────────┘
//! ```
//!
//! A length of zero is never written.
//!
//! ## Event Types
//!
//! | tag | event                  | notes                                   |
//! |-----|------------------------|-----------------------------------------|
//! | 1   | `SessionStart`         | interactive or exec session started     |
//! | 2   | `SessionPrint`         | chunk of terminal output                |
//! | 3   | `SessionCommand`       | command executed in the session         |
//! | 4   | `SessionEnd`           | SSH session ended, triggers summary     |
//! | 5   | `DatabaseSessionQuery` | query issued in a database session      |
//! | 6   | `DatabaseSessionEnd`   | database session ended, triggers summary|
//!
//! Every event carries `EventMetadata` whose `index` orders events within one
//! session. The index is assigned by the producer before the event reaches the
//! stream.

use bytes::BufMut;
use prost::Message;

use crate::{Error, Result};

/// Fields common to every session event.
#[derive(Clone, PartialEq, Message)]
pub struct EventMetadata {
    /// Position of the event within its session, starting at 0
    #[prost(int64, tag = "1")]
    pub index: i64,

    #[prost(string, tag = "2")]
    pub event_type: String,

    #[prost(string, tag = "3")]
    pub id: String,

    /// Milliseconds since Unix epoch
    #[prost(int64, tag = "4")]
    pub time_unix_ms: i64,

    #[prost(string, tag = "5")]
    pub code: String,
}

/// Identifies the session an event belongs to.
#[derive(Clone, PartialEq, Message)]
pub struct SessionMetadata {
    #[prost(string, tag = "1")]
    pub session_id: String,

    #[prost(string, tag = "2")]
    pub cluster_name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct SessionStart {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<EventMetadata>,

    #[prost(message, optional, tag = "2")]
    pub session: Option<SessionMetadata>,

    #[prost(string, tag = "3")]
    pub user: String,

    #[prost(string, tag = "4")]
    pub server_hostname: String,

    #[prost(string, repeated, tag = "5")]
    pub initial_command: Vec<String>,
}

/// A chunk of terminal output.
#[derive(Clone, PartialEq, Message)]
pub struct SessionPrint {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<EventMetadata>,

    #[prost(int64, tag = "2")]
    pub chunk_index: i64,

    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,

    /// Milliseconds since the session started
    #[prost(int64, tag = "4")]
    pub delay_ms: i64,

    /// Byte offset of this chunk in the session output
    #[prost(int64, tag = "5")]
    pub offset: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct SessionCommand {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<EventMetadata>,

    #[prost(message, optional, tag = "2")]
    pub session: Option<SessionMetadata>,

    #[prost(string, tag = "3")]
    pub program: String,

    #[prost(string, repeated, tag = "4")]
    pub argv: Vec<String>,

    #[prost(int32, tag = "5")]
    pub return_code: i32,
}

/// End of an SSH session.
#[derive(Clone, PartialEq, Message)]
pub struct SessionEnd {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<EventMetadata>,

    #[prost(message, optional, tag = "2")]
    pub session: Option<SessionMetadata>,

    #[prost(string, tag = "3")]
    pub user: String,

    #[prost(string, repeated, tag = "4")]
    pub participants: Vec<String>,

    #[prost(int64, tag = "5")]
    pub start_time_ms: i64,

    #[prost(int64, tag = "6")]
    pub end_time_ms: i64,

    #[prost(bool, tag = "7")]
    pub interactive: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct DatabaseSessionQuery {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<EventMetadata>,

    #[prost(message, optional, tag = "2")]
    pub session: Option<SessionMetadata>,

    #[prost(string, tag = "3")]
    pub database_name: String,

    #[prost(string, tag = "4")]
    pub query: String,

    #[prost(string, repeated, tag = "5")]
    pub query_args: Vec<String>,
}

/// End of a database session.
#[derive(Clone, PartialEq, Message)]
pub struct DatabaseSessionEnd {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<EventMetadata>,

    #[prost(message, optional, tag = "2")]
    pub session: Option<SessionMetadata>,

    #[prost(string, tag = "3")]
    pub user: String,

    #[prost(string, tag = "4")]
    pub database_service: String,

    #[prost(string, tag = "5")]
    pub database_name: String,

    #[prost(int64, tag = "6")]
    pub start_time_ms: i64,

    #[prost(int64, tag = "7")]
    pub end_time_ms: i64,
}

/// Envelope written for every record.
#[derive(Clone, PartialEq, Message)]
pub struct OneOf {
    #[prost(oneof = "one_of::Event", tags = "1, 2, 3, 4, 5, 6")]
    pub event: Option<one_of::Event>,
}

pub mod one_of {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Event {
        #[prost(message, tag = "1")]
        SessionStart(super::SessionStart),

        #[prost(message, tag = "2")]
        SessionPrint(super::SessionPrint),

        #[prost(message, tag = "3")]
        SessionCommand(super::SessionCommand),

        #[prost(message, tag = "4")]
        SessionEnd(super::SessionEnd),

        #[prost(message, tag = "5")]
        DatabaseSessionQuery(super::DatabaseSessionQuery),

        #[prost(message, tag = "6")]
        DatabaseSessionEnd(super::DatabaseSessionEnd),
    }
}

/// A decoded session event.
pub use one_of::Event as SessionEvent;

impl SessionEvent {
    fn metadata(&self) -> Option<&EventMetadata> {
        match self {
            SessionEvent::SessionStart(e) => e.metadata.as_ref(),
            SessionEvent::SessionPrint(e) => e.metadata.as_ref(),
            SessionEvent::SessionCommand(e) => e.metadata.as_ref(),
            SessionEvent::SessionEnd(e) => e.metadata.as_ref(),
            SessionEvent::DatabaseSessionQuery(e) => e.metadata.as_ref(),
            SessionEvent::DatabaseSessionEnd(e) => e.metadata.as_ref(),
        }
    }

    fn metadata_mut(&mut self) -> &mut EventMetadata {
        let metadata = match self {
            SessionEvent::SessionStart(e) => &mut e.metadata,
            SessionEvent::SessionPrint(e) => &mut e.metadata,
            SessionEvent::SessionCommand(e) => &mut e.metadata,
            SessionEvent::SessionEnd(e) => &mut e.metadata,
            SessionEvent::DatabaseSessionQuery(e) => &mut e.metadata,
            SessionEvent::DatabaseSessionEnd(e) => &mut e.metadata,
        };
        metadata.get_or_insert_with(EventMetadata::default)
    }

    /// Index of the event within its session (0 when unset).
    pub fn index(&self) -> i64 {
        self.metadata().map(|m| m.index).unwrap_or_default()
    }

    pub fn set_index(&mut self, index: i64) {
        self.metadata_mut().index = index;
    }

    /// Short type name, e.g. `"session.end"`.
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::SessionStart(_) => "session.start",
            SessionEvent::SessionPrint(_) => "print",
            SessionEvent::SessionCommand(_) => "session.command",
            SessionEvent::SessionEnd(_) => "session.end",
            SessionEvent::DatabaseSessionQuery(_) => "db.session.query",
            SessionEvent::DatabaseSessionEnd(_) => "db.session.end",
        }
    }

    /// Serialized size of the event wrapped in a `OneOf` envelope.
    pub fn size(&self) -> usize {
        self.encoded_len()
    }

    /// Serialize the event as a `OneOf` envelope without cloning it. A oneof
    /// field is encoded exactly like the envelope that contains it.
    pub fn encode_envelope<B: BufMut>(&self, buf: &mut B) {
        self.encode(buf);
    }

    /// Wrap the event in its envelope.
    pub fn to_one_of(&self) -> OneOf {
        OneOf {
            event: Some(self.clone()),
        }
    }

    /// Unwrap an envelope.
    ///
    /// # Errors
    ///
    /// `BadParameter` if the envelope carries no event (e.g. it was written by a
    /// newer version with an event type this build does not know).
    pub fn from_one_of(one_of: OneOf) -> Result<Self> {
        one_of
            .event
            .ok_or_else(|| Error::BadParameter("envelope does not contain a known event".into()))
    }

    /// Decode a record payload.
    pub fn decode_record(payload: &[u8]) -> Result<Self> {
        Self::from_one_of(OneOf::decode(payload)?)
    }

    /// Return a copy of the event whose serialized envelope fits in `max_size`
    /// bytes, shrinking the largest variable-size fields first.
    ///
    /// The result can still exceed `max_size` when the fixed-size fields alone
    /// are too large; callers must check `size()` afterwards.
    pub fn trim_to_max_size(&self, max_size: usize) -> SessionEvent {
        let mut trimmed = self.clone();
        while trimmed.size() > max_size {
            let excess = trimmed.size() - max_size;
            if !trimmed.shrink_largest_field(excess) {
                break;
            }
        }
        trimmed
    }

    fn shrink_largest_field(&mut self, excess: usize) -> bool {
        let mut fields = self.variable_fields();
        let Some(largest) = fields.iter_mut().max_by_key(|f| f.len()) else {
            return false;
        };
        if largest.len() == 0 {
            return false;
        }
        largest.truncate(largest.len().saturating_sub(excess));
        true
    }

    fn variable_fields(&mut self) -> Vec<Field<'_>> {
        match self {
            SessionEvent::SessionStart(e) => e
                .initial_command
                .iter_mut()
                .map(Field::Text)
                .chain([Field::Text(&mut e.server_hostname)])
                .collect(),
            SessionEvent::SessionPrint(e) => vec![Field::Bytes(&mut e.data)],
            SessionEvent::SessionCommand(e) => e
                .argv
                .iter_mut()
                .map(Field::Text)
                .chain([Field::Text(&mut e.program)])
                .collect(),
            SessionEvent::SessionEnd(e) => e.participants.iter_mut().map(Field::Text).collect(),
            SessionEvent::DatabaseSessionQuery(e) => e
                .query_args
                .iter_mut()
                .map(Field::Text)
                .chain([Field::Text(&mut e.query)])
                .collect(),
            SessionEvent::DatabaseSessionEnd(e) => vec![Field::Text(&mut e.database_name)],
        }
    }
}

/// A trimmable field borrowed out of an event.
enum Field<'a> {
    Text(&'a mut String),
    Bytes(&'a mut Vec<u8>),
}

impl Field<'_> {
    fn len(&self) -> usize {
        match self {
            Field::Text(s) => s.len(),
            Field::Bytes(b) => b.len(),
        }
    }

    fn truncate(&mut self, len: usize) {
        match self {
            Field::Text(s) => {
                let mut cut = len.min(s.len());
                while !s.is_char_boundary(cut) {
                    cut -= 1;
                }
                s.truncate(cut);
            }
            Field::Bytes(b) => b.truncate(len),
        }
    }
}

/// An event whose index has been assigned and which is ready to be recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSessionEvent {
    event: SessionEvent,
}

impl PreparedSessionEvent {
    pub fn new(event: SessionEvent) -> Self {
        Self { event }
    }

    pub fn event(&self) -> &SessionEvent {
        &self.event
    }

    pub fn into_event(self) -> SessionEvent {
        self.event
    }
}

impl From<SessionEvent> for PreparedSessionEvent {
    fn from(event: SessionEvent) -> Self {
        Self::new(event)
    }
}
