//! AuditStream Core
//!
//! Wire-level building blocks shared by the recording (write) and replay (read)
//! sides of the audit stream pipeline.
//!
//! ## What Lives Here?
//!
//! 1. **Part format** (`part`): the fixed-layout binary header that prefixes every
//!    uploaded part, plus the protocol constants (header sizes, record framing,
//!    minimum part size)
//! 2. **Event envelope** (`event`): the protobuf `OneOf` envelope that every
//!    session event is serialized into before it is framed and compressed
//! 3. **Errors** (`error`): decode/encode failures of the above
//!
//! ## Part Layout
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ PartHeader (24 bytes v1 / 32 bytes v2)     │
//! ├────────────────────────────────────────────┤
//! │ Body (part_size bytes)                     │
//! │   gzip( [u32 BE len][OneOf bytes] ... )    │
//! │   optionally encrypted after compression   │
//! ├────────────────────────────────────────────┤
//! │ Padding (padding_size zero bytes)          │
//! └────────────────────────────────────────────┘
//! ```
//!
//! This crate has no async runtime dependency. The pipeline itself lives in
//! `auditstream-storage`.

pub mod error;
pub mod event;
pub mod part;

pub use error::{Error, Result};
pub use event::{EventMetadata, OneOf, PreparedSessionEvent, SessionEvent};
pub use part::PartHeader;
