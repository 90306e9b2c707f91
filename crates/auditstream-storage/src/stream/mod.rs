//! Audit Stream - Producer Facade
//!
//! `AuditStream` is the handle producers use to record session events. It is
//! cheap to clone and safe to use from many tasks at once.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  record_event   ┌──────────────────────────────────────┐
//! │ producers  │ ──────────────► │ intake channel (capacity 1)          │
//! └────────────┘                 └──────────────────┬───────────────────┘
//!                                                   ▼
//!                                ┌──────────────────────────────────────┐
//!                                │ SliceWriter (one task per stream)    │
//!                                │ - appends to the current slice       │
//!                                │ - seals slices (size, idle, flush)   │
//!                                │ - completes the multipart upload     │
//!                                └───────┬──────────────────────┬───────┘
//!                                        │ spawn (≤ N at once)  │ status
//!                                        ▼                      ▼
//!                                ┌───────────────┐      ┌───────────────┐
//!                                │ upload tasks  │      │ watch channel │
//!                                └───────────────┘      └───────────────┘
//! ```
//!
//! ## Backpressure
//!
//! The intake channel holds a single event. A producer is suspended in
//! `record_event` while the event loop is busy, so a slow loop slows down
//! producers instead of buffering without bound.
//!
//! ## Stopping a Stream
//!
//! - `complete()`: upload everything, complete the multipart upload, summarize
//! - `close()`: upload everything but leave the upload open, so it can be
//!   resumed with `Streamer::resume_audit_stream`
//! - `cancel()`: stop immediately, abandoning buffered events
//!
//! All three are idempotent. Callers that need a deadline wrap the returned
//! futures in `tokio::time::timeout`; the stream keeps following its own state
//! regardless of how long the caller waits.

pub mod lifecycle;
pub(crate) mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use auditstream_core::PreparedSessionEvent;

use crate::error::{Error, Result};
use crate::uploader::StreamUpload;
use lifecycle::{CompletionMode, Done, Lifecycle, LifecycleHandle};

/// `record_event` calls slower than this are logged.
const SLOW_RECORD_THRESHOLD: Duration = Duration::from_millis(100);

/// Latest upload progress of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub upload_id: String,

    /// Highest event index contained in the most recently uploaded part, -1
    /// before the first part finished
    pub last_event_index: i64,

    pub last_upload_time: DateTime<Utc>,
}

/// State shared by every handle of a stream and its event loop.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) upload: StreamUpload,
    pub(crate) lifecycle: LifecycleHandle,
    max_message_size: usize,
    cancel_error: Mutex<Option<Arc<Error>>>,
    complete_result: Mutex<Option<std::result::Result<(), Arc<Error>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    pub(crate) fn new(upload: StreamUpload, max_message_size: usize) -> Self {
        Self {
            upload,
            lifecycle: LifecycleHandle::new(),
            max_message_size,
            cancel_error: Mutex::new(None),
            complete_result: Mutex::new(None),
        }
    }

    /// Stop the stream because of `err`. The first error wins.
    pub(crate) fn fail(&self, err: Error) {
        {
            let mut slot = lock(&self.cancel_error);
            if slot.is_none() {
                *slot = Some(Arc::new(err));
            }
        }
        self.lifecycle.cancel();
    }

    pub(crate) fn set_complete_result(&self, result: Result<()>) {
        *lock(&self.complete_result) = Some(result.map_err(Arc::new));
    }

    fn cancel_error(&self) -> Option<Arc<Error>> {
        lock(&self.cancel_error).clone()
    }

    /// Error returned to a producer whose event was not accepted.
    fn rejection(&self, state: Lifecycle) -> Error {
        match state {
            Lifecycle::Draining(_) => Error::connection_problem("emitter is completed"),
            _ => match self.cancel_error() {
                Some(err) => Error::Shared(err),
                None => Error::connection_problem("emitter has been closed"),
            },
        }
    }
}

/// Producer handle of one recording.
#[derive(Debug, Clone)]
pub struct AuditStream {
    shared: Arc<Shared>,
    events: mpsc::Sender<PreparedSessionEvent>,
    status: watch::Receiver<StreamStatus>,
}

impl AuditStream {
    pub(crate) fn new(
        shared: Arc<Shared>,
        events: mpsc::Sender<PreparedSessionEvent>,
        status: watch::Receiver<StreamStatus>,
    ) -> Self {
        Self {
            shared,
            events,
            status,
        }
    }

    /// The multipart upload this stream writes to.
    pub fn upload(&self) -> &StreamUpload {
        &self.shared.upload
    }

    /// Hand one event to the stream.
    ///
    /// Events larger than the configured maximum message size are trimmed
    /// first. The call waits until the event loop accepts the event.
    ///
    /// # Errors
    ///
    /// - `BadParameter`: the event is still too large after trimming
    /// - `ConnectionProblem` ("emitter is completed"): `complete` or `close`
    ///   was already called
    /// - The stream's terminal error, or `ConnectionProblem` ("emitter has been
    ///   closed") if the stream was cancelled without one
    pub async fn record_event(&self, event: impl Into<PreparedSessionEvent>) -> Result<()> {
        let mut event = event.into().into_event();
        let max = self.shared.max_message_size;
        if event.size() > max {
            event = event.trim_to_max_size(max);
            let size = event.size();
            if size > max {
                return Err(Error::BadParameter(format!(
                    "record size {size} exceeds max message size of {max} bytes"
                )));
            }
        }

        let start = Instant::now();
        let mut lifecycle = self.shared.lifecycle.subscribe();
        let result = tokio::select! {
            biased;

            state = lifecycle.wait_for(|state| !state.is_running()) => {
                let state = state.map(|s| *s).unwrap_or(Lifecycle::Terminated);
                Err(self.shared.rejection(state))
            }
            sent = self.events.send(PreparedSessionEvent::new(event)) => {
                sent.map_err(|_| self.shared.rejection(self.shared.lifecycle.current()))
            }
        };

        let elapsed = start.elapsed();
        if elapsed > SLOW_RECORD_THRESHOLD {
            tracing::debug!(
                upload = %self.shared.upload.id,
                duration_ms = elapsed.as_millis() as u64,
                "slow RecordEvent"
            );
        }
        result
    }

    /// Upload all buffered events and complete the multipart upload.
    ///
    /// Returns the outcome of completing the upload. If the stream stopped
    /// before it could complete, returns the error that stopped it. A stream
    /// that was closed first reports that it was closed without completing.
    pub async fn complete(&self) -> Result<()> {
        self.shared.lifecycle.complete(CompletionMode::Complete);
        self.wait_terminated().await;

        if let Some(result) = lock(&self.shared.complete_result).clone() {
            return result.map_err(Error::Shared);
        }
        match self.shared.cancel_error() {
            Some(err) => Err(Error::Shared(err)),
            None => Err(Error::connection_problem(
                "stream was cancelled before the upload completed",
            )),
        }
    }

    /// Upload all buffered events without completing the multipart upload.
    pub async fn close(&self) -> Result<()> {
        self.shared.lifecycle.complete(CompletionMode::Flush);
        self.wait_terminated().await;

        match self.shared.cancel_error() {
            Some(err) => Err(Error::Shared(err)),
            None => Ok(()),
        }
    }

    /// Stop the stream without uploading buffered events.
    pub fn cancel(&self) {
        if self.shared.lifecycle.cancel() {
            tracing::debug!(upload = %self.shared.upload.id, "Stream cancelled");
        }
    }

    /// Latest upload progress. Intermediate updates may be skipped; the
    /// receiver always sees the most recent one.
    pub fn status(&self) -> watch::Receiver<StreamStatus> {
        self.status.clone()
    }

    /// Observe whether the stream was cancelled or has finished.
    pub fn done(&self) -> Done {
        Done::new(self.shared.lifecycle.subscribe())
    }

    async fn wait_terminated(&self) {
        let mut rx = self.shared.lifecycle.subscribe();
        lifecycle::terminated(&mut rx).await;
    }
}
