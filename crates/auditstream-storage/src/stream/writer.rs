//! SliceWriter - The Stream Event Loop
//!
//! One `SliceWriter` task runs per stream. It is the only owner of the current
//! slice, the in-flight uploads and the list of completed parts, so none of
//! them need a lock.
//!
//! ## Event Loop
//!
//! ```text
//! loop {
//!   select! {
//!     lifecycle changed   → Cancelled: exit
//!                           Draining:  seal last slice, drain uploads, complete
//!     upload finished     → record part, publish status (failure: stop stream)
//!     force flush         → upload current slice if it holds events
//!     inactivity deadline → upload current slice if idle long enough
//!     event received      → append to slice, upload when full
//!   }
//! }
//! ```
//!
//! ## Part Numbers
//!
//! A fresh stream starts at part 1. A resumed stream starts two past the
//! highest part already uploaded: a writer from a previous process may still
//! be flushing the next number, and skipping it keeps the two writers from
//! ever assigning one number to different content. This lowers the chance of
//! a collision; it does not rule out a writer that is more than one part
//! behind.
//!
//! ## Upload Tasks
//!
//! Uploads run in a `JoinSet`, bounded by a semaphore of `concurrent_uploads`
//! permits. The permit moves into the task and is released when the task ends.
//! A task seals its slice once, then retries the upload with linear backoff:
//!
//! - success: the part is stored in the task's `ActiveUpload`
//! - canceled / not found: stop immediately, nothing can fix it
//! - anything else: rewind the reader, back off, try again, up to
//!   `retry.max_attempts` attempts in total

use std::collections::HashMap;
use std::future::pending;
use std::io::{Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;

use auditstream_core::{PreparedSessionEvent, SessionEvent};

use crate::error::{Error, Result};
use crate::retry::{Linear, RetryConfig};
use crate::slice::{Slice, SliceFactory};
use crate::stream::lifecycle::{self, CompletionMode, Lifecycle};
use crate::stream::{Shared, StreamStatus};
use crate::summarizer::{CapturedEnd, SessionSummarizer};
use crate::upload::ActiveUpload;
use crate::uploader::{MultipartUploader, StreamPart, StreamUpload};

/// Everything the event loop needs besides its channels.
pub(crate) struct WriterOptions {
    pub factory: SliceFactory,
    pub first_slice: Slice,
    pub completed_parts: Vec<StreamPart>,
    pub concurrent_uploads: usize,
    pub inactivity_flush_period: Duration,
    pub retry: RetryConfig,
    pub summarizer: Option<Arc<dyn SessionSummarizer>>,
    pub force_flush: Option<Arc<Notify>>,
}

pub(crate) struct SliceWriter {
    shared: Arc<Shared>,
    factory: SliceFactory,
    events: mpsc::Receiver<PreparedSessionEvent>,
    lifecycle: watch::Receiver<Lifecycle>,
    status: watch::Sender<StreamStatus>,
    summarizer: Option<Arc<dyn SessionSummarizer>>,
    force_flush: Option<Arc<Notify>>,
    inactivity_flush_period: Duration,
    retry: RetryConfig,

    current: Option<Slice>,
    next_part: i64,
    semaphore: Arc<Semaphore>,
    uploads: JoinSet<Arc<ActiveUpload>>,
    active: HashMap<i64, Arc<ActiveUpload>>,
    completed_parts: Vec<StreamPart>,
    last_event_at: Option<Instant>,
    flush_deadline: Option<Instant>,
    end_event: CapturedEnd,
}

/// Marks the loop as exited however `run` ends, unwinding included.
struct TerminateOnDrop(Arc<Shared>);

impl Drop for TerminateOnDrop {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0
                .fail(Error::connection_problem("stream event loop panicked"));
        }
        self.0.lifecycle.terminate();
    }
}

impl SliceWriter {
    pub(crate) fn new(
        shared: Arc<Shared>,
        events: mpsc::Receiver<PreparedSessionEvent>,
        status: watch::Sender<StreamStatus>,
        options: WriterOptions,
    ) -> Self {
        let next_part = options.first_slice.part_number() + 1;
        Self {
            lifecycle: shared.lifecycle.subscribe(),
            shared,
            factory: options.factory,
            events,
            status,
            summarizer: options.summarizer,
            force_flush: options.force_flush,
            inactivity_flush_period: options.inactivity_flush_period,
            retry: options.retry,
            current: Some(options.first_slice),
            next_part,
            semaphore: Arc::new(Semaphore::new(options.concurrent_uploads)),
            uploads: JoinSet::new(),
            active: HashMap::new(),
            completed_parts: options.completed_parts,
            last_event_at: None,
            flush_deadline: None,
            end_event: CapturedEnd::default(),
        }
    }

    fn upload(&self) -> &StreamUpload {
        self.factory.upload()
    }

    /// Run the event loop until the stream is completed, closed or cancelled.
    pub(crate) async fn run(mut self) {
        let _terminate = TerminateOnDrop(self.shared.clone());
        self.publish_status(-1);

        if let Err(e) = self.receive_and_upload().await {
            tracing::warn!(
                upload = %self.upload().id,
                session = %self.upload().session_id,
                error = %e,
                "Stream stopped"
            );
            self.shared.fail(e);
        }

        self.current = None;
        self.uploads.shutdown().await;
    }

    async fn receive_and_upload(&mut self) -> Result<()> {
        loop {
            let state = *self.lifecycle.borrow_and_update();
            match state {
                Lifecycle::Running => {}
                Lifecycle::Draining(mode) => return self.complete_stream(mode).await,
                Lifecycle::Cancelled | Lifecycle::Terminated => return Ok(()),
            }

            let force_flush = self.force_flush.clone();
            let flush_deadline = self.flush_deadline;

            tokio::select! {
                changed = self.lifecycle.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                Some(joined) = self.uploads.join_next(), if !self.uploads.is_empty() => {
                    let upload = joined.map_err(|e| Error::Upload(format!("upload task failed: {e}")))?;
                    self.on_upload_finished(upload)?;
                }
                _ = notified(force_flush.as_deref()) => {
                    self.flush("force flush").await?;
                }
                _ = sleep_until(flush_deadline) => {
                    self.on_inactivity_deadline().await?;
                }
                event = self.events.recv() => match event {
                    Some(event) => self.on_event(event).await?,
                    None => {
                        tracing::debug!(upload = %self.upload().id, "All stream handles dropped, stopping");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn on_event(&mut self, event: PreparedSessionEvent) -> Result<()> {
        let now = Instant::now();
        self.last_event_at = Some(now);
        if self.flush_deadline.is_none() {
            self.flush_deadline = Some(now + self.inactivity_flush_period);
        }

        let event = event.into_event();
        self.end_event.capture(&event);

        if let Err(e) = self.append(&event).await {
            if e.is_reserve_part_error() {
                return Err(e);
            }
            tracing::error!(
                upload = %self.upload().id,
                event_index = event.index(),
                event_type = event.event_type(),
                error = %e,
                "Lost event"
            );
            return Ok(());
        }

        if self.current.as_ref().is_some_and(Slice::should_upload) {
            self.start_upload().await?;
        }
        Ok(())
    }

    async fn append(&mut self, event: &SessionEvent) -> Result<()> {
        let slice = match self.current.take() {
            Some(slice) => slice,
            None => {
                let slice = self.factory.new_slice(self.next_part).await?;
                self.next_part += 1;
                slice
            }
        };
        self.current.insert(slice).record_event(event)
    }

    async fn on_inactivity_deadline(&mut self) -> Result<()> {
        let period = self.inactivity_flush_period;
        let elapsed = self.last_event_at.map_or(period, |t| t.elapsed());
        if elapsed < period {
            self.flush_deadline = Some(Instant::now() + (period - elapsed));
            return Ok(());
        }

        self.flush_deadline = None;
        tracing::debug!(
            upload = %self.upload().id,
            idle_ms = elapsed.as_millis() as u64,
            "Inactivity timer fired"
        );
        self.flush("inactivity").await
    }

    /// Upload the current slice if it holds any events.
    async fn flush(&mut self, reason: &'static str) -> Result<()> {
        if self.current.as_ref().map_or(true, Slice::is_empty) {
            tracing::debug!(upload = %self.upload().id, reason, "Nothing to flush");
            return Ok(());
        }
        tracing::debug!(upload = %self.upload().id, reason, "Flushing slice");
        self.start_upload().await
    }

    fn on_upload_finished(&mut self, upload: Arc<ActiveUpload>) -> Result<()> {
        self.active.remove(&upload.part_number());
        let part = upload.get_part().map_err(|e| {
            tracing::warn!(
                upload = %self.upload().id,
                part = upload.part_number(),
                error = %e,
                "Failed to upload part"
            );
            e
        })?;
        self.record_completed(part, upload.last_event_index());
        Ok(())
    }

    fn record_completed(&mut self, part: StreamPart, last_event_index: i64) {
        tracing::debug!(
            upload = %self.upload().id,
            part = part.number,
            size = part.size,
            last_event_index,
            "Part uploaded"
        );
        self.completed_parts.push(part);
        self.publish_status(last_event_index);
    }

    fn publish_status(&self, last_event_index: i64) {
        self.status.send_replace(StreamStatus {
            upload_id: self.upload().id.clone(),
            last_event_index,
            last_upload_time: Utc::now(),
        });
    }

    /// Hand the current slice to a new upload task.
    ///
    /// Waits for an upload permit. If the stream is cancelled meanwhile the
    /// slice is dropped and the loop exits on its next iteration.
    async fn start_upload(&mut self) -> Result<()> {
        let Some(slice) = self.current.take() else {
            return Ok(());
        };

        let mut cancel = self.shared.lifecycle.subscribe();
        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| Error::connection_problem("upload semaphore closed"))?
            }
            _ = lifecycle::cancelled(&mut cancel) => return Ok(()),
        };

        let active = Arc::new(ActiveUpload::new(
            slice.part_number(),
            slice.last_event_index(),
        ));
        self.active.insert(active.part_number(), active.clone());
        tracing::debug!(
            upload = %self.upload().id,
            part = active.part_number(),
            last_event_index = active.last_event_index(),
            in_flight = self.active.len(),
            "Starting part upload"
        );

        let task = UploadTask {
            uploader: self.factory.uploader.clone(),
            upload: self.upload().clone(),
            retry: self.retry.clone(),
            cancel,
        };
        self.uploads.spawn(task.run(slice, active, permit));
        Ok(())
    }

    /// Upload the last slice, wait for all uploads and, for a full completion,
    /// complete the multipart upload and summarize the session.
    async fn complete_stream(&mut self, mode: CompletionMode) -> Result<()> {
        // Events accepted before the intake closed still belong to the stream
        self.events.close();
        while let Ok(event) = self.events.try_recv() {
            self.on_event(event).await?;
        }

        match self.current.take() {
            Some(mut slice) if !slice.is_empty() => {
                slice.set_last(mode == CompletionMode::Complete);
                self.current = Some(slice);
                self.start_upload().await?;
            }
            _ => {}
        }

        let mut cancel = self.shared.lifecycle.subscribe();
        while !self.uploads.is_empty() {
            let joined = tokio::select! {
                joined = self.uploads.join_next() => joined,
                _ = lifecycle::cancelled(&mut cancel) => return Ok(()),
            };
            let Some(joined) = joined else { break };
            let upload = match joined {
                Ok(upload) => upload,
                Err(e) => {
                    tracing::warn!(upload = %self.upload().id, error = %e, "Upload task failed");
                    continue;
                }
            };
            self.active.remove(&upload.part_number());
            match upload.get_part() {
                Ok(part) => self.record_completed(part, upload.last_event_index()),
                Err(e) => tracing::warn!(
                    upload = %self.upload().id,
                    part = upload.part_number(),
                    error = %e,
                    "Failed to upload part"
                ),
            }
        }

        if mode == CompletionMode::Flush {
            tracing::debug!(
                upload = %self.upload().id,
                parts = self.completed_parts.len(),
                "Stream closed without completing upload"
            );
            self.shared.set_complete_result(Err(Error::connection_problem(
                "stream was closed without completing the upload",
            )));
            return Ok(());
        }

        // Uploads finish out of order
        self.completed_parts.sort_by_key(|part| part.number);
        let result = self
            .factory
            .uploader
            .complete_upload(self.upload(), &self.completed_parts)
            .await;
        if let Err(e) = &result {
            tracing::warn!(
                upload = %self.upload().id,
                session = %self.upload().session_id,
                error = %e,
                "Failed to complete upload"
            );
        }
        let completed = result.is_ok();
        self.shared.set_complete_result(result);
        if !completed {
            return Ok(());
        }

        tracing::info!(
            upload = %self.upload().id,
            session = %self.upload().session_id,
            parts = self.completed_parts.len(),
            "Completed upload"
        );

        if let Some(summarizer) = &self.summarizer {
            if let Err(e) = self
                .end_event
                .summarize(summarizer.as_ref(), &self.upload().session_id)
                .await
            {
                tracing::warn!(
                    upload = %self.upload().id,
                    session = %self.upload().session_id,
                    error = %e,
                    "Failed to summarize upload"
                );
            }
        }
        Ok(())
    }
}

async fn notified(notify: Option<&Notify>) {
    match notify {
        Some(notify) => notify.notified().await,
        None => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Uploads one sealed slice.
struct UploadTask {
    uploader: Arc<dyn MultipartUploader>,
    upload: StreamUpload,
    retry: RetryConfig,
    cancel: watch::Receiver<Lifecycle>,
}

impl UploadTask {
    async fn run(
        mut self,
        slice: Slice,
        active: Arc<ActiveUpload>,
        _permit: OwnedSemaphorePermit,
    ) -> Arc<ActiveUpload> {
        let result = self.upload_with_retry(slice, active.part_number()).await;
        active.set_result(result);
        active
    }

    async fn upload_with_retry(&mut self, slice: Slice, part_number: i64) -> Result<StreamPart> {
        let mut reader = slice.into_reader()?;
        let mut backoff: Option<Linear> = None;
        let mut last_error = None;

        for attempt in 0..self.retry.max_attempts {
            let result = tokio::select! {
                result = self.uploader.upload_part(&self.upload, part_number, &mut reader) => result,
                _ = lifecycle::cancelled(&mut self.cancel) => Err(Error::Canceled),
            };

            let e = match result {
                Ok(part) => return Ok(part),
                Err(e) => e,
            };
            if e.is_fatal_upload_error() {
                tracing::info!(
                    upload = %self.upload.id,
                    part = part_number,
                    error = %e,
                    "Aborting part upload"
                );
                return Err(e);
            }

            let backoff = backoff.get_or_insert_with(|| Linear::new(&self.retry));
            backoff.inc();
            tracing::warn!(
                upload = %self.upload.id,
                part = part_number,
                attempt = attempt + 1,
                backoff_ms = backoff.duration().as_millis() as u64,
                error = %e,
                "Part upload failed, retrying"
            );
            last_error = Some(e);

            if attempt + 1 == self.retry.max_attempts {
                break;
            }
            reader.seek(SeekFrom::Start(0))?;
            tokio::select! {
                _ = backoff.after() => {}
                _ = lifecycle::cancelled(&mut self.cancel) => return Err(Error::Canceled),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::LimitExceeded(format!("no upload attempts left for part {part_number}"))
        }))
    }
}
