//! In-Flight Part Uploads
//!
//! Every sealed slice is uploaded by its own task. The task records the outcome
//! in an `ActiveUpload`; the event loop reads it once the task has been joined.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::uploader::StreamPart;

#[derive(Debug)]
struct UploadState {
    end_time: Option<DateTime<Utc>>,
    result: Option<std::result::Result<StreamPart, Arc<Error>>>,
}

/// Handle to one part upload.
#[derive(Debug)]
pub struct ActiveUpload {
    part_number: i64,
    last_event_index: i64,
    start_time: DateTime<Utc>,
    state: Mutex<UploadState>,
}

impl ActiveUpload {
    pub fn new(part_number: i64, last_event_index: i64) -> Self {
        Self {
            part_number,
            last_event_index,
            start_time: Utc::now(),
            state: Mutex::new(UploadState {
                end_time: None,
                result: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, UploadState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn part_number(&self) -> i64 {
        self.part_number
    }

    /// Highest event index contained in the part.
    pub fn last_event_index(&self) -> i64 {
        self.last_event_index
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.lock().end_time
    }

    /// Record the outcome of the upload.
    pub fn set_result(&self, result: Result<StreamPart>) {
        let mut state = self.lock();
        state.end_time = Some(Utc::now());
        state.result = Some(result.map_err(Arc::new));
    }

    /// The uploaded part.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no result was recorded yet
    /// - The upload's own error, shared
    pub fn get_part(&self) -> Result<StreamPart> {
        match &self.lock().result {
            None => Err(Error::NotFound(format!(
                "part {} has no upload result yet",
                self.part_number
            ))),
            Some(Ok(part)) => Ok(part.clone()),
            Some(Err(e)) => Err(Error::Shared(e.clone())),
        }
    }
}
