//! In-Memory Multipart Uploader
//!
//! `MemoryUploader` keeps every multipart upload in process memory. It backs
//! the test suite and local tooling that want to record and replay a session
//! without object storage.
//!
//! Besides the `MultipartUploader` operations it offers failure injection
//! (`fail_reserve`, `fail_next_uploads`, `fail_complete`) and inspection of
//! what the stream did (`reserved_parts`, `parts`, `completed`,
//! `upload_attempts`).

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::slice::PartReader;
use crate::uploader::{MultipartUploader, StreamPart, StreamUpload};

/// Kind of error injected into `upload_part`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A retryable backend error
    Transient,
    /// The upload vanished; not retryable
    NotFound,
}

/// A multipart upload that was completed.
#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub upload: StreamUpload,

    /// Parts in the order `complete_upload` received them
    pub parts: Vec<StreamPart>,

    /// Concatenated part bytes
    pub data: Vec<u8>,
}

#[derive(Default)]
struct PendingUpload {
    upload: Option<StreamUpload>,
    reserved: Vec<i64>,
    parts: BTreeMap<i64, (StreamPart, Vec<u8>)>,
}

#[derive(Default)]
struct State {
    uploads: HashMap<String, PendingUpload>,
    completed: HashMap<String, CompletedUpload>,
    fail_reserve: bool,
    fail_complete: bool,
    failures: Vec<FailureKind>,
    upload_attempts: usize,
}

#[derive(Default)]
pub struct MemoryUploader {
    state: Mutex<State>,
}

impl MemoryUploader {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every following `reserve_upload_part` call fail.
    pub fn fail_reserve(&self, fail: bool) {
        self.lock().fail_reserve = fail;
    }

    /// Make the next `count` `upload_part` calls fail with `kind`.
    pub fn fail_next_uploads(&self, count: usize, kind: FailureKind) {
        let mut state = self.lock();
        state.failures.extend(std::iter::repeat(kind).take(count));
    }

    /// Make `complete_upload` fail.
    pub fn fail_complete(&self, fail: bool) {
        self.lock().fail_complete = fail;
    }

    /// Part numbers reserved for an in-progress upload, in reservation order.
    pub fn reserved_parts(&self, upload_id: &str) -> Vec<i64> {
        self.lock()
            .uploads
            .get(upload_id)
            .map(|u| u.reserved.clone())
            .unwrap_or_default()
    }

    /// Parts uploaded so far for an in-progress upload, sorted by number.
    pub fn parts(&self, upload_id: &str) -> Vec<StreamPart> {
        self.lock()
            .uploads
            .get(upload_id)
            .map(|u| u.parts.values().map(|(part, _)| part.clone()).collect())
            .unwrap_or_default()
    }

    /// Bytes of one uploaded part.
    pub fn part_data(&self, upload_id: &str, part_number: i64) -> Option<Vec<u8>> {
        self.lock()
            .uploads
            .get(upload_id)
            .and_then(|u| u.parts.get(&part_number))
            .map(|(_, data)| data.clone())
    }

    /// All uploaded parts of an in-progress upload concatenated in part order.
    pub fn pending_data(&self, upload_id: &str) -> Vec<u8> {
        self.lock()
            .uploads
            .get(upload_id)
            .map(|u| u.parts.values().flat_map(|(_, data)| data.clone()).collect())
            .unwrap_or_default()
    }

    pub fn completed(&self, upload_id: &str) -> Option<CompletedUpload> {
        self.lock().completed.get(upload_id).cloned()
    }

    /// Total number of `upload_part` calls, failed ones included.
    pub fn upload_attempts(&self) -> usize {
        self.lock().upload_attempts
    }

    /// Register an upload created elsewhere, e.g. by a previous process.
    pub fn insert_upload(&self, upload: StreamUpload) {
        let id = upload.id.clone();
        self.lock().uploads.entry(id).or_default().upload = Some(upload);
    }
}

fn not_found(upload: &StreamUpload) -> Error {
    Error::NotFound(format!("upload {} for session {}", upload.id, upload.session_id))
}

#[async_trait]
impl MultipartUploader for MemoryUploader {
    async fn create_upload(&self, session_id: &str) -> Result<StreamUpload> {
        let upload = StreamUpload {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            initiated: Utc::now(),
        };
        self.insert_upload(upload.clone());
        tracing::debug!(upload = %upload.id, session = %session_id, "Created multipart upload");
        Ok(upload)
    }

    async fn reserve_upload_part(&self, upload: &StreamUpload, part_number: i64) -> Result<()> {
        let mut state = self.lock();
        if state.fail_reserve {
            return Err(Error::connection_problem_with(
                format!("part {part_number} of upload {} rejected", upload.id),
                std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            ));
        }
        let pending = state
            .uploads
            .get_mut(&upload.id)
            .ok_or_else(|| not_found(upload))?;
        pending.reserved.push(part_number);
        Ok(())
    }

    async fn upload_part(
        &self,
        upload: &StreamUpload,
        part_number: i64,
        reader: &mut PartReader,
    ) -> Result<StreamPart> {
        let mut data = Vec::with_capacity(reader.len());
        reader.read_to_end(&mut data)?;

        let mut state = self.lock();
        state.upload_attempts += 1;
        if !state.failures.is_empty() {
            return match state.failures.remove(0) {
                FailureKind::Transient => Err(Error::Upload(format!(
                    "injected failure for part {part_number}"
                ))),
                FailureKind::NotFound => Err(not_found(upload)),
            };
        }

        let pending = state
            .uploads
            .get_mut(&upload.id)
            .ok_or_else(|| not_found(upload))?;
        let part = StreamPart {
            number: part_number,
            etag: format!("{}-{part_number}-{}", upload.id, data.len()),
            size: data.len() as u64,
            last_modified: Utc::now(),
        };
        pending.parts.insert(part_number, (part.clone(), data));
        Ok(part)
    }

    async fn list_parts(&self, upload: &StreamUpload) -> Result<Vec<StreamPart>> {
        let state = self.lock();
        let pending = state.uploads.get(&upload.id).ok_or_else(|| not_found(upload))?;
        Ok(pending.parts.values().map(|(part, _)| part.clone()).collect())
    }

    async fn complete_upload(&self, upload: &StreamUpload, parts: &[StreamPart]) -> Result<()> {
        let mut state = self.lock();
        if state.fail_complete {
            return Err(Error::connection_problem(format!(
                "complete of upload {} rejected",
                upload.id
            )));
        }
        let pending = state
            .uploads
            .get(&upload.id)
            .ok_or_else(|| not_found(upload))?;

        let mut sorted: Vec<&StreamPart> = parts.iter().collect();
        sorted.sort_by_key(|part| part.number);

        let mut data = Vec::new();
        for part in sorted {
            let (_, bytes) = pending.parts.get(&part.number).ok_or_else(|| {
                Error::BadParameter(format!("part {} was never uploaded", part.number))
            })?;
            data.extend_from_slice(bytes);
        }

        state.uploads.remove(&upload.id);
        state.completed.insert(
            upload.id.clone(),
            CompletedUpload {
                upload: upload.clone(),
                parts: parts.to_vec(),
                data,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_lifecycle() {
        let uploader = MemoryUploader::new();
        let upload = uploader.create_upload("s1").await.unwrap();

        uploader.reserve_upload_part(&upload, 1).await.unwrap();
        uploader.reserve_upload_part(&upload, 2).await.unwrap();
        assert_eq!(uploader.reserved_parts(&upload.id), vec![1, 2]);

        let p2 = uploader
            .upload_part(&upload, 2, &mut PartReader::from_vec(b"world".to_vec()))
            .await
            .unwrap();
        let p1 = uploader
            .upload_part(&upload, 1, &mut PartReader::from_vec(b"hello ".to_vec()))
            .await
            .unwrap();
        assert_eq!(uploader.list_parts(&upload).await.unwrap(), vec![p1.clone(), p2.clone()]);

        uploader.complete_upload(&upload, &[p1, p2]).await.unwrap();
        let completed = uploader.completed(&upload.id).unwrap();
        assert_eq!(completed.data, b"hello world");
        assert!(uploader.parts(&upload.id).is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let uploader = MemoryUploader::new();
        let upload = uploader.create_upload("s1").await.unwrap();
        uploader.fail_next_uploads(1, FailureKind::Transient);
        uploader.fail_next_uploads(1, FailureKind::NotFound);

        let mut reader = PartReader::from_vec(vec![1]);
        let err = uploader.upload_part(&upload, 1, &mut reader).await.unwrap_err();
        assert!(!err.is_fatal_upload_error());

        let mut reader = PartReader::from_vec(vec![1]);
        let err = uploader.upload_part(&upload, 1, &mut reader).await.unwrap_err();
        assert!(err.is_not_found());

        let mut reader = PartReader::from_vec(vec![1]);
        uploader.upload_part(&upload, 1, &mut reader).await.unwrap();
        assert_eq!(uploader.upload_attempts(), 3);
    }

    #[tokio::test]
    async fn test_unknown_upload_is_not_found() {
        let uploader = MemoryUploader::new();
        let upload = StreamUpload {
            id: "missing".into(),
            session_id: "s1".into(),
            initiated: Utc::now(),
        };
        assert!(uploader.list_parts(&upload).await.unwrap_err().is_not_found());
        assert!(uploader
            .reserve_upload_part(&upload, 1)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_insert_upload_registers_existing_upload() {
        let uploader = MemoryUploader::new();
        let upload = StreamUpload {
            id: "existing".into(),
            session_id: "s1".into(),
            initiated: Utc::now(),
        };
        uploader.insert_upload(upload.clone());

        uploader.reserve_upload_part(&upload, 4).await.unwrap();
        assert_eq!(uploader.reserved_parts("existing"), vec![4]);
        assert!(uploader.list_parts(&upload).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_reserve() {
        let uploader = MemoryUploader::new();
        let upload = uploader.create_upload("s1").await.unwrap();
        uploader.fail_reserve(true);
        let err = uploader.reserve_upload_part(&upload, 1).await.unwrap_err();
        assert!(err.is_connection_problem());
        assert!(std::error::Error::source(&err).is_some());
        assert!(uploader.reserved_parts(&upload.id).is_empty());
    }
}
