//! Download session registry.
//!
//! A download session is a window of fixed-size byte ranges over one
//! remote object. Sessions only exist for objects above the chunking
//! threshold; smaller objects are fetched in one request.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use galley_protocol::messages::DownloadProgress;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::chunk_store::total_chunks_for;
use crate::{TransferError, generate_session_id};

/// Remote object a download reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    pub object_id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

/// Read-only snapshot of a download session.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadSessionInfo {
    pub id: String,
    pub owner_id: String,
    pub target: DownloadTarget,
    pub chunk_size: usize,
    pub total_chunks: u32,
    /// Highest index delivered so far, -1 before the first chunk.
    pub last_chunk_sent: i64,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

impl DownloadSessionInfo {
    pub fn to_progress(&self) -> DownloadProgress {
        DownloadProgress {
            download_id: self.id.clone(),
            file_name: self.target.name.clone(),
            file_size: self.target.size,
            total_chunks: self.total_chunks,
            last_chunk_sent: self.last_chunk_sent,
            cancelled: self.cancelled,
        }
    }
}

struct DownloadSession {
    id: String,
    owner_id: String,
    target: DownloadTarget,
    chunk_size: usize,
    total_chunks: u32,
    last_chunk_sent: i64,
    cancelled: bool,
    created_at: DateTime<Utc>,
    last_activity: Instant,
}

impl DownloadSession {
    fn info(&self) -> DownloadSessionInfo {
        DownloadSessionInfo {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            target: self.target.clone(),
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
            last_chunk_sent: self.last_chunk_sent,
            cancelled: self.cancelled,
            created_at: self.created_at,
        }
    }

    fn check_index(&self, index: i64) -> Result<u32, TransferError> {
        if self.cancelled {
            return Err(TransferError::FailedPrecondition(format!(
                "download {} was cancelled",
                self.id
            )));
        }
        u32::try_from(index)
            .ok()
            .filter(|i| *i < self.total_chunks)
            .ok_or_else(|| {
                TransferError::InvalidArgument(format!(
                    "chunk index {index} outside 0..{}",
                    self.total_chunks
                ))
            })
    }
}

/// All in-flight downloads, guarded by a single lock.
pub struct DownloadRegistry {
    sessions: Mutex<HashMap<String, DownloadSession>>,
    threshold: u64,
}

impl DownloadRegistry {
    /// Creates a registry that only opens sessions for objects larger
    /// than `threshold` bytes.
    pub fn new(threshold: u64) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            threshold,
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Opens a session over `target`.
    ///
    /// Returns `None` if the object is not above the threshold; the caller
    /// should fetch it whole instead.
    pub async fn create_session(
        &self,
        owner_id: &str,
        target: DownloadTarget,
        chunk_size: usize,
    ) -> Result<Option<DownloadSessionInfo>, TransferError> {
        if target.size <= self.threshold {
            return Ok(None);
        }
        let total_chunks = total_chunks_for(target.size, chunk_size)?;
        let id = generate_session_id();

        tracing::info!(
            download_id = %id,
            owner = owner_id,
            object = %target.object_id,
            size = target.size,
            total_chunks,
            "download session created"
        );

        let session = DownloadSession {
            id: id.clone(),
            owner_id: owner_id.to_string(),
            target,
            chunk_size,
            total_chunks,
            last_chunk_sent: -1,
            cancelled: false,
            created_at: Utc::now(),
            last_activity: Instant::now(),
        };
        let info = session.info();
        self.sessions.lock().await.insert(id, session);
        Ok(Some(info))
    }

    pub async fn get_session(&self, id: &str) -> Option<DownloadSessionInfo> {
        self.sessions.lock().await.get(id).map(DownloadSession::info)
    }

    /// Inclusive byte range `(start, end)` of chunk `index`.
    pub async fn next_chunk_range(&self, id: &str, index: i64) -> Result<(u64, u64), TransferError> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(id)
            .ok_or_else(|| TransferError::session_not_found(id))?;
        let index = session.check_index(index)?;

        let start = u64::from(index) * session.chunk_size as u64;
        let end = (start + session.chunk_size as u64 - 1).min(session.target.size - 1);
        Ok((start, end))
    }

    /// Records delivery of chunk `index`.
    ///
    /// Returns `true` if it was the last chunk, in which case the session
    /// has been removed.
    pub async fn mark_chunk_sent(&self, id: &str, index: i64) -> Result<bool, TransferError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| TransferError::session_not_found(id))?;
        let index = session.check_index(index)?;

        session.last_chunk_sent = session.last_chunk_sent.max(i64::from(index));
        session.last_activity = Instant::now();

        let last = index + 1 == session.total_chunks;
        if last {
            sessions.remove(id);
            tracing::info!(download_id = id, "download session complete");
        }
        Ok(last)
    }

    /// Marks a session cancelled; further chunk requests fail.
    pub async fn cancel(&self, id: &str) -> Result<(), TransferError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| TransferError::session_not_found(id))?;
        session.cancelled = true;
        session.last_activity = Instant::now();
        tracing::info!(download_id = id, "download session cancelled");
        Ok(())
    }

    /// Removes a session. Returns `false` if it did not exist.
    pub async fn remove_session(&self, id: &str) -> bool {
        self.sessions.lock().await.remove(id).is_some()
    }

    /// Sessions created by `owner_id`, oldest first.
    pub async fn sessions_for_owner(&self, owner_id: &str) -> Vec<DownloadSessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut list: Vec<_> = sessions
            .values()
            .filter(|s| s.owner_id == owner_id)
            .map(DownloadSession::info)
            .collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    /// Drops every session idle for longer than `timeout`.
    pub async fn evict_idle(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, s| now.duration_since(s.last_activity) <= timeout);
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}
