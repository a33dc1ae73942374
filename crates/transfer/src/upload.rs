//! Upload session registry.
//!
//! One [`UploadRegistry`] owns every in-flight upload of the process. Each
//! session buffers its chunks in a [`ChunkStore`] and mirrors the state of
//! the matching resumable session on the remote store.
//!
//! Chunks may be buffered in any order, but the remote store only accepts
//! strictly increasing offsets. The registry therefore keeps a relay
//! cursor per session: [`claim_relay`](UploadRegistry::claim_relay) hands
//! out the chunk at the cursor once it is buffered and no other relay for
//! that session is running, and [`finish_relay`](UploadRegistry::finish_relay)
//! advances it. A failed relay stops relaying for the session for good;
//! completion then falls back to uploading the assembled buffer.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use galley_protocol::messages::UploadProgress;
use galley_protocol::{FileMeta, Purpose};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::chunk_store::{ChunkStore, assemble, total_chunks_for};
use crate::{TransferError, generate_session_id};

/// Target of an upload and where its result is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Book the finished file belongs to.
    pub entity_id: String,
    pub purpose: Purpose,
    /// Remote container the object is created in.
    pub container_id: String,
    pub file: FileMeta,
}

/// A chunk ready to be forwarded to the remote resumable session.
#[derive(Debug, Clone)]
pub struct RelayJob {
    pub index: u32,
    /// Byte offset of the chunk within the object.
    pub offset: u64,
    pub data: Bytes,
    pub session_token: String,
    pub total_size: u64,
}

/// Result of forwarding one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Accepted {
        uploaded_bytes: u64,
        object_id: Option<String>,
    },
    Failed,
}

/// Read-only snapshot of an upload session (chunk bytes excluded).
#[derive(Debug, Clone, PartialEq)]
pub struct UploadSessionInfo {
    pub id: String,
    pub owner_id: String,
    pub meta: ObjectMeta,
    pub chunk_size: usize,
    pub total_chunks: u32,
    pub received_chunks: u32,
    pub received_bytes: u64,
    pub remote_session_token: Option<String>,
    pub remote_uploaded_bytes: u64,
    pub remote_object_id: Option<String>,
    pub relay_broken: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadSessionInfo {
    pub fn is_complete(&self) -> bool {
        self.received_chunks == self.total_chunks
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        f64::from(self.received_chunks) / f64::from(self.total_chunks) * 100.0
    }

    /// Exact length the chunk at `index` must have for the declared size.
    pub fn expected_chunk_len(&self, index: u32) -> u64 {
        let start = u64::from(index) * self.chunk_size as u64;
        self.meta
            .file
            .size
            .saturating_sub(start)
            .min(self.chunk_size as u64)
    }

    /// Protocol progress payload.
    pub fn to_progress(&self) -> UploadProgress {
        UploadProgress {
            upload_id: self.id.clone(),
            file_name: self.meta.file.name.clone(),
            received_chunks: self.received_chunks,
            total_chunks: self.total_chunks,
            received_bytes: self.received_bytes,
            total_bytes: self.meta.file.size,
            remote_uploaded_bytes: self.remote_uploaded_bytes,
            percentage: self.progress_percent(),
            started_at: self.created_at.to_rfc3339(),
            updated_at: self.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Default)]
struct RemoteState {
    session_token: Option<String>,
    uploaded_bytes: u64,
    object_id: Option<String>,
    next_relay_index: u32,
    relay_in_flight: bool,
    relay_broken: bool,
}

struct UploadSession {
    id: String,
    owner_id: String,
    meta: ObjectMeta,
    chunk_size: usize,
    store: ChunkStore,
    remote: RemoteState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_activity: Instant,
}

impl UploadSession {
    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.last_activity = Instant::now();
    }

    fn info(&self) -> UploadSessionInfo {
        UploadSessionInfo {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            meta: self.meta.clone(),
            chunk_size: self.chunk_size,
            total_chunks: self.store.total_chunks(),
            received_chunks: self.store.received_chunks(),
            received_bytes: self.store.received_bytes(),
            remote_session_token: self.remote.session_token.clone(),
            remote_uploaded_bytes: self.remote.uploaded_bytes,
            remote_object_id: self.remote.object_id.clone(),
            relay_broken: self.remote.relay_broken,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// All in-flight uploads, guarded by a single lock.
#[derive(Default)]
pub struct UploadRegistry {
    sessions: Mutex<HashMap<String, UploadSession>>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new upload and returns its id and chunk count.
    pub async fn create_session(
        &self,
        owner_id: &str,
        meta: ObjectMeta,
        chunk_size: usize,
    ) -> Result<(String, u32), TransferError> {
        let total_chunks = total_chunks_for(meta.file.size, chunk_size)?;
        let id = generate_session_id();
        let now = Utc::now();

        tracing::info!(
            upload_id = %id,
            owner = owner_id,
            entity = %meta.entity_id,
            purpose = %meta.purpose,
            size = meta.file.size,
            total_chunks,
            "upload session created"
        );

        let session = UploadSession {
            id: id.clone(),
            owner_id: owner_id.to_string(),
            meta,
            chunk_size,
            store: ChunkStore::new(total_chunks),
            remote: RemoteState::default(),
            created_at: now,
            updated_at: now,
            last_activity: Instant::now(),
        };
        self.sessions.lock().await.insert(id.clone(), session);
        Ok((id, total_chunks))
    }

    /// Returns a snapshot of the session, if it exists.
    pub async fn get_session(&self, id: &str) -> Option<UploadSessionInfo> {
        self.sessions.lock().await.get(id).map(UploadSession::info)
    }

    /// Buffers a chunk and returns the session's progress percentage.
    ///
    /// A chunk index that is already buffered is accepted without
    /// replacing the earlier bytes.
    pub async fn store_chunk(
        &self,
        id: &str,
        index: i64,
        data: Bytes,
    ) -> Result<f64, TransferError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| TransferError::session_not_found(id))?;

        let len = data.len();
        let inserted = session.store.insert(index, data)?;
        session.touch();

        if inserted {
            tracing::debug!(upload_id = id, index, bytes = len, "chunk buffered");
        } else {
            tracing::debug!(upload_id = id, index, "duplicate chunk ignored");
        }
        Ok(session.store.progress_percent())
    }

    pub async fn is_complete(&self, id: &str) -> Result<bool, TransferError> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(id)
            .ok_or_else(|| TransferError::session_not_found(id))?;
        Ok(session.store.is_complete())
    }

    /// Returns `true` if every chunk index is present.
    pub async fn validate_chunks(&self, id: &str) -> Result<bool, TransferError> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(id)
            .ok_or_else(|| TransferError::session_not_found(id))?;
        Ok(session.store.validate())
    }

    /// Concatenates all chunks in index order.
    ///
    /// Only cheap handles are taken under the lock; the copy happens after
    /// it is released.
    pub async fn assemble_chunks(&self, id: &str) -> Result<Vec<u8>, TransferError> {
        let parts = {
            let sessions = self.sessions.lock().await;
            let session = sessions
                .get(id)
                .ok_or_else(|| TransferError::session_not_found(id))?;
            session.store.ordered().ok_or_else(|| {
                TransferError::FailedPrecondition(format!(
                    "upload {id} is missing chunks ({}/{})",
                    session.store.received_chunks(),
                    session.store.total_chunks()
                ))
            })?
        };
        Ok(assemble(&parts))
    }

    /// Records the remote resumable session opened for this upload.
    pub async fn attach_remote_session(
        &self,
        id: &str,
        remote_token: String,
    ) -> Result<(), TransferError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| TransferError::session_not_found(id))?;
        session.remote.session_token = Some(remote_token);
        session.touch();
        Ok(())
    }

    /// Mirrors the remote side's progress and, once known, its object id.
    pub async fn update_remote_progress(
        &self,
        id: &str,
        uploaded_bytes: u64,
        remote_object_id: Option<String>,
    ) -> Result<(), TransferError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| TransferError::session_not_found(id))?;
        session.remote.uploaded_bytes = uploaded_bytes;
        if remote_object_id.is_some() {
            session.remote.object_id = remote_object_id;
        }
        session.touch();
        Ok(())
    }

    /// Takes the next chunk to relay, if one is ready.
    ///
    /// Returns `None` when the session is gone, has no remote session, is
    /// already relaying, has given up relaying, is finished remotely, or
    /// the chunk at the cursor has not arrived yet.
    pub async fn claim_relay(&self, id: &str) -> Option<RelayJob> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(id)?;
        let remote = &session.remote;
        if remote.relay_in_flight || remote.relay_broken || remote.object_id.is_some() {
            return None;
        }
        let token = remote.session_token.clone()?;
        let index = remote.next_relay_index;
        let data = session.store.get(index)?.clone();

        session.remote.relay_in_flight = true;
        Some(RelayJob {
            index,
            offset: u64::from(index) * session.chunk_size as u64,
            data,
            session_token: token,
            total_size: session.meta.file.size,
        })
    }

    /// Commits the outcome of a relay started by [`claim_relay`](Self::claim_relay).
    pub async fn finish_relay(
        &self,
        id: &str,
        index: u32,
        outcome: RelayOutcome,
    ) -> Result<(), TransferError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| TransferError::session_not_found(id))?;
        session.remote.relay_in_flight = false;

        match outcome {
            RelayOutcome::Accepted {
                uploaded_bytes,
                object_id,
            } => {
                if index == session.remote.next_relay_index {
                    session.remote.next_relay_index += 1;
                }
                session.remote.uploaded_bytes = uploaded_bytes;
                if object_id.is_some() {
                    session.remote.object_id = object_id;
                }
            }
            RelayOutcome::Failed => {
                session.remote.relay_broken = true;
            }
        }
        session.touch();
        Ok(())
    }

    /// Removes a session. Returns `false` if it did not exist.
    pub async fn remove_session(&self, id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(id).is_some();
        if removed {
            tracing::debug!(upload_id = id, "upload session removed");
        }
        removed
    }

    /// Sessions created by `owner_id`, oldest first.
    pub async fn sessions_for_owner(&self, owner_id: &str) -> Vec<UploadSessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut list: Vec<_> = sessions
            .values()
            .filter(|s| s.owner_id == owner_id)
            .map(UploadSession::info)
            .collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    /// Drops every session idle for longer than `timeout`.
    ///
    /// Returns the number of sessions removed.
    pub async fn evict_idle(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|id, s| {
            let keep = now.duration_since(s.last_activity) <= timeout;
            if !keep {
                tracing::debug!(upload_id = %id, "evicting idle upload session");
            }
            keep
        });
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}
