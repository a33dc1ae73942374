//! In-memory adapters for tests and local runs.
//!
//! [`MemoryRemote`] follows the remote store contract strictly: a
//! resumable upload rejects any chunk whose offset is not exactly the
//! number of bytes received so far. Failures can be injected per call kind.

use std::collections::HashMap;

use bytes::Bytes;
use galley_protocol::messages::UploadedFile;
use tokio::sync::Mutex;

use crate::entity::{EntityStore, EntityStoreError, Record, StoreFuture};
use crate::remote::{
    ChunkUploadStatus, ObjectMetadata, RemoteError, RemoteFuture, RemoteTransferAdapter,
};

struct StoredObject {
    name: String,
    mime_type: String,
    data: Vec<u8>,
}

struct ResumableUpload {
    name: String,
    mime_type: String,
    declared_size: u64,
    data: Vec<u8>,
}

#[derive(Default)]
struct RemoteState {
    containers: HashMap<String, String>,
    objects: HashMap<String, StoredObject>,
    uploads: HashMap<String, ResumableUpload>,
    fail_initiate: bool,
    fail_relay: bool,
    fail_whole_upload: bool,
    relayed_chunks: usize,
    whole_uploads: usize,
}

impl RemoteState {
    fn store(&mut self, name: String, mime_type: String, data: Vec<u8>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.objects.insert(
            id.clone(),
            StoredObject {
                name,
                mime_type,
                data,
            },
        );
        id
    }
}

/// Blob store held in memory.
pub struct MemoryRemote {
    base_url: String,
    state: Mutex<RemoteState>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            base_url: "memory://files".into(),
            state: Mutex::new(RemoteState::default()),
        }
    }

    fn links(&self, id: &str) -> (String, String) {
        (
            format!("{}/view/{id}", self.base_url),
            format!("{}/download/{id}", self.base_url),
        )
    }

    /// Makes `initiate_resumable_session` fail.
    pub async fn fail_initiate(&self, fail: bool) {
        self.state.lock().await.fail_initiate = fail;
    }

    /// Makes `upload_chunk_to_session` fail.
    pub async fn fail_relay(&self, fail: bool) {
        self.state.lock().await.fail_relay = fail;
    }

    /// Makes `upload_whole_object` fail.
    pub async fn fail_whole_upload(&self, fail: bool) {
        self.state.lock().await.fail_whole_upload = fail;
    }

    /// Stores an object directly and returns its id.
    pub async fn put_object(&self, name: &str, mime_type: &str, data: Vec<u8>) -> String {
        self.state
            .lock()
            .await
            .store(name.to_string(), mime_type.to_string(), data)
    }

    /// Contents of a stored object.
    pub async fn object_bytes(&self, object_id: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().await;
        state.objects.get(object_id).map(|o| o.data.clone())
    }

    pub async fn object_count(&self) -> usize {
        self.state.lock().await.objects.len()
    }

    pub async fn container_count(&self) -> usize {
        self.state.lock().await.containers.len()
    }

    /// Number of chunks accepted by resumable uploads.
    pub async fn relayed_chunks(&self) -> usize {
        self.state.lock().await.relayed_chunks
    }

    /// Number of successful `upload_whole_object` calls.
    pub async fn whole_uploads(&self) -> usize {
        self.state.lock().await.whole_uploads
    }
}

impl RemoteTransferAdapter for MemoryRemote {
    fn find_container<'a>(&'a self, name: &'a str) -> RemoteFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.state.lock().await.containers.get(name).cloned()) })
    }

    fn create_container<'a>(&'a self, name: &'a str) -> RemoteFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let id = state
                .containers
                .entry(name.to_string())
                .or_insert_with(|| uuid::Uuid::new_v4().to_string());
            Ok(id.clone())
        })
    }

    fn initiate_resumable_session<'a>(
        &'a self,
        name: &'a str,
        mime_type: &'a str,
        _container_id: &'a str,
        declared_size: u64,
    ) -> RemoteFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.fail_initiate {
                return Err(RemoteError::Unavailable("resumable session refused".into()));
            }
            let token = uuid::Uuid::new_v4().to_string();
            state.uploads.insert(
                token.clone(),
                ResumableUpload {
                    name: name.to_string(),
                    mime_type: mime_type.to_string(),
                    declared_size,
                    data: Vec::new(),
                },
            );
            Ok(token)
        })
    }

    fn upload_chunk_to_session<'a>(
        &'a self,
        token: &'a str,
        data: Bytes,
        start_offset: u64,
        total_size: u64,
    ) -> RemoteFuture<'a, ChunkUploadStatus> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.fail_relay {
                return Err(RemoteError::Unavailable("connection reset".into()));
            }
            let upload = state
                .uploads
                .get_mut(token)
                .ok_or_else(|| RemoteError::Rejected(format!("unknown session {token}")))?;

            let received = upload.data.len() as u64;
            if start_offset != received {
                return Err(RemoteError::Rejected(format!(
                    "expected offset {received}, got {start_offset}"
                )));
            }
            if total_size != upload.declared_size {
                return Err(RemoteError::Rejected(format!(
                    "declared size {} does not match {total_size}",
                    upload.declared_size
                )));
            }
            if received + data.len() as u64 > upload.declared_size {
                return Err(RemoteError::Rejected("chunk past declared size".into()));
            }
            upload.data.extend_from_slice(&data);
            let uploaded_bytes = upload.data.len() as u64;
            let done = uploaded_bytes == upload.declared_size;
            state.relayed_chunks += 1;

            if !done {
                return Ok(ChunkUploadStatus {
                    complete: false,
                    object_id: None,
                    uploaded_bytes,
                });
            }

            let finished = state
                .uploads
                .remove(token)
                .ok_or_else(|| RemoteError::Rejected(format!("unknown session {token}")))?;
            let id = state.store(finished.name, finished.mime_type, finished.data);
            Ok(ChunkUploadStatus {
                complete: true,
                object_id: Some(id),
                uploaded_bytes,
            })
        })
    }

    fn upload_whole_object<'a>(
        &'a self,
        name: &'a str,
        mime_type: &'a str,
        _container_id: &'a str,
        data: Vec<u8>,
    ) -> RemoteFuture<'a, UploadedFile> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.fail_whole_upload {
                return Err(RemoteError::Unavailable("upload refused".into()));
            }
            let id = state.store(name.to_string(), mime_type.to_string(), data);
            state.whole_uploads += 1;
            let (view_link, download_link) = self.links(&id);
            Ok(UploadedFile {
                object_id: id,
                object_name: name.to_string(),
                view_link,
                download_link,
            })
        })
    }

    fn get_object_metadata<'a>(&'a self, object_id: &'a str) -> RemoteFuture<'a, ObjectMetadata> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let object = state
                .objects
                .get(object_id)
                .ok_or_else(|| RemoteError::NotFound(object_id.to_string()))?;
            let (view_link, download_link) = self.links(object_id);
            Ok(ObjectMetadata {
                name: object.name.clone(),
                mime_type: object.mime_type.clone(),
                size: object.data.len() as u64,
                view_link,
                download_link,
            })
        })
    }

    fn read_byte_range<'a>(
        &'a self,
        object_id: &'a str,
        start: u64,
        end_inclusive: u64,
    ) -> RemoteFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let object = state
                .objects
                .get(object_id)
                .ok_or_else(|| RemoteError::NotFound(object_id.to_string()))?;
            let len = object.data.len() as u64;
            if start > end_inclusive || end_inclusive >= len {
                return Err(RemoteError::Rejected(format!(
                    "range {start}-{end_inclusive} not satisfiable for {len} bytes"
                )));
            }
            Ok(object.data[start as usize..=end_inclusive as usize].to_vec())
        })
    }
}

/// Book records held in memory.
#[derive(Default)]
pub struct MemoryEntityStore {
    records: Mutex<HashMap<String, Record>>,
    fail_patches: Mutex<bool>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a record.
    pub async fn insert(&self, entity_id: &str, record: Record) {
        self.records
            .lock()
            .await
            .insert(entity_id.to_string(), record);
    }

    /// Current contents of a record.
    pub async fn record(&self, entity_id: &str) -> Option<Record> {
        self.records.lock().await.get(entity_id).cloned()
    }

    /// Makes `patch_record` fail.
    pub async fn fail_patches(&self, fail: bool) {
        *self.fail_patches.lock().await = fail;
    }
}

impl EntityStore for MemoryEntityStore {
    fn get_record<'a>(&'a self, entity_id: &'a str) -> StoreFuture<'a, Option<Record>> {
        Box::pin(async move { Ok(self.records.lock().await.get(entity_id).cloned()) })
    }

    fn patch_record<'a>(&'a self, entity_id: &'a str, patch: Record) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if *self.fail_patches.lock().await {
                return Err(EntityStoreError::Unavailable("write refused".into()));
            }
            let mut records = self.records.lock().await;
            let record = records.entry(entity_id.to_string()).or_default();
            record.extend(patch);
            Ok(())
        })
    }
}
